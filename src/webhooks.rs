use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use sqlx::PgPool;
use thiserror::Error;
use tracing::warn;

use crate::audit::{record_billing_event_logged, AuditOutcome, NewAuditEvent};
use crate::billing::{GatewayEventIngestor, PushAck};

/// Shared secret for push signatures; `None` disables verification.
#[derive(Clone, Default)]
pub struct WebhookSecret(pub Option<String>);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing x-signature header")]
    MissingSignature,
    #[error("missing x-request-id header")]
    MissingRequestId,
    #[error("malformed x-signature header")]
    Malformed,
    #[error("signature mismatch")]
    Mismatch,
}

/// key: webhooks-payments -> gateway push entrypoint
///
/// Always answers 200; the body only says whether the event was applied.
pub async fn payment_webhook(
    Extension(ingestor): Extension<GatewayEventIngestor>,
    Extension(secret): Extension<WebhookSecret>,
    Extension(pool): Extension<PgPool>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<PushAck>) {
    let rejected = || {
        (
            StatusCode::OK,
            Json(PushAck {
                success: false,
                outcome: None,
            }),
        )
    };

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(?err, "gateway notification body is not JSON");
            return rejected();
        }
    };

    if let Some(secret) = secret.0.as_deref() {
        if let Some(data_id) = data_id(&payload) {
            if let Err(err) = verify_signature(secret, &headers, &data_id) {
                warn!(%err, external_id = %data_id, "gateway notification failed signature check");
                record_billing_event_logged(
                    &pool,
                    NewAuditEvent {
                        event_type: "push.signature".to_string(),
                        external_id: data_id,
                        tenant_id: None,
                        outcome: AuditOutcome::Failed,
                        detail: json!({ "reason": err.to_string() }),
                    },
                )
                .await;
                return rejected();
            }
        }
    }

    let ack = ingestor.handle_push(&payload, Utc::now().date_naive()).await;
    (StatusCode::OK, Json(ack))
}

fn data_id(payload: &Value) -> Option<String> {
    match payload.get("data")?.get("id")? {
        Value::String(id) => Some(id.trim().to_string()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Checks `x-signature: ts=<ts>,v1=<hex>` against the HMAC-SHA256 of
/// `id:{data.id};request-id:{x-request-id};ts:{ts};`.
pub fn verify_signature(
    secret: &str,
    headers: &HeaderMap,
    data_id: &str,
) -> Result<(), SignatureError> {
    let signature = headers
        .get("x-signature")
        .and_then(|value| value.to_str().ok())
        .ok_or(SignatureError::MissingSignature)?;
    let request_id = headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .ok_or(SignatureError::MissingRequestId)?;

    let mut ts = None;
    let mut v1 = None;
    for part in signature.split(',') {
        match part.trim().split_once('=') {
            Some(("ts", value)) => ts = Some(value.trim()),
            Some(("v1", value)) => v1 = Some(value.trim()),
            _ => {}
        }
    }
    let (Some(ts), Some(v1)) = (ts, v1) else {
        return Err(SignatureError::Malformed);
    };
    let expected = hex::decode(v1).map_err(|_| SignatureError::Malformed)?;

    let manifest = signature_manifest(data_id, request_id, ts);
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Malformed)?;
    mac.update(manifest.as_bytes());
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

pub fn signature_manifest(data_id: &str, request_id: &str, ts: &str) -> String {
    format!("id:{data_id};request-id:{request_id};ts:{ts};")
}
