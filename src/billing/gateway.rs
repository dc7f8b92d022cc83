use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Response, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// key: billing-gateway-errors -> transport vs lookup vs processor failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("gateway unreachable: {0}")]
    Unavailable(String),
    #[error("gateway resource not found: {0}")]
    NotFound(String),
    #[error("gateway rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("failed to decode gateway response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Payment,
    Subscription,
}

impl ResourceKind {
    /// Maps the `type` field of a push notification. Preapprovals are subscriptions.
    pub fn from_notification_type(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "payment" => Some(ResourceKind::Payment),
            "subscription" | "preapproval" | "subscription_preapproval" => {
                Some(ResourceKind::Subscription)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Payment => "payment",
            ResourceKind::Subscription => "subscription",
        }
    }
}

/// Canonical payment state as reported by the processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentResource {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub status_detail: Option<String>,
    #[serde(default)]
    pub external_reference: Option<String>,
    #[serde(default, rename = "transaction_amount")]
    pub amount: Option<Decimal>,
    #[serde(default, rename = "date_approved")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payment_type_id: Option<String>,
}

impl PaymentResource {
    pub fn is_approved(&self) -> bool {
        self.status.eq_ignore_ascii_case("approved")
    }
}

/// Canonical subscription (preapproval) state as reported by the processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionResource {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub external_reference: Option<String>,
    #[serde(default)]
    pub next_payment_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl SubscriptionResource {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.status.to_ascii_lowercase().as_str(),
            "cancelled" | "canceled" | "expired"
        )
    }

    pub fn is_authorized(&self) -> bool {
        matches!(
            self.status.to_ascii_lowercase().as_str(),
            "authorized" | "active"
        )
    }

    pub fn is_paused(&self) -> bool {
        self.status.eq_ignore_ascii_case("paused")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayResource {
    Payment(PaymentResource),
    Subscription(SubscriptionResource),
}

impl GatewayResource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            GatewayResource::Payment(_) => ResourceKind::Payment,
            GatewayResource::Subscription(_) => ResourceKind::Subscription,
        }
    }

    pub fn external_id(&self) -> &str {
        match self {
            GatewayResource::Payment(payment) => &payment.id,
            GatewayResource::Subscription(subscription) => &subscription.id,
        }
    }

    pub fn external_reference(&self) -> Option<&str> {
        match self {
            GatewayResource::Payment(payment) => payment.external_reference.as_deref(),
            GatewayResource::Subscription(subscription) => {
                subscription.external_reference.as_deref()
            }
        }
    }

    pub fn status(&self) -> &str {
        match self {
            GatewayResource::Payment(payment) => &payment.status,
            GatewayResource::Subscription(subscription) => &subscription.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub reason: String,
    pub external_reference: String,
    pub amount: Decimal,
    pub currency: String,
    pub frequency: i32,
    pub frequency_type: FrequencyType,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub payer_email: Option<String>,
    #[serde(default)]
    pub back_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyType {
    Months,
    Days,
}

/// key: billing-gateway-client -> canonical resource lookups against the processor
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Gateway name recorded on ledger rows and subscriptions.
    fn gateway(&self) -> &str;
    async fn get_payment(&self, id: &str) -> Result<PaymentResource, GatewayError>;
    async fn get_subscription(&self, id: &str) -> Result<SubscriptionResource, GatewayError>;
    async fn find_payments_by_external_reference(
        &self,
        reference: &str,
    ) -> Result<Vec<PaymentResource>, GatewayError>;
    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> Result<SubscriptionResource, GatewayError>;
    async fn cancel_subscription(&self, id: &str) -> Result<(), GatewayError>;
}

#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub name: String,
    pub base_url: String,
    pub access_token: Option<String>,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct HttpGatewayClient {
    client: reqwest::Client,
    name: String,
    base_url: String,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentSearchResponse {
    #[serde(default)]
    results: Vec<PaymentResource>,
}

impl HttpGatewayClient {
    pub fn new(config: HttpGatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build payment gateway client")?;
        Ok(Self {
            client,
            name: config.name,
            base_url: config.base_url,
            access_token: config.access_token,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.access_token {
            request.bearer_auth(token)
        } else {
            request
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<Response, GatewayError> {
        let response = self
            .auth(request)
            .send()
            .await
            .map_err(|err| transport_error(err, what))?;
        check_status(response, what).await
    }
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    fn gateway(&self) -> &str {
        &self.name
    }

    async fn get_payment(&self, id: &str) -> Result<PaymentResource, GatewayError> {
        let what = format!("payment {id}");
        let response = self
            .send(self.client.get(self.endpoint(&format!("v1/payments/{id}"))), &what)
            .await?;
        decode(response, &what).await
    }

    async fn get_subscription(&self, id: &str) -> Result<SubscriptionResource, GatewayError> {
        let what = format!("subscription {id}");
        let response = self
            .send(self.client.get(self.endpoint(&format!("preapproval/{id}"))), &what)
            .await?;
        decode(response, &what).await
    }

    async fn find_payments_by_external_reference(
        &self,
        reference: &str,
    ) -> Result<Vec<PaymentResource>, GatewayError> {
        let what = format!("payments for {reference}");
        let request = self
            .client
            .get(self.endpoint("v1/payments/search"))
            .query(&[
                ("external_reference", reference),
                ("sort", "date_created"),
                ("criteria", "desc"),
            ]);
        let response = self.send(request, &what).await?;
        let parsed: PaymentSearchResponse = decode(response, &what).await?;
        Ok(parsed.results)
    }

    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> Result<SubscriptionResource, GatewayError> {
        let what = format!("subscription for {}", request.external_reference);
        let mut auto_recurring = json!({
            "frequency": request.frequency,
            "frequency_type": request.frequency_type,
            "transaction_amount": request.amount.to_f64().unwrap_or_default(),
            "currency_id": request.currency,
        });
        if let Some(start) = request.start_date {
            auto_recurring["start_date"] = json!(format!("{start}T00:00:00.000Z"));
        }
        let mut payload = json!({
            "reason": request.reason,
            "external_reference": request.external_reference,
            "auto_recurring": auto_recurring,
            "status": "pending",
        });
        if let Some(email) = &request.payer_email {
            payload["payer_email"] = json!(email);
        }
        if let Some(back_url) = &request.back_url {
            payload["back_url"] = json!(back_url);
        }

        let response = self
            .send(self.client.post(self.endpoint("preapproval")).json(&payload), &what)
            .await?;
        decode(response, &what).await
    }

    async fn cancel_subscription(&self, id: &str) -> Result<(), GatewayError> {
        let what = format!("subscription {id}");
        self.send(
            self.client
                .put(self.endpoint(&format!("preapproval/{id}")))
                .json(&json!({ "status": "cancelled" })),
            &what,
        )
        .await?;
        Ok(())
    }
}

fn transport_error(err: reqwest::Error, what: &str) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Unavailable(format!("timed out fetching {what}"))
    } else {
        GatewayError::Unavailable(format!("failed to reach gateway for {what}: {err}"))
    }
}

async fn check_status(response: Response, what: &str) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(GatewayError::NotFound(what.to_string()));
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(GatewayError::Unavailable(format!(
            "gateway answered {status} for {what}"
        )));
    }
    Err(GatewayError::Rejected {
        status: status.as_u16(),
        message: extract_message(&body).unwrap_or(body),
    })
}

async fn decode<T: DeserializeOwned>(response: Response, what: &str) -> Result<T, GatewayError> {
    let body = response
        .bytes()
        .await
        .map_err(|err| transport_error(err, what))?;
    serde_json::from_slice(&body).map_err(|err| GatewayError::Decode(format!("{what}: {err}")))
}

fn extract_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("message")
        .and_then(|message| message.as_str())
        .map(|message| message.to_string())
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(value) => Ok(value),
        Value::Number(value) => Ok(value.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or numeric id, got {other}"
        ))),
    }
}

/// In-memory gateway used by integration tests and local development.
pub mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{
        CreateSubscriptionRequest, GatewayClient, GatewayError, PaymentResource,
        SubscriptionResource,
    };

    #[derive(Default)]
    pub struct StaticGatewayClient {
        payments: Mutex<HashMap<String, PaymentResource>>,
        subscriptions: Mutex<HashMap<String, SubscriptionResource>>,
        unavailable: AtomicBool,
        created: AtomicUsize,
        cancelled: Mutex<Vec<String>>,
    }

    impl StaticGatewayClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert_payment(&self, payment: PaymentResource) {
            self.payments
                .lock()
                .expect("payments lock")
                .insert(payment.id.clone(), payment);
        }

        pub fn insert_subscription(&self, subscription: SubscriptionResource) {
            self.subscriptions
                .lock()
                .expect("subscriptions lock")
                .insert(subscription.id.clone(), subscription);
        }

        /// Makes every call fail as if the processor timed out.
        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        pub fn cancelled_ids(&self) -> Vec<String> {
            self.cancelled.lock().expect("cancelled lock").clone()
        }

        fn guard(&self) -> Result<(), GatewayError> {
            if self.unavailable.load(Ordering::SeqCst) {
                Err(GatewayError::Unavailable("static gateway offline".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl GatewayClient for StaticGatewayClient {
        fn gateway(&self) -> &str {
            "static"
        }

        async fn get_payment(&self, id: &str) -> Result<PaymentResource, GatewayError> {
            self.guard()?;
            self.payments
                .lock()
                .expect("payments lock")
                .get(id)
                .cloned()
                .ok_or_else(|| GatewayError::NotFound(format!("payment {id}")))
        }

        async fn get_subscription(&self, id: &str) -> Result<SubscriptionResource, GatewayError> {
            self.guard()?;
            self.subscriptions
                .lock()
                .expect("subscriptions lock")
                .get(id)
                .cloned()
                .ok_or_else(|| GatewayError::NotFound(format!("subscription {id}")))
        }

        async fn find_payments_by_external_reference(
            &self,
            reference: &str,
        ) -> Result<Vec<PaymentResource>, GatewayError> {
            self.guard()?;
            let mut matches: Vec<PaymentResource> = self
                .payments
                .lock()
                .expect("payments lock")
                .values()
                .filter(|payment| payment.external_reference.as_deref() == Some(reference))
                .cloned()
                .collect();
            matches.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(matches)
        }

        async fn create_subscription(
            &self,
            request: &CreateSubscriptionRequest,
        ) -> Result<SubscriptionResource, GatewayError> {
            self.guard()?;
            let sequence = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            let subscription = SubscriptionResource {
                id: format!("preapproval-{sequence}"),
                status: "pending".into(),
                external_reference: Some(request.external_reference.clone()),
                next_payment_date: None,
                reason: Some(request.reason.clone()),
            };
            self.insert_subscription(subscription.clone());
            Ok(subscription)
        }

        async fn cancel_subscription(&self, id: &str) -> Result<(), GatewayError> {
            self.guard()?;
            let mut subscriptions = self.subscriptions.lock().expect("subscriptions lock");
            let Some(subscription) = subscriptions.get_mut(id) else {
                return Err(GatewayError::NotFound(format!("subscription {id}")));
            };
            subscription.status = "cancelled".into();
            self.cancelled
                .lock()
                .expect("cancelled lock")
                .push(id.to_string());
            Ok(())
        }
    }
}
