use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, QueryBuilder};
use tracing::warn;

/// key: audit-billing-outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "billing_audit_outcome", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Applied,
    Duplicate,
    Ignored,
    Failed,
}

/// key: audit-billing-filter
/// Filter envelope for the admin audit listing; always scoped to one tenant.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct BillingAuditFilter {
    pub external_id: Option<String>,
    pub event_type: Option<String>,
    pub outcome: Option<AuditOutcome>,
    pub limit: Option<i64>,
}

/// key: audit-billing-event
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct BillingAuditEvent {
    pub id: i64,
    pub event_type: String,
    pub external_id: String,
    pub tenant_id: Option<i64>,
    pub outcome: AuditOutcome,
    pub detail: Value,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewAuditEvent {
    pub event_type: String,
    pub external_id: String,
    pub tenant_id: Option<i64>,
    pub outcome: AuditOutcome,
    pub detail: Value,
}

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 500;

pub async fn record_billing_event(
    pool: &PgPool,
    event: NewAuditEvent,
) -> Result<BillingAuditEvent, sqlx::Error> {
    sqlx::query_as::<_, BillingAuditEvent>(
        r#"
        INSERT INTO billing_audit_events (event_type, external_id, tenant_id, outcome, detail)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(&event.event_type)
    .bind(&event.external_id)
    .bind(event.tenant_id)
    .bind(event.outcome)
    .bind(&event.detail)
    .fetch_one(pool)
    .await
}

/// Appends an audit row; a failed write is logged and swallowed so it never
/// changes the outcome reported to the caller.
pub async fn record_billing_event_logged(pool: &PgPool, event: NewAuditEvent) {
    let event_type = event.event_type.clone();
    let external_id = event.external_id.clone();
    if let Err(err) = record_billing_event(pool, event).await {
        warn!(
            ?err,
            %event_type,
            %external_id,
            "failed to append billing audit event"
        );
    }
}

pub async fn query_billing_events(
    pool: &PgPool,
    tenant_id: i64,
    filter: BillingAuditFilter,
) -> Result<Vec<BillingAuditEvent>, sqlx::Error> {
    let mut builder = QueryBuilder::new(
        "SELECT id, event_type, external_id, tenant_id, outcome, detail, occurred_at \
         FROM billing_audit_events ",
    );
    builder.push("WHERE tenant_id = ");
    builder.push_bind(tenant_id);

    if let Some(external_id) = filter.external_id {
        builder.push(" AND external_id = ");
        builder.push_bind(external_id);
    }

    if let Some(event_type) = filter.event_type {
        builder.push(" AND event_type = ");
        builder.push_bind(event_type);
    }

    if let Some(outcome) = filter.outcome {
        builder.push(" AND outcome = ");
        builder.push_bind(outcome);
    }

    builder.push(" ORDER BY occurred_at DESC, id DESC");

    let limit = filter.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    builder.push(" LIMIT ");
    builder.push_bind(limit);

    builder
        .build_query_as::<BillingAuditEvent>()
        .fetch_all(pool)
        .await
}
