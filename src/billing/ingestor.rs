use std::str::FromStr;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::audit::{record_billing_event_logged, AuditOutcome, NewAuditEvent};

use super::error::BillingError;
use super::gateway::{GatewayClient, GatewayResource, ResourceKind};
use super::models::{Enrollment, EnrollmentStatus, PlanPayment};
use super::reconciliation::{ReconciliationEngine, ReconciliationOutcome};
use super::reference::ExternalReference;
use super::store::{resolve_reference_tenant, EntityStore};

/// The two fields of a push delivery that are trusted: what to fetch, and its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushNotification {
    pub kind: ResourceKind,
    pub resource_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushParseError {
    Invalid(String),
    /// Well-formed, but a type this service does not reconcile.
    Unsupported(String),
}

impl PushNotification {
    pub fn from_value(body: &Value) -> Result<Self, PushParseError> {
        let raw_type = body
            .get("type")
            .or_else(|| body.get("topic"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| PushParseError::Invalid("missing `type`".into()))?;

        let resource_id = match body.get("data").and_then(|data| data.get("id")) {
            Some(Value::String(id)) if !id.trim().is_empty() => id.trim().to_string(),
            Some(Value::Number(id)) => id.to_string(),
            _ => return Err(PushParseError::Invalid("missing `data.id`".into())),
        };

        let kind = ResourceKind::from_notification_type(raw_type)
            .ok_or_else(|| PushParseError::Unsupported(raw_type.to_string()))?;
        Ok(Self { kind, resource_id })
    }
}

/// Reply to the gateway; only `success` is serialized.
#[derive(Debug, Clone, Serialize)]
pub struct PushAck {
    pub success: bool,
    #[serde(skip)]
    pub outcome: Option<ReconciliationOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollResult {
    pub approved: bool,
    pub enrollment: Enrollment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_payment: Option<PlanPayment>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outcomes: Vec<ReconciliationOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForceReconcileResult {
    pub external_reference: String,
    pub payments_found: usize,
    pub outcomes: Vec<ReconciliationOutcome>,
}

/// key: billing-event-ingestor -> push, poll and force-validate entry points
#[derive(Clone)]
pub struct GatewayEventIngestor {
    pool: PgPool,
    gateway: Arc<dyn GatewayClient>,
    engine: ReconciliationEngine,
}

impl GatewayEventIngestor {
    pub fn new(pool: PgPool, gateway: Arc<dyn GatewayClient>, engine: ReconciliationEngine) -> Self {
        Self {
            pool,
            gateway,
            engine,
        }
    }

    /// Webhook path. Never fails: every problem is logged, audited, and folded into
    /// `success: false` so the gateway does not redeliver.
    pub async fn handle_push(&self, body: &Value, today: NaiveDate) -> PushAck {
        let notification = match PushNotification::from_value(body) {
            Ok(notification) => notification,
            Err(PushParseError::Invalid(reason)) => {
                warn!(%reason, "rejected malformed gateway notification");
                return PushAck {
                    success: false,
                    outcome: None,
                };
            }
            Err(PushParseError::Unsupported(kind)) => {
                warn!(%kind, "ignoring unsupported gateway notification type");
                return PushAck {
                    success: true,
                    outcome: None,
                };
            }
        };

        let event_type = format!("push.{}", notification.kind.as_str());
        let resource = match self.fetch(&notification).await {
            Ok(resource) => resource,
            Err(err) => {
                warn!(
                    ?err,
                    kind = notification.kind.as_str(),
                    external_id = %notification.resource_id,
                    "failed to fetch canonical gateway resource"
                );
                self.audit_failure(&event_type, &notification.resource_id, None, &err)
                    .await;
                return PushAck {
                    success: false,
                    outcome: None,
                };
            }
        };

        match self.engine.reconcile(&resource, today).await {
            Ok(outcome) => {
                self.audit_outcome(&event_type, resource.external_id(), &outcome)
                    .await;
                PushAck {
                    success: true,
                    outcome: Some(outcome),
                }
            }
            Err(err) => {
                let tenant_id = self.tenant_for(&resource).await;
                self.audit_failure(&event_type, resource.external_id(), tenant_id, &err)
                    .await;
                PushAck {
                    success: false,
                    outcome: None,
                }
            }
        }
    }

    /// Pull fallback for a known enrollment. Gateway timeouts surface as
    /// [`BillingError::GatewayUnavailable`], never as "not approved".
    pub async fn poll_enrollment(
        &self,
        tenant_id: i64,
        enrollment_id: i64,
        today: NaiveDate,
    ) -> Result<PollResult, BillingError> {
        let (enrollment, reference) = {
            let mut conn = self.pool.acquire().await?;
            let mut store = EntityStore::new(&mut conn, tenant_id);
            let enrollment = store
                .enrollment(enrollment_id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("enrollment {enrollment_id}")))?;

            if enrollment.status == EnrollmentStatus::Active {
                let open_payment = store.open_plan_payment(enrollment_id).await?;
                return Ok(PollResult {
                    approved: true,
                    enrollment,
                    open_payment,
                    outcomes: Vec::new(),
                });
            }

            let reference = match enrollment.external_reference.clone() {
                Some(reference) => Some(reference),
                None => store
                    .subscription_for_enrollment(enrollment_id)
                    .await?
                    .and_then(|subscription| subscription.external_reference),
            };
            (enrollment, reference)
        };

        let Some(reference) = reference else {
            return self.pending(tenant_id, enrollment).await;
        };

        let outcomes = self
            .reconcile_reference(tenant_id, &reference, "poll.payment", today)
            .await?
            .outcomes;
        let mut conn = self.pool.acquire().await?;
        let mut store = EntityStore::new(&mut conn, tenant_id);
        let enrollment = store
            .enrollment(enrollment.id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("enrollment {enrollment_id}")))?;
        let open_payment = store.open_plan_payment(enrollment_id).await?;
        Ok(PollResult {
            approved: enrollment.status == EnrollmentStatus::Active,
            enrollment,
            open_payment,
            outcomes,
        })
    }

    /// Admin remediation: repeats the poll for a reference, whatever local state says.
    pub async fn force_reconcile(
        &self,
        tenant_id: i64,
        external_reference: &str,
        today: NaiveDate,
    ) -> Result<ForceReconcileResult, BillingError> {
        let reference = ExternalReference::from_str(external_reference)
            .map_err(|err| BillingError::UnresolvableReference(err.to_string()))?;
        let owner = {
            let mut conn = self.pool.acquire().await?;
            resolve_reference_tenant(&mut conn, &reference).await?
        };
        if owner != Some(tenant_id) {
            return Err(BillingError::UnresolvableReference(
                external_reference.trim().to_string(),
            ));
        }
        let result = self
            .reconcile_reference(
                tenant_id,
                external_reference.trim(),
                "force.payment",
                today,
            )
            .await?;
        info!(
            %tenant_id,
            reference = %result.external_reference,
            payments_found = result.payments_found,
            reconciled = result.outcomes.len(),
            "force reconcile completed"
        );
        Ok(result)
    }

    async fn reconcile_reference(
        &self,
        tenant_id: i64,
        reference: &str,
        event_type: &str,
        today: NaiveDate,
    ) -> Result<ForceReconcileResult, BillingError> {
        let payments = match self.gateway.find_payments_by_external_reference(reference).await {
            Ok(payments) => payments,
            Err(err) => {
                let err = BillingError::from(err);
                self.audit_failure(event_type, reference, Some(tenant_id), &err)
                    .await;
                return Err(err);
            }
        };

        let payments_found = payments.len();
        let mut outcomes = Vec::new();
        for payment in payments.into_iter().filter(|payment| payment.is_approved()) {
            let resource = GatewayResource::Payment(payment);
            match self.engine.reconcile(&resource, today).await {
                Ok(outcome) => {
                    self.audit_outcome(event_type, resource.external_id(), &outcome)
                        .await;
                    outcomes.push(outcome);
                }
                Err(err) => {
                    self.audit_failure(event_type, resource.external_id(), Some(tenant_id), &err)
                        .await;
                    return Err(err);
                }
            }
        }

        Ok(ForceReconcileResult {
            external_reference: reference.to_string(),
            payments_found,
            outcomes,
        })
    }

    async fn pending(
        &self,
        tenant_id: i64,
        enrollment: Enrollment,
    ) -> Result<PollResult, BillingError> {
        let mut conn = self.pool.acquire().await?;
        let open_payment = EntityStore::new(&mut conn, tenant_id)
            .open_plan_payment(enrollment.id)
            .await?;
        Ok(PollResult {
            approved: false,
            enrollment,
            open_payment,
            outcomes: Vec::new(),
        })
    }

    async fn fetch(&self, notification: &PushNotification) -> Result<GatewayResource, BillingError> {
        let resource = match notification.kind {
            ResourceKind::Payment => {
                GatewayResource::Payment(self.gateway.get_payment(&notification.resource_id).await?)
            }
            ResourceKind::Subscription => GatewayResource::Subscription(
                self.gateway
                    .get_subscription(&notification.resource_id)
                    .await?,
            ),
        };
        Ok(resource)
    }

    async fn tenant_for(&self, resource: &GatewayResource) -> Option<i64> {
        let reference = resource
            .external_reference()
            .and_then(|raw| ExternalReference::from_str(raw).ok())?;
        let mut conn = self.pool.acquire().await.ok()?;
        resolve_reference_tenant(&mut conn, &reference)
            .await
            .ok()
            .flatten()
    }

    async fn audit_outcome(
        &self,
        event_type: &str,
        external_id: &str,
        outcome: &ReconciliationOutcome,
    ) {
        let audit_outcome = match outcome {
            ReconciliationOutcome::Applied { .. } | ReconciliationOutcome::Repaired { .. } => {
                AuditOutcome::Applied
            }
            ReconciliationOutcome::Duplicate { .. } => AuditOutcome::Duplicate,
            ReconciliationOutcome::Ignored { .. } => AuditOutcome::Ignored,
        };
        record_billing_event_logged(
            &self.pool,
            NewAuditEvent {
                event_type: event_type.to_string(),
                external_id: external_id.to_string(),
                tenant_id: Some(outcome.tenant_id()),
                outcome: audit_outcome,
                detail: serde_json::to_value(outcome).unwrap_or(Value::Null),
            },
        )
        .await;
    }

    async fn audit_failure(
        &self,
        event_type: &str,
        external_id: &str,
        tenant_id: Option<i64>,
        err: &BillingError,
    ) {
        record_billing_event_logged(
            &self.pool,
            NewAuditEvent {
                event_type: event_type.to_string(),
                external_id: external_id.to_string(),
                tenant_id,
                outcome: AuditOutcome::Failed,
                detail: json!({
                    "kind": err.kind().as_str(),
                    "recoverable": err.kind().is_recoverable(),
                    "message": err.to_string(),
                }),
            },
        )
        .await;
    }
}
