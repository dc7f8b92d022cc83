use std::str::FromStr;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{error, info, warn};

use super::catalog::PaymentMethodCatalog;
use super::cycle::{next_date, BillingCycle};
use super::error::BillingError;
use super::fanout::PackageFanOutEngine;
use super::gateway::{GatewayResource, PaymentResource, SubscriptionResource};
use super::models::{
    BillingKind, CancellationSource, ContractStatus, Enrollment, EnrollmentStatus,
    SubscriptionStatus,
};
use super::reference::ExternalReference;
use super::store::{
    approval_date, insert_gateway_payment_record, resolve_reference_tenant,
    resolve_subscription_tenant, EntityStore, LockMode,
};

/// key: billing-reconciliation-outcome -> what one `reconcile` call changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconciliationOutcome {
    /// First sighting of the resource; local state updated.
    Applied {
        tenant_id: i64,
        enrollment_ids: Vec<i64>,
    },
    /// Already recorded, but dependent state was missing and has been repaired.
    Repaired {
        tenant_id: i64,
        enrollment_ids: Vec<i64>,
    },
    /// Already recorded and fully applied; nothing changed.
    Duplicate { tenant_id: i64 },
    /// Recorded but not actionable (e.g. payment not approved yet).
    Ignored { tenant_id: i64, reason: String },
}

impl ReconciliationOutcome {
    pub fn tenant_id(&self) -> i64 {
        match self {
            ReconciliationOutcome::Applied { tenant_id, .. }
            | ReconciliationOutcome::Repaired { tenant_id, .. }
            | ReconciliationOutcome::Duplicate { tenant_id }
            | ReconciliationOutcome::Ignored { tenant_id, .. } => *tenant_id,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationOutcome::Applied { .. } => "applied",
            ReconciliationOutcome::Repaired { .. } => "repaired",
            ReconciliationOutcome::Duplicate { .. } => "duplicate",
            ReconciliationOutcome::Ignored { .. } => "ignored",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Changed,
    Unchanged,
    Skipped,
}

/// key: billing-reconciliation -> single idempotent apply path for gateway resources
///
/// Webhook, poll and force-validate all land here. Every call runs in one
/// transaction and converges on the same end state however often it repeats.
#[derive(Clone)]
pub struct ReconciliationEngine {
    pool: PgPool,
    gateway: String,
    catalog: Arc<PaymentMethodCatalog>,
    fan_out: PackageFanOutEngine,
    default_cycle: BillingCycle,
}

impl ReconciliationEngine {
    pub fn new(
        pool: PgPool,
        gateway: impl Into<String>,
        catalog: Arc<PaymentMethodCatalog>,
        fan_out: PackageFanOutEngine,
        default_cycle: BillingCycle,
    ) -> Self {
        Self {
            pool,
            gateway: gateway.into(),
            catalog,
            fan_out,
            default_cycle,
        }
    }

    pub async fn reconcile(
        &self,
        resource: &GatewayResource,
        today: NaiveDate,
    ) -> Result<ReconciliationOutcome, BillingError> {
        let result = match resource {
            GatewayResource::Payment(payment) => self.reconcile_payment(payment, today).await,
            GatewayResource::Subscription(subscription) => {
                self.reconcile_subscription(subscription).await
            }
        };
        if let Err(err) = &result {
            match err {
                BillingError::UnresolvableReference(_) => error!(
                    kind = resource.kind().as_str(),
                    external_id = %resource.external_id(),
                    ?err,
                    "gateway resource does not map to a local entity"
                ),
                err if err.kind().is_recoverable() => warn!(
                    kind = resource.kind().as_str(),
                    external_id = %resource.external_id(),
                    ?err,
                    "reconciliation deferred"
                ),
                err => error!(
                    kind = resource.kind().as_str(),
                    external_id = %resource.external_id(),
                    ?err,
                    "reconciliation aborted"
                ),
            }
        }
        result
    }

    async fn reconcile_payment(
        &self,
        payment: &PaymentResource,
        today: NaiveDate,
    ) -> Result<ReconciliationOutcome, BillingError> {
        let raw_reference = payment
            .external_reference
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                BillingError::UnresolvableReference(format!("payment {} has none", payment.id))
            })?;
        let reference = ExternalReference::from_str(raw_reference)
            .map_err(|err| BillingError::UnresolvableReference(err.to_string()))?;

        let mut tx = self.pool.begin().await?;
        let tenant_id = resolve_reference_tenant(&mut tx, &reference)
            .await?
            .ok_or_else(|| BillingError::UnresolvableReference(raw_reference.to_string()))?;

        let recorded =
            insert_gateway_payment_record(&mut tx, tenant_id, &self.gateway, raw_reference, payment)
                .await?
                .is_some();
        if !recorded {
            warn!(
                %tenant_id,
                external_id = %payment.id,
                "gateway payment already recorded; verifying dependent state"
            );
        }

        let outcome = {
            let mut store = EntityStore::new(&mut tx, tenant_id);
            if !payment.is_approved() {
                ReconciliationOutcome::Ignored {
                    tenant_id,
                    reason: format!("payment status `{}`", payment.status),
                }
            } else {
                let (enrollment_ids, changed) = self
                    .apply_approval(&mut store, &reference, raw_reference, payment, today)
                    .await?;
                match (recorded, changed) {
                    (true, _) => ReconciliationOutcome::Applied {
                        tenant_id,
                        enrollment_ids,
                    },
                    (false, true) => ReconciliationOutcome::Repaired {
                        tenant_id,
                        enrollment_ids,
                    },
                    (false, false) => ReconciliationOutcome::Duplicate { tenant_id },
                }
            }
        };

        tx.commit()
            .await
            .map_err(|err| BillingError::from_db(err, format!("gateway payment {}", payment.id)))?;

        if let ReconciliationOutcome::Applied { enrollment_ids, .. }
        | ReconciliationOutcome::Repaired { enrollment_ids, .. } = &outcome
        {
            info!(
                %tenant_id,
                external_id = %payment.id,
                reference = %raw_reference,
                ?enrollment_ids,
                outcome = outcome.as_str(),
                "gateway payment reconciled"
            );
        }
        Ok(outcome)
    }

    async fn apply_approval(
        &self,
        store: &mut EntityStore<'_>,
        reference: &ExternalReference,
        raw_reference: &str,
        payment: &PaymentResource,
        today: NaiveDate,
    ) -> Result<(Vec<i64>, bool), BillingError> {
        let targets = match reference {
            ExternalReference::Enrollment { enrollment_id, .. } => {
                let enrollment = store
                    .enrollment_for_update(*enrollment_id)
                    .await?
                    .ok_or_else(|| BillingError::UnresolvableReference(raw_reference.to_string()))?;
                vec![enrollment]
            }
            ExternalReference::Package { contract_id, .. } => {
                let contract = store
                    .lock_contract(*contract_id, LockMode::Wait)
                    .await?
                    .ok_or_else(|| BillingError::UnresolvableReference(raw_reference.to_string()))?;
                if contract.status == ContractStatus::Pending {
                    self.fan_out
                        .fan_out(store, *contract_id, today, LockMode::Wait)
                        .await?;
                }
                store.contract_enrollments(*contract_id).await?
            }
        };

        let mut touched = Vec::with_capacity(targets.len());
        let mut changed = false;
        for enrollment in targets {
            let applied = self
                .apply_to_enrollment(store, &enrollment, reference, raw_reference, payment, today)
                .await?;
            if applied != Applied::Skipped {
                touched.push(enrollment.id);
            }
            changed |= applied == Applied::Changed;
        }
        Ok((touched, changed))
    }

    /// Ensures one enrollment reflects an approved payment. Each step checks
    /// before writing, so a repeat only fills in what an earlier run missed.
    async fn apply_to_enrollment(
        &self,
        store: &mut EntityStore<'_>,
        enrollment: &Enrollment,
        reference: &ExternalReference,
        raw_reference: &str,
        payment: &PaymentResource,
        today: NaiveDate,
    ) -> Result<Applied, BillingError> {
        if enrollment.status.is_terminal() {
            warn!(
                tenant_id = store.tenant_id(),
                enrollment_id = enrollment.id,
                status = ?enrollment.status,
                external_id = %payment.id,
                "approved payment for a closed enrollment left unapplied"
            );
            return Ok(Applied::Skipped);
        }

        let mut changed = false;
        let cycle = match store.cycle_for(enrollment.plan_id, enrollment.cycle_id).await? {
            Some(row) => BillingCycle::from(&row),
            None => self.default_cycle,
        };
        let paid_date = approval_date(payment.approved_at, today);
        let method = payment
            .payment_type_id
            .as_deref()
            .map(|kind| self.catalog.method_for_gateway_type(store.tenant_id(), kind));

        let already_settled = store
            .plan_payment_settled_by(enrollment.id, &payment.id)
            .await?;
        let newly_settled = already_settled.is_none();
        let period_end = match already_settled {
            Some(settled) => next_date(settled.due_date, &cycle)?,
            None => {
                let settled = store
                    .settle_oldest_open_payment(enrollment.id, paid_date, method.as_deref(), &payment.id)
                    .await?;
                let period_start = match settled {
                    Some(settled) => settled.due_date,
                    None => {
                        // A package payment covers the whole contract; each
                        // participant is credited only its own share.
                        let amount = match reference {
                            ExternalReference::Enrollment { .. } => {
                                payment.amount.unwrap_or_else(|| enrollment.billed_value())
                            }
                            ExternalReference::Package { .. } => enrollment.billed_value(),
                        };
                        store
                            .insert_settled_plan_payment(
                                enrollment.id,
                                amount,
                                paid_date,
                                method.as_deref(),
                                &payment.id,
                            )
                            .await?;
                        paid_date
                    }
                };
                let period_end = next_date(period_start, &cycle)?;
                store
                    .set_enrollment_period(enrollment.id, period_end, period_end)
                    .await?;
                changed = true;
                period_end
            }
        };

        if enrollment.billing_kind == BillingKind::Recurring {
            let has_open = store.open_plan_payment(enrollment.id).await?.is_some();
            let has_next = store
                .plan_payment_for_period(enrollment.id, period_end)
                .await?
                .is_some();
            if !has_open && !has_next {
                store
                    .insert_plan_payment(enrollment.id, enrollment.billed_value(), period_end)
                    .await?;
                changed = true;
            }
        }

        // A replayed payment only restores `active` while the period it paid
        // for is still running and nothing newer has lapsed.
        let lapsed = store.has_overdue_plan_payment(enrollment.id).await?;
        let covers_current_period = !lapsed && (newly_settled || period_end > today);
        if !covers_current_period && enrollment.status != EnrollmentStatus::Active {
            warn!(
                tenant_id = store.tenant_id(),
                enrollment_id = enrollment.id,
                external_id = %payment.id,
                %period_end,
                "approved payment does not cover the current period; status left as is"
            );
        } else if let Some(activated) = store.activate_enrollment(enrollment.id).await? {
            info!(
                tenant_id = store.tenant_id(),
                enrollment_id = activated.id,
                external_id = %payment.id,
                "enrollment activated"
            );
            changed = true;
        }

        if let Some(subscription) = store.subscription_for_enrollment(enrollment.id).await? {
            let matches_reference = match reference {
                ExternalReference::Enrollment { .. } => true,
                ExternalReference::Package { .. } => {
                    subscription.external_reference.as_deref() == Some(raw_reference)
                }
            };
            let needs_update = newly_settled
                || subscription.gateway_status.as_deref() != Some("approved")
                || (subscription.status != SubscriptionStatus::Active
                    && subscription.cancelled_by.is_none());
            if matches_reference && needs_update && covers_current_period {
                store
                    .record_subscription_charge(subscription.id, today, Some(period_end))
                    .await?;
                changed = true;
            }
        }

        Ok(if changed {
            Applied::Changed
        } else {
            Applied::Unchanged
        })
    }

    async fn reconcile_subscription(
        &self,
        resource: &SubscriptionResource,
    ) -> Result<ReconciliationOutcome, BillingError> {
        let mut tx = self.pool.begin().await?;
        let (subscription_id, tenant_id) = resolve_subscription_tenant(
            &mut tx,
            &self.gateway,
            &resource.id,
            resource.external_reference.as_deref(),
        )
        .await?
        .ok_or_else(|| {
            BillingError::UnresolvableReference(
                resource
                    .external_reference
                    .clone()
                    .unwrap_or_else(|| format!("subscription {}", resource.id)),
            )
        })?;

        let outcome = {
            let mut store = EntityStore::new(&mut tx, tenant_id);
            let local = store
                .subscription(subscription_id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("subscription {subscription_id}")))?;

            if local.external_subscription_id.is_none() {
                store
                    .attach_external_subscription(local.id, &resource.id, &resource.status, None)
                    .await?;
            }

            let next_charge = resource
                .next_payment_date
                .map(|instant| instant.date_naive());
            let unchanged = local.gateway_status.as_deref() == Some(resource.status.as_str());

            if resource.is_cancelled() {
                let already_cancelled = local.status == SubscriptionStatus::Cancelled;
                store
                    .cancel_subscription(
                        local.id,
                        CancellationSource::Gateway,
                        Some(&resource.status),
                    )
                    .await?;
                let cancelled_enrollment = store.cancel_enrollment(local.enrollment_id).await?;
                if already_cancelled && cancelled_enrollment.is_none() && unchanged {
                    ReconciliationOutcome::Duplicate { tenant_id }
                } else {
                    info!(
                        %tenant_id,
                        subscription_id = local.id,
                        enrollment_id = local.enrollment_id,
                        cancelled_by = ?local.cancelled_by.unwrap_or(CancellationSource::Gateway),
                        "subscription cancelled from gateway notification"
                    );
                    ReconciliationOutcome::Applied {
                        tenant_id,
                        enrollment_ids: vec![local.enrollment_id],
                    }
                }
            } else {
                let status = if local.status == SubscriptionStatus::Cancelled {
                    SubscriptionStatus::Cancelled
                } else if resource.is_authorized() {
                    SubscriptionStatus::Active
                } else if resource.is_paused() {
                    SubscriptionStatus::Paused
                } else {
                    local.status
                };
                if unchanged && status == local.status {
                    ReconciliationOutcome::Duplicate { tenant_id }
                } else {
                    store
                        .update_subscription_gateway_state(
                            local.id,
                            &resource.status,
                            status,
                            next_charge,
                        )
                        .await?;
                    ReconciliationOutcome::Applied {
                        tenant_id,
                        enrollment_ids: vec![local.enrollment_id],
                    }
                }
            }
        };

        tx.commit().await.map_err(|err| {
            BillingError::from_db(err, format!("gateway subscription {}", resource.id))
        })?;
        Ok(outcome)
    }
}
