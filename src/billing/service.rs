use std::sync::Arc;

use sqlx::PgPool;
use tracing::{info, warn};

use super::cycle::BillingCycle;
use super::error::BillingError;
use super::gateway::{CreateSubscriptionRequest, FrequencyType, GatewayClient, GatewayError};
use super::models::{CancellationSource, Subscription, SubscriptionStatus};
use super::reference::ExternalReference;
use super::store::EntityStore;

const CHECKOUT_CURRENCY: &str = "BRL";

/// key: billing-subscription-service -> gateway-side subscription lifecycle
#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    gateway: Arc<dyn GatewayClient>,
    default_cycle: BillingCycle,
}

impl SubscriptionService {
    pub fn new(pool: PgPool, gateway: Arc<dyn GatewayClient>, default_cycle: BillingCycle) -> Self {
        Self {
            pool,
            gateway,
            default_cycle,
        }
    }

    /// Registers a pending subscription with the gateway. A subscription that
    /// already carries a gateway id is returned unchanged. No row lock is held
    /// while the gateway call is in flight.
    pub async fn start_checkout(
        &self,
        tenant_id: i64,
        subscription_id: i64,
    ) -> Result<Subscription, BillingError> {
        let request = match self.prepare_checkout(tenant_id, subscription_id).await? {
            Checkout::Registered(subscription) => return Ok(subscription),
            Checkout::Create(request) => request,
        };
        let created = self.gateway.create_subscription(&request).await?;

        let mut tx = self.pool.begin().await?;
        let attached = {
            let mut store = EntityStore::new(&mut tx, tenant_id);
            let current = store
                .subscription(subscription_id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("subscription {subscription_id}")))?;
            if current.external_subscription_id.is_some()
                || current.status != SubscriptionStatus::Pending
            {
                None
            } else {
                Some(
                    store
                        .attach_external_subscription(
                            subscription_id,
                            &created.id,
                            &created.status,
                            Some(&request.external_reference),
                        )
                        .await?,
                )
            }
        };
        tx.commit()
            .await
            .map_err(|err| BillingError::from_db(err, format!("subscription {subscription_id}")))?;

        match attached {
            Some(subscription) => {
                info!(
                    %tenant_id,
                    subscription_id,
                    external_subscription_id = %created.id,
                    "subscription registered with gateway"
                );
                Ok(subscription)
            }
            None => {
                // Another checkout or a cancellation won the row meanwhile.
                warn!(
                    %tenant_id,
                    subscription_id,
                    external_subscription_id = %created.id,
                    "subscription changed during checkout; withdrawing gateway subscription"
                );
                if let Err(err) = self.gateway.cancel_subscription(&created.id).await {
                    warn!(
                        ?err,
                        external_subscription_id = %created.id,
                        "failed to withdraw gateway subscription"
                    );
                }
                let mut conn = self.pool.acquire().await?;
                let current = EntityStore::new(&mut conn, tenant_id)
                    .subscription_snapshot(subscription_id)
                    .await?
                    .ok_or_else(|| {
                        BillingError::NotFound(format!("subscription {subscription_id}"))
                    })?;
                if current.external_subscription_id.is_some() {
                    Ok(current)
                } else {
                    Err(BillingError::InvalidState(format!(
                        "subscription {subscription_id} is {:?}, checkout needs pending",
                        current.status
                    )))
                }
            }
        }
    }

    async fn prepare_checkout(
        &self,
        tenant_id: i64,
        subscription_id: i64,
    ) -> Result<Checkout, BillingError> {
        let mut tx = self.pool.begin().await?;
        let checkout = {
            let mut store = EntityStore::new(&mut tx, tenant_id);
            let subscription = store
                .subscription(subscription_id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("subscription {subscription_id}")))?;

            if subscription.external_subscription_id.is_some() {
                return Ok(Checkout::Registered(subscription));
            }
            if subscription.status != SubscriptionStatus::Pending {
                return Err(BillingError::InvalidState(format!(
                    "subscription {subscription_id} is {:?}, checkout needs pending",
                    subscription.status
                )));
            }

            let enrollment = store
                .enrollment(subscription.enrollment_id)
                .await?
                .ok_or_else(|| {
                    BillingError::NotFound(format!("enrollment {}", subscription.enrollment_id))
                })?;
            let plan = store.plan(enrollment.plan_id).await?;
            let cycle = match store.cycle_for(enrollment.plan_id, enrollment.cycle_id).await? {
                Some(row) => BillingCycle::from(&row),
                None => self.default_cycle,
            };
            let (frequency, frequency_type) = frequency_of(&cycle)?;

            let reference = match &subscription.external_reference {
                Some(reference) => reference.clone(),
                None => {
                    let reference = ExternalReference::for_enrollment(enrollment.id);
                    if enrollment.external_reference.is_none() {
                        store
                            .set_enrollment_reference(enrollment.id, &reference)
                            .await?;
                    }
                    reference.to_string()
                }
            };

            Checkout::Create(CreateSubscriptionRequest {
                reason: plan
                    .map(|plan| plan.name)
                    .unwrap_or_else(|| format!("Enrollment {}", enrollment.id)),
                external_reference: reference,
                amount: enrollment.billed_value(),
                currency: CHECKOUT_CURRENCY.to_string(),
                frequency,
                frequency_type,
                start_date: subscription.next_charge_date,
                payer_email: None,
                back_url: None,
            })
        };
        tx.commit()
            .await
            .map_err(|err| BillingError::from_db(err, format!("subscription {subscription_id}")))?;
        Ok(checkout)
    }

    /// Cancels on the gateway first, then locally with `cancelled_by = user`.
    /// The user attribution survives any later gateway notification. The
    /// gateway call runs outside any transaction.
    pub async fn cancel_by_user(
        &self,
        tenant_id: i64,
        subscription_id: i64,
    ) -> Result<Subscription, BillingError> {
        let subscription = {
            let mut conn = self.pool.acquire().await?;
            EntityStore::new(&mut conn, tenant_id)
                .subscription_snapshot(subscription_id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("subscription {subscription_id}")))?
        };
        if is_user_cancelled(&subscription) {
            return Ok(subscription);
        }

        if let Some(external_id) = &subscription.external_subscription_id {
            match self.gateway.cancel_subscription(external_id).await {
                Ok(()) => {}
                Err(GatewayError::NotFound(_)) => warn!(
                    %tenant_id,
                    subscription_id,
                    %external_id,
                    "gateway no longer knows the subscription; cancelling locally"
                ),
                Err(err) => return Err(err.into()),
            }
        }

        let mut tx = self.pool.begin().await?;
        let cancelled = {
            let mut store = EntityStore::new(&mut tx, tenant_id);
            let current = store
                .subscription(subscription_id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("subscription {subscription_id}")))?;
            if is_user_cancelled(&current) {
                return Ok(current);
            }
            let cancelled = store
                .cancel_subscription(subscription_id, CancellationSource::User, None)
                .await?;
            store.cancel_enrollment(current.enrollment_id).await?;
            cancelled
        };
        tx.commit()
            .await
            .map_err(|err| BillingError::from_db(err, format!("subscription {subscription_id}")))?;

        info!(
            %tenant_id,
            subscription_id,
            enrollment_id = cancelled.enrollment_id,
            "subscription cancelled by user"
        );
        Ok(cancelled)
    }
}

enum Checkout {
    Registered(Subscription),
    Create(CreateSubscriptionRequest),
}

fn is_user_cancelled(subscription: &Subscription) -> bool {
    subscription.status == SubscriptionStatus::Cancelled
        && subscription.cancelled_by == Some(CancellationSource::User)
}

fn frequency_of(cycle: &BillingCycle) -> Result<(i32, FrequencyType), BillingError> {
    match (cycle.months, cycle.days) {
        (Some(months), _) if months > 0 => Ok((months, FrequencyType::Months)),
        (_, Some(days)) if days > 0 => Ok((days, FrequencyType::Days)),
        _ => Err(BillingError::InvalidArgument(
            "billing cycle needs a positive month or day count".into(),
        )),
    }
}
