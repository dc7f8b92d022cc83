use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::info;

use super::catalog::PaymentMethodCatalog;
use super::cycle::add_days;
use super::error::BillingError;
use super::models::{ReceivableAccount, ReceivableStatus};
use super::proration::apply_discount;
use super::store::EntityStore;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MarkPaidRequest {
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub paid_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Settlement {
    pub account: ReceivableAccount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<ReceivableAccount>,
}

/// key: billing-receivable-chain -> settle and roll recurring receivables forward
#[derive(Clone)]
pub struct ReceivableChainGenerator {
    pool: PgPool,
    catalog: Arc<PaymentMethodCatalog>,
}

impl ReceivableChainGenerator {
    pub fn new(pool: PgPool, catalog: Arc<PaymentMethodCatalog>) -> Self {
        Self { pool, catalog }
    }

    /// Marks an account paid and, for recurring accounts with an interval, links
    /// exactly one successor. Settling a paid or cancelled account is rejected.
    pub async fn mark_paid(
        &self,
        tenant_id: i64,
        account_id: i64,
        request: MarkPaidRequest,
        today: NaiveDate,
    ) -> Result<Settlement, BillingError> {
        let mut tx = self.pool.begin().await?;
        let settlement = {
            let mut store = EntityStore::new(&mut tx, tenant_id);
            let current = store
                .receivable_for_update(account_id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("receivable {account_id}")))?;

            match current.status {
                ReceivableStatus::Paid => {
                    return Err(BillingError::InvalidState(format!(
                        "receivable {account_id} is already paid"
                    )))
                }
                ReceivableStatus::Cancelled => {
                    return Err(BillingError::InvalidState(format!(
                        "receivable {account_id} is cancelled"
                    )))
                }
                ReceivableStatus::Pending | ReceivableStatus::Overdue => {}
            }

            let method = request
                .payment_method
                .as_deref()
                .map(str::trim)
                .filter(|method| !method.is_empty());
            let discount_percent = method
                .map(|code| self.catalog.discount_percent(tenant_id, code))
                .unwrap_or_default();
            let (discount, net) = apply_discount(current.value, discount_percent)?;
            let paid_date = request.paid_date.unwrap_or(today);

            let account = store
                .settle_receivable(account_id, paid_date, method, discount, net)
                .await?;

            let next = match (current.recurring, current.interval_days) {
                (true, Some(interval)) if current.next_id.is_none() => {
                    let due_date = add_days(current.due_date, interval)?;
                    let next = store.insert_chained_receivable(&current, due_date).await?;
                    store.link_receivable(account_id, next.id).await?;
                    Some(next)
                }
                _ => None,
            };
            let account = match &next {
                Some(next) => ReceivableAccount {
                    next_id: Some(next.id),
                    ..account
                },
                None => account,
            };
            Settlement { account, next }
        };
        tx.commit()
            .await
            .map_err(|err| BillingError::from_db(err, format!("receivable {account_id}")))?;

        info!(
            %tenant_id,
            account_id,
            next_id = ?settlement.next.as_ref().map(|next| next.id),
            net_value = %settlement.account.net_value.unwrap_or_default(),
            "receivable settled"
        );
        Ok(settlement)
    }
}
