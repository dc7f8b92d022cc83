use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};

use super::ingestor::GatewayEventIngestor;
use super::store::{
    expire_contracts, mark_overdue_enrollments, mark_overdue_plan_payments,
    mark_overdue_receivables, poll_candidates,
};

const POLL_BATCH_SIZE: i64 = 200;

#[derive(Debug, Clone)]
pub struct BillingSettings {
    pub scan_interval: TokioDuration,
    pub overdue_grace_days: i64,
    pub poll_lookback_hours: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub enrollments_overdue: usize,
    pub plan_payments_overdue: u64,
    pub receivables_overdue: u64,
    pub contracts_expired: usize,
    pub polled: usize,
    pub activated: usize,
}

/// key: billing-automation-scheduler -> overdue marking and poll fallback
pub fn spawn(pool: PgPool, ingestor: GatewayEventIngestor, settings: BillingSettings) {
    tokio::spawn(async move {
        let mut ticker = time::interval(settings.scan_interval);
        loop {
            ticker.tick().await;
            match process_tick(&pool, &ingestor, Utc::now(), &settings).await {
                Ok(report) if report != TickReport::default() => {
                    info!(?report, "billing automation tick completed")
                }
                Ok(_) => debug!("billing automation tick found nothing to do"),
                Err(err) => warn!(?err, "billing automation tick failed"),
            }
        }
    });
}

/// key: billing-automation-scheduler -> tick handler
///
/// Every step is independent; a failing step is logged and the tick moves on.
pub async fn process_tick(
    pool: &PgPool,
    ingestor: &GatewayEventIngestor,
    now: DateTime<Utc>,
    settings: &BillingSettings,
) -> Result<TickReport> {
    let today = now.date_naive();
    let cutoff = today - Duration::days(settings.overdue_grace_days.max(0));
    let mut report = TickReport::default();

    match mark_overdue_enrollments(pool, cutoff).await {
        Ok(rows) => {
            for (enrollment_id, tenant_id) in &rows {
                info!(%tenant_id, enrollment_id, "enrollment marked overdue");
            }
            report.enrollments_overdue = rows.len();
        }
        Err(err) => warn!(?err, "failed to mark overdue enrollments"),
    }

    match mark_overdue_plan_payments(pool, cutoff).await {
        Ok(count) => report.plan_payments_overdue = count,
        Err(err) => warn!(?err, "failed to mark overdue plan payments"),
    }

    match mark_overdue_receivables(pool, cutoff).await {
        Ok(count) => report.receivables_overdue = count,
        Err(err) => warn!(?err, "failed to mark overdue receivables"),
    }

    match expire_contracts(pool, today).await {
        Ok(contracts) => {
            for contract in &contracts {
                info!(
                    tenant_id = contract.tenant_id,
                    contract_id = contract.id,
                    end_date = ?contract.end_date,
                    "package contract expired"
                );
            }
            report.contracts_expired = contracts.len();
        }
        Err(err) => warn!(?err, "failed to expire package contracts"),
    }

    let since = now - Duration::hours(settings.poll_lookback_hours.max(0));
    let candidates = poll_candidates(pool, since, POLL_BATCH_SIZE).await?;
    for (tenant_id, enrollment_id) in candidates {
        report.polled += 1;
        match ingestor.poll_enrollment(tenant_id, enrollment_id, today).await {
            Ok(result) if result.approved => {
                report.activated += 1;
                info!(
                    %tenant_id,
                    enrollment_id,
                    "poll fallback activated enrollment"
                );
            }
            Ok(_) => {}
            Err(err) if err.kind().is_recoverable() => {
                warn!(?err, %tenant_id, enrollment_id, "poll fallback deferred");
            }
            Err(err) => warn!(?err, %tenant_id, enrollment_id, "poll fallback failed"),
        }
    }

    Ok(report)
}
