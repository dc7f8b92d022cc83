use axum::{
    extract::{Extension, Path, Query},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use super::fanout::{FanOutReport, PackageFanOutEngine};
use super::ingestor::{ForceReconcileResult, GatewayEventIngestor, PollResult};
use super::models::Subscription;
use super::receivables::{MarkPaidRequest, ReceivableChainGenerator, Settlement};
use super::service::SubscriptionService;
use super::store::EntityStore;
use crate::audit::{query_billing_events, BillingAuditEvent, BillingAuditFilter};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

// key: billing-api -> poll, admin fan-out, force-validate, receivables, audit

pub fn routes() -> Router {
    Router::new()
        .route("/subscriptions/approved-today", get(approved_today))
        .route(
            "/admin/package-contracts/:id/generate-enrollments",
            post(generate_enrollments),
        )
        .route("/admin/payments/force-reconcile", post(force_reconcile))
        .route("/admin/receivables/:id/pay", post(pay_receivable))
        .route("/admin/subscriptions/:id/checkout", post(start_checkout))
        .route("/admin/subscriptions/:id/cancel", post(cancel_subscription))
        .route("/admin/billing/audit", get(list_audit_events))
}

#[derive(Debug, Deserialize)]
pub struct ApprovedTodayQuery {
    pub enrollment_id: i64,
}

#[derive(Debug, Serialize)]
pub struct ApprovedTodayResponse {
    pub approved: bool,
    pub data: PollResult,
}

#[derive(Debug, Deserialize)]
pub struct ForceReconcileRequest {
    #[serde(default)]
    pub external_reference: String,
}

async fn approved_today(
    Extension(pool): Extension<PgPool>,
    Extension(ingestor): Extension<GatewayEventIngestor>,
    user: AuthUser,
    Query(query): Query<ApprovedTodayQuery>,
) -> AppResult<Json<ApprovedTodayResponse>> {
    if !user.is_admin() {
        // Students may only poll their own enrollment.
        let mut conn = pool.acquire().await?;
        let mut store = EntityStore::new(&mut conn, user.tenant_id);
        let student_id = store.student_for_user(user.user_id).await?;
        let enrollment = store
            .enrollment(query.enrollment_id)
            .await?
            .ok_or(AppError::NotFound)?;
        if student_id != Some(enrollment.student_id) {
            return Err(AppError::NotFound);
        }
    }

    let result = ingestor
        .poll_enrollment(user.tenant_id, query.enrollment_id, Utc::now().date_naive())
        .await?;
    Ok(Json(ApprovedTodayResponse {
        approved: result.approved,
        data: result,
    }))
}

async fn generate_enrollments(
    Extension(engine): Extension<PackageFanOutEngine>,
    user: AuthUser,
    Path(contract_id): Path<i64>,
) -> AppResult<Json<FanOutReport>> {
    user.require_admin()?;
    let report = engine
        .generate_enrollments(user.tenant_id, contract_id, Utc::now().date_naive())
        .await?;
    Ok(Json(report))
}

async fn force_reconcile(
    Extension(ingestor): Extension<GatewayEventIngestor>,
    user: AuthUser,
    Json(payload): Json<ForceReconcileRequest>,
) -> AppResult<Json<ForceReconcileResult>> {
    user.require_admin()?;
    let reference = payload.external_reference.trim();
    if reference.is_empty() {
        return Err(AppError::BadRequest(
            "external_reference is required".to_string(),
        ));
    }
    let result = ingestor
        .force_reconcile(user.tenant_id, reference, Utc::now().date_naive())
        .await?;
    Ok(Json(result))
}

async fn pay_receivable(
    Extension(generator): Extension<ReceivableChainGenerator>,
    user: AuthUser,
    Path(account_id): Path<i64>,
    payload: Option<Json<MarkPaidRequest>>,
) -> AppResult<Json<Settlement>> {
    user.require_admin()?;
    let request = payload.map(|Json(request)| request).unwrap_or_default();
    let settlement = generator
        .mark_paid(user.tenant_id, account_id, request, Utc::now().date_naive())
        .await?;
    Ok(Json(settlement))
}

async fn start_checkout(
    Extension(service): Extension<SubscriptionService>,
    user: AuthUser,
    Path(subscription_id): Path<i64>,
) -> AppResult<Json<Subscription>> {
    user.require_admin()?;
    Ok(Json(
        service.start_checkout(user.tenant_id, subscription_id).await?,
    ))
}

async fn cancel_subscription(
    Extension(service): Extension<SubscriptionService>,
    user: AuthUser,
    Path(subscription_id): Path<i64>,
) -> AppResult<Json<Subscription>> {
    user.require_admin()?;
    Ok(Json(
        service.cancel_by_user(user.tenant_id, subscription_id).await?,
    ))
}

async fn list_audit_events(
    Extension(pool): Extension<PgPool>,
    user: AuthUser,
    Query(filter): Query<BillingAuditFilter>,
) -> AppResult<Json<Vec<BillingAuditEvent>>> {
    user.require_admin()?;
    let events = query_billing_events(&pool, user.tenant_id, filter).await?;
    Ok(Json(events))
}

