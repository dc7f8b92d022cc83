use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use gym_billing::audit::{query_billing_events, BillingAuditFilter};
use gym_billing::billing::gateway::testing::StaticGatewayClient;
use gym_billing::billing::gateway::CreateSubscriptionRequest;
use gym_billing::billing::models::{
    CancellationSource, ContractStatus, EnrollmentStatus, ReceivableStatus, SubscriptionStatus,
};
use gym_billing::billing::{
    BillingCycle, BillingError, FanOutSettings, GatewayClient, GatewayError, GatewayEventIngestor,
    GatewayResource, MarkPaidRequest, PackageFanOutEngine, PaymentMethodCatalog, PaymentResource,
    ReceivableChainGenerator, ReconciliationEngine, ReconciliationOutcome, SubscriptionResource,
    SubscriptionService,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use sqlx::PgPool;

// key: billing-integration-tests -> reconciliation, fan-out, receivable chain

const TENANT: i64 = 1;
const OTHER_TENANT: i64 = 2;

struct Harness {
    gateway: Arc<StaticGatewayClient>,
    fan_out: PackageFanOutEngine,
    engine: ReconciliationEngine,
    ingestor: GatewayEventIngestor,
}

async fn harness(pool: &PgPool) -> Harness {
    let gateway = Arc::new(StaticGatewayClient::new());
    let catalog = Arc::new(PaymentMethodCatalog::load(pool).await.unwrap());
    let cycle = BillingCycle::months(1);
    let fan_out = PackageFanOutEngine::new(
        pool.clone(),
        FanOutSettings {
            gateway: "static".into(),
            default_cycle: cycle,
        },
    );
    let engine = ReconciliationEngine::new(pool.clone(), "static", catalog, fan_out.clone(), cycle);
    let ingestor = GatewayEventIngestor::new(pool.clone(), gateway.clone(), engine.clone());
    Harness {
        gateway,
        fan_out,
        engine,
        ingestor,
    }
}

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn approved(id: &str, reference: &str, amount: Decimal) -> PaymentResource {
    PaymentResource {
        id: id.into(),
        status: "approved".into(),
        status_detail: Some("accredited".into()),
        external_reference: Some(reference.into()),
        amount: Some(amount),
        approved_at: Some(Utc.with_ymd_and_hms(2026, 3, 10, 14, 0, 0).unwrap()),
        payment_type_id: Some("pix".into()),
    }
}

/// Monthly plan whose cycle allows recurring billing.
async fn seed_plan(pool: &PgPool, tenant_id: i64, value: Decimal) -> i64 {
    let cycle_id: i64 = sqlx::query_scalar(
        "INSERT INTO billing_cycles (tenant_id, name, months, permits_recurring) VALUES ($1, 'Monthly', 1, TRUE) RETURNING id",
    )
    .bind(tenant_id)
    .fetch_one(pool)
    .await
    .unwrap();
    sqlx::query_scalar(
        "INSERT INTO plans (tenant_id, name, value, cycle_id) VALUES ($1, 'Musculação', $2, $3) RETURNING id",
    )
    .bind(tenant_id)
    .bind(value)
    .bind(cycle_id)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn seed_student(pool: &PgPool, tenant_id: i64, user_id: Option<i64>, name: &str) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO students (tenant_id, user_id, name) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(tenant_id)
    .bind(user_id)
    .bind(name)
    .fetch_one(pool)
    .await
    .unwrap()
}

/// Draft recurring enrollment with one awaiting invoice, as a fresh checkout leaves it.
async fn seed_draft_enrollment(
    pool: &PgPool,
    enrollment_id: i64,
    plan_id: i64,
    student_id: i64,
    reference: &str,
) {
    sqlx::query(
        r#"
        INSERT INTO enrollments (
            id, tenant_id, student_id, plan_id, billing_kind, status,
            start_date, due_date, value, external_reference
        ) VALUES ($1, $2, $3, $4, 'recurring', 'draft', '2026-03-10', '2026-03-10', 120.00, $5)
        "#,
    )
    .bind(enrollment_id)
    .bind(TENANT)
    .bind(student_id)
    .bind(plan_id)
    .bind(reference)
    .execute(pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO plan_payments (tenant_id, enrollment_id, amount, due_date) VALUES ($1, $2, 120.00, '2026-03-10')",
    )
    .bind(TENANT)
    .bind(enrollment_id)
    .execute(pool)
    .await
    .unwrap();
}

async fn count(pool: &PgPool, sql: &str, id: i64) -> i64 {
    sqlx::query_scalar(sql).bind(id).fetch_one(pool).await.unwrap()
}

async fn enrollment_status(pool: &PgPool, enrollment_id: i64) -> EnrollmentStatus {
    sqlx::query_scalar("SELECT status FROM enrollments WHERE id = $1")
        .bind(enrollment_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn concurrent_duplicate_push_applies_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let h = harness(&pool).await;
    let plan_id = seed_plan(&pool, TENANT, dec!(120.00)).await;
    let student_id = seed_student(&pool, TENANT, Some(900), "Ana").await;
    seed_draft_enrollment(&pool, 42, plan_id, student_id, "MAT-42-999").await;
    h.gateway
        .insert_payment(approved("p1", "MAT-42-999", dec!(120.00)));

    let body = json!({"type": "payment", "data": {"id": "p1"}});
    let today = day(2026, 3, 10);
    let (first, second) = tokio::join!(
        h.ingestor.handle_push(&body, today),
        h.ingestor.handle_push(&body, today)
    );
    assert!(first.success);
    assert!(second.success);

    let applied = [first.outcome, second.outcome]
        .into_iter()
        .flatten()
        .filter(|outcome| matches!(outcome, ReconciliationOutcome::Applied { .. }))
        .count();
    assert_eq!(applied, 1);

    let ledger_rows: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM gateway_payment_records WHERE external_payment_id = 'p1'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(ledger_rows, 1);
    assert_eq!(enrollment_status(&pool, 42).await, EnrollmentStatus::Active);
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM plan_payments WHERE enrollment_id = $1 AND gateway_payment_id = 'p1' AND status = 'paid'",
            42
        )
        .await,
        1
    );

    let (due_date, awaiting_due): (NaiveDate, NaiveDate) = sqlx::query_as(
        r#"
        SELECT e.due_date, p.due_date
        FROM enrollments e
        JOIN plan_payments p ON p.enrollment_id = e.id AND p.status = 'awaiting'
        WHERE e.id = 42
        "#,
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(due_date, day(2026, 4, 10));
    assert_eq!(awaiting_due, day(2026, 4, 10));

    let audited: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM billing_audit_events WHERE event_type = 'push.payment' AND external_id = 'p1'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(audited, 2);

    let filter = BillingAuditFilter {
        external_id: Some("p1".into()),
        ..Default::default()
    };
    let events = query_billing_events(&pool, TENANT, filter.clone()).await.unwrap();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|event| event.tenant_id == Some(TENANT)));
    assert!(query_billing_events(&pool, OTHER_TENANT, filter)
        .await
        .unwrap()
        .is_empty());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn replayed_payment_repairs_missing_state(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let h = harness(&pool).await;
    let plan_id = seed_plan(&pool, TENANT, dec!(120.00)).await;
    let student_id = seed_student(&pool, TENANT, None, "Bruno").await;
    seed_draft_enrollment(&pool, 7, plan_id, student_id, "MAT-7-abc").await;
    let resource = GatewayResource::Payment(approved("p7", "MAT-7-abc", dec!(120.00)));
    let today = day(2026, 3, 10);

    let first = h.engine.reconcile(&resource, today).await.unwrap();
    assert!(matches!(first, ReconciliationOutcome::Applied { .. }));

    let replay = h.engine.reconcile(&resource, today).await.unwrap();
    assert!(matches!(replay, ReconciliationOutcome::Duplicate { tenant_id: TENANT }));

    // A run that died after the ledger insert leaves the enrollment behind.
    sqlx::query("UPDATE enrollments SET status = 'draft' WHERE id = 7")
        .execute(&pool)
        .await
        .unwrap();
    let repaired = h.engine.reconcile(&resource, today).await.unwrap();
    assert!(matches!(repaired, ReconciliationOutcome::Repaired { .. }));
    assert_eq!(enrollment_status(&pool, 7).await, EnrollmentStatus::Active);

    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM plan_payments WHERE enrollment_id = $1 AND status = 'paid'",
            7
        )
        .await,
        1
    );
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM plan_payments WHERE enrollment_id = $1 AND status = 'awaiting'",
            7
        )
        .await,
        1
    );
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn unknown_reference_is_unresolvable(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let h = harness(&pool).await;
    let resource = GatewayResource::Payment(approved("p404", "MAT-404-x", dec!(10.00)));

    let err = h
        .engine
        .reconcile(&resource, day(2026, 3, 10))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::UnresolvableReference(_)));

    let ledger_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM gateway_payment_records")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(ledger_rows, 0);
}

/// Package of one payer plus two beneficiaries; returns `(contract_id, [payer, b1, b2])`.
async fn seed_contract(pool: &PgPool, total: Decimal, foreign_beneficiary: bool) -> (i64, Vec<i64>) {
    let plan_id = seed_plan(pool, TENANT, dec!(100.00)).await;
    let package_id: i64 = sqlx::query_scalar(
        "INSERT INTO packages (tenant_id, plan_id, name, max_beneficiaries) VALUES ($1, $2, 'Família', 2) RETURNING id",
    )
    .bind(TENANT)
    .bind(plan_id)
    .fetch_one(pool)
    .await
    .unwrap();
    let payer = seed_student(pool, TENANT, Some(500), "Carla").await;
    let first = seed_student(pool, TENANT, None, "Davi").await;
    let second = if foreign_beneficiary {
        seed_student(pool, OTHER_TENANT, None, "Elisa").await
    } else {
        seed_student(pool, TENANT, None, "Elisa").await
    };

    let contract_id: i64 = sqlx::query_scalar(
        "INSERT INTO package_contracts (tenant_id, package_id, payer_user_id, total_value, start_date) VALUES ($1, $2, 500, $3, '2026-01-31') RETURNING id",
    )
    .bind(TENANT)
    .bind(package_id)
    .bind(total)
    .fetch_one(pool)
    .await
    .unwrap();
    for student_id in [first, second] {
        sqlx::query("INSERT INTO beneficiaries (contract_id, student_id) VALUES ($1, $2)")
            .bind(contract_id)
            .bind(student_id)
            .execute(pool)
            .await
            .unwrap();
    }
    (contract_id, vec![payer, first, second])
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn fan_out_is_idempotent(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let h = harness(&pool).await;
    let (contract_id, students) = seed_contract(&pool, dec!(100.00), false).await;
    let today = day(2026, 1, 20);

    let first = h
        .fan_out
        .generate_enrollments(TENANT, contract_id, today)
        .await
        .unwrap();
    assert_eq!(first.status, ContractStatus::Active);
    assert_eq!(first.start_date, day(2026, 1, 31));
    assert_eq!(first.end_date, day(2026, 2, 28));
    let shares: Vec<Decimal> = first
        .participants
        .iter()
        .map(|participant| participant.share_value)
        .collect();
    assert_eq!(shares, vec![dec!(33.33), dec!(33.33), dec!(33.34)]);
    assert_eq!(first.participants[0].student_id, students[0]);

    let second = h
        .fan_out
        .generate_enrollments(TENANT, contract_id, today)
        .await
        .unwrap();
    let ids = |report: &gym_billing::billing::FanOutReport| {
        report
            .participants
            .iter()
            .map(|participant| participant.enrollment_id)
            .collect::<Vec<_>>()
    };
    assert_eq!(ids(&first), ids(&second));
    assert!(second.participants.iter().all(|participant| !participant.created));

    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM enrollments WHERE package_contract_ref = $1",
            contract_id
        )
        .await,
        3
    );
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM plan_payments p JOIN enrollments e ON e.id = p.enrollment_id WHERE e.package_contract_ref = $1",
            contract_id
        )
        .await,
        3
    );
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM subscriptions s JOIN enrollments e ON e.id = s.enrollment_id WHERE e.package_contract_ref = $1 AND s.status = 'pending'",
            contract_id
        )
        .await,
        1
    );
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM beneficiaries WHERE contract_id = $1 AND status = 'active' AND enrollment_ref IS NOT NULL",
            contract_id
        )
        .await,
        2
    );
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn failed_fan_out_leaves_nothing_behind(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let h = harness(&pool).await;
    let (contract_id, students) = seed_contract(&pool, dec!(300.00), true).await;

    let err = h
        .fan_out
        .generate_enrollments(TENANT, contract_id, day(2026, 1, 20))
        .await
        .unwrap_err();
    match err {
        BillingError::FanOut(fan_out) => {
            assert_eq!(fan_out.contract_id, contract_id);
            assert_eq!(fan_out.participants.len(), 1);
            assert_eq!(fan_out.participants[0].student_id, students[2]);
            assert_eq!(fan_out.participants[0].role, "beneficiary");
        }
        other => panic!("expected fan-out failure, got {other:?}"),
    }

    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM enrollments WHERE package_contract_ref = $1",
            contract_id
        )
        .await,
        0
    );
    let status: ContractStatus =
        sqlx::query_scalar("SELECT status FROM package_contracts WHERE id = $1")
            .bind(contract_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, ContractStatus::Pending);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn package_payment_fans_out_pending_contract(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let h = harness(&pool).await;
    let (contract_id, _) = seed_contract(&pool, dec!(300.00), false).await;
    let reference = format!("PKG-{contract_id}-checkout");
    h.gateway
        .insert_payment(approved("pkg-1", &reference, dec!(300.00)));

    let result = h
        .ingestor
        .force_reconcile(TENANT, &reference, day(2026, 1, 31))
        .await
        .unwrap();
    assert_eq!(result.payments_found, 1);
    match &result.outcomes[..] {
        [ReconciliationOutcome::Applied { enrollment_ids, .. }] => {
            assert_eq!(enrollment_ids.len(), 3)
        }
        other => panic!("unexpected outcomes {other:?}"),
    }

    let status: ContractStatus =
        sqlx::query_scalar("SELECT status FROM package_contracts WHERE id = $1")
            .bind(contract_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, ContractStatus::Active);
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM plan_payments p JOIN enrollments e ON e.id = p.enrollment_id WHERE e.package_contract_ref = $1 AND p.status = 'paid' AND p.gateway_payment_id = 'pkg-1'",
            contract_id
        )
        .await,
        3
    );

    let err = h
        .ingestor
        .force_reconcile(OTHER_TENANT, &reference, day(2026, 1, 31))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::UnresolvableReference(_)));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn poll_activates_enrollment_without_webhook(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let h = harness(&pool).await;
    let plan_id = seed_plan(&pool, TENANT, dec!(120.00)).await;
    let student_id = seed_student(&pool, TENANT, None, "Fábio").await;
    seed_draft_enrollment(&pool, 11, plan_id, student_id, "MAT-11-n1").await;
    let today = day(2026, 3, 10);

    let pending = h.ingestor.poll_enrollment(TENANT, 11, today).await.unwrap();
    assert!(!pending.approved);
    assert!(pending.open_payment.is_some());

    h.gateway
        .insert_payment(approved("p11", "MAT-11-n1", dec!(120.00)));
    let polled = h.ingestor.poll_enrollment(TENANT, 11, today).await.unwrap();
    assert!(polled.approved);
    assert_eq!(polled.enrollment.status, EnrollmentStatus::Active);

    h.gateway.set_unavailable(true);
    let cached = h.ingestor.poll_enrollment(TENANT, 11, today).await.unwrap();
    assert!(cached.approved);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn receivable_chain_never_branches(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    sqlx::query(
        "INSERT INTO payment_methods (tenant_id, code, name, discount_percent) VALUES ($1, 'pix', 'Pix', 5)",
    )
    .bind(TENANT)
    .execute(&pool)
    .await
    .unwrap();
    let catalog = Arc::new(PaymentMethodCatalog::load(&pool).await.unwrap());
    let generator = ReceivableChainGenerator::new(pool.clone(), catalog);
    let student_id = seed_student(&pool, TENANT, None, "Gabi").await;
    let account_id: i64 = sqlx::query_scalar(
        "INSERT INTO receivable_accounts (tenant_id, student_id, value, due_date, recurring, interval_days) VALUES ($1, $2, 200.00, '2026-01-15', TRUE, 30) RETURNING id",
    )
    .bind(TENANT)
    .bind(student_id)
    .fetch_one(&pool)
    .await
    .unwrap();

    let request = MarkPaidRequest {
        payment_method: Some("pix".into()),
        paid_date: Some(day(2026, 1, 14)),
    };
    let settlement = generator
        .mark_paid(TENANT, account_id, request.clone(), day(2026, 1, 14))
        .await
        .unwrap();
    assert_eq!(settlement.account.status, ReceivableStatus::Paid);
    assert_eq!(settlement.account.discount_amount, Some(dec!(10.00)));
    assert_eq!(settlement.account.net_value, Some(dec!(190.00)));
    let next = settlement.next.expect("recurring account chains forward");
    assert_eq!(next.origin_id, Some(account_id));
    assert_eq!(next.due_date, day(2026, 2, 14));
    assert_eq!(next.value, dec!(200.00));
    assert_eq!(settlement.account.next_id, Some(next.id));

    let err = generator
        .mark_paid(TENANT, account_id, request, day(2026, 1, 15))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidState(_)));
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM receivable_accounts WHERE origin_id = $1",
            account_id
        )
        .await,
        1
    );

    let foreign = generator
        .mark_paid(OTHER_TENANT, next.id, MarkPaidRequest::default(), day(2026, 2, 1))
        .await
        .unwrap_err();
    assert!(matches!(foreign, BillingError::NotFound(_)));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn user_cancellation_is_sticky(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let h = harness(&pool).await;
    let plan_id = seed_plan(&pool, TENANT, dec!(120.00)).await;
    let student_id = seed_student(&pool, TENANT, None, "Heitor").await;
    seed_draft_enrollment(&pool, 21, plan_id, student_id, "MAT-21-s").await;
    let subscription_id: i64 = sqlx::query_scalar(
        "INSERT INTO subscriptions (tenant_id, enrollment_id, gateway, external_reference, status) VALUES ($1, 21, 'static', 'MAT-21-s', 'pending') RETURNING id",
    )
    .bind(TENANT)
    .fetch_one(&pool)
    .await
    .unwrap();

    let service = SubscriptionService::new(pool.clone(), h.gateway.clone(), BillingCycle::months(1));
    let checkout = service.start_checkout(TENANT, subscription_id).await.unwrap();
    let external_id = checkout.external_subscription_id.clone().unwrap();
    assert_eq!(checkout.external_reference.as_deref(), Some("MAT-21-s"));
    let again = service.start_checkout(TENANT, subscription_id).await.unwrap();
    assert_eq!(again.external_subscription_id, Some(external_id.clone()));

    let cancelled = service.cancel_by_user(TENANT, subscription_id).await.unwrap();
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
    assert_eq!(cancelled.cancelled_by, Some(CancellationSource::User));
    assert_eq!(h.gateway.cancelled_ids(), vec![external_id.clone()]);
    assert_eq!(enrollment_status(&pool, 21).await, EnrollmentStatus::Cancelled);

    let today = day(2026, 3, 10);
    for status in ["cancelled", "authorized"] {
        let resource = GatewayResource::Subscription(SubscriptionResource {
            id: external_id.clone(),
            status: status.into(),
            external_reference: Some("MAT-21-s".into()),
            next_payment_date: None,
            reason: None,
        });
        h.engine.reconcile(&resource, today).await.unwrap();
    }

    let (status, cancelled_by, gateway_status): (SubscriptionStatus, Option<CancellationSource>, Option<String>) =
        sqlx::query_as("SELECT status, cancelled_by, gateway_status FROM subscriptions WHERE id = $1")
            .bind(subscription_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, SubscriptionStatus::Cancelled);
    assert_eq!(cancelled_by, Some(CancellationSource::User));
    assert_eq!(gateway_status.as_deref(), Some("authorized"));
    assert_eq!(enrollment_status(&pool, 21).await, EnrollmentStatus::Cancelled);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn gateway_cancellation_cascades_to_enrollment(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let h = harness(&pool).await;
    let plan_id = seed_plan(&pool, TENANT, dec!(120.00)).await;
    let student_id = seed_student(&pool, TENANT, None, "Iara").await;
    seed_draft_enrollment(&pool, 31, plan_id, student_id, "MAT-31-g").await;
    sqlx::query(
        "INSERT INTO subscriptions (tenant_id, enrollment_id, gateway, external_subscription_id, external_reference, status) VALUES ($1, 31, 'static', 'pre-31', 'MAT-31-g', 'active')",
    )
    .bind(TENANT)
    .execute(&pool)
    .await
    .unwrap();
    h.gateway.insert_subscription(SubscriptionResource {
        id: "pre-31".into(),
        status: "cancelled".into(),
        external_reference: Some("MAT-31-g".into()),
        next_payment_date: None,
        reason: None,
    });

    let ack = h
        .ingestor
        .handle_push(
            &json!({"type": "subscription_preapproval", "data": {"id": "pre-31"}}),
            day(2026, 3, 10),
        )
        .await;
    assert!(ack.success);

    let cancelled_by: Option<CancellationSource> =
        sqlx::query_scalar("SELECT cancelled_by FROM subscriptions WHERE external_subscription_id = 'pre-31'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(cancelled_by, Some(CancellationSource::Gateway));
    assert_eq!(enrollment_status(&pool, 31).await, EnrollmentStatus::Cancelled);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn overdue_enrollment_needs_a_fresh_payment(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let h = harness(&pool).await;
    let plan_id = seed_plan(&pool, TENANT, dec!(120.00)).await;
    let student_id = seed_student(&pool, TENANT, None, "Gael").await;
    seed_draft_enrollment(&pool, 77, plan_id, student_id, "MAT-77-n1").await;
    h.gateway
        .insert_payment(approved("p77", "MAT-77-n1", dec!(120.00)));

    let first = h
        .ingestor
        .poll_enrollment(TENANT, 77, day(2026, 3, 10))
        .await
        .unwrap();
    assert!(first.approved);

    // The April invoice lapses.
    sqlx::query("UPDATE enrollments SET status = 'overdue' WHERE id = 77")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "UPDATE plan_payments SET status = 'overdue' WHERE enrollment_id = 77 AND status = 'awaiting'",
    )
    .execute(&pool)
    .await
    .unwrap();

    let replay = h
        .ingestor
        .poll_enrollment(TENANT, 77, day(2026, 5, 1))
        .await
        .unwrap();
    assert!(!replay.approved);
    assert_eq!(
        replay.outcomes,
        vec![ReconciliationOutcome::Duplicate { tenant_id: TENANT }]
    );
    assert_eq!(enrollment_status(&pool, 77).await, EnrollmentStatus::Overdue);
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM plan_payments WHERE enrollment_id = $1 AND status = 'overdue'",
            77
        )
        .await,
        1
    );

    let mut late = approved("p78", "MAT-77-n1", dec!(120.00));
    late.approved_at = Some(Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap());
    h.gateway.insert_payment(late);

    let settled = h
        .ingestor
        .poll_enrollment(TENANT, 77, day(2026, 5, 1))
        .await
        .unwrap();
    assert!(settled.approved);
    assert_eq!(enrollment_status(&pool, 77).await, EnrollmentStatus::Active);

    let (status, gateway_payment_id): (String, Option<String>) = sqlx::query_as(
        "SELECT status::TEXT, gateway_payment_id FROM plan_payments WHERE enrollment_id = 77 AND due_date = '2026-04-10'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(status, "paid");
    assert_eq!(gateway_payment_id.as_deref(), Some("p78"));

    let due_date: NaiveDate = sqlx::query_scalar("SELECT due_date FROM enrollments WHERE id = 77")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(due_date, day(2026, 5, 10));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn package_payment_credits_each_participant_its_share(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let h = harness(&pool).await;
    let (contract_id, _) = seed_contract(&pool, dec!(300.00), false).await;
    sqlx::query("UPDATE billing_cycles SET permits_recurring = FALSE WHERE tenant_id = $1")
        .bind(TENANT)
        .execute(&pool)
        .await
        .unwrap();
    let reference = format!("PKG-{contract_id}-one-off");
    h.gateway
        .insert_payment(approved("pkg-1", &reference, dec!(300.00)));
    h.gateway
        .insert_payment(approved("pkg-2", &reference, dec!(300.00)));

    let result = h
        .ingestor
        .force_reconcile(TENANT, &reference, day(2026, 1, 31))
        .await
        .unwrap();
    assert_eq!(result.outcomes.len(), 2);

    let paid: Decimal = sqlx::query_scalar(
        "SELECT SUM(p.amount) FROM plan_payments p JOIN enrollments e ON e.id = p.enrollment_id WHERE e.package_contract_ref = $1 AND p.status = 'paid'",
    )
    .bind(contract_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(paid, dec!(600.00));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn locked_contract_reports_conflict(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let h = harness(&pool).await;
    let (contract_id, _) = seed_contract(&pool, dec!(300.00), false).await;

    let mut holder = pool.begin().await.unwrap();
    sqlx::query("SELECT id FROM package_contracts WHERE id = $1 FOR UPDATE")
        .bind(contract_id)
        .fetch_one(&mut *holder)
        .await
        .unwrap();

    let err = h
        .fan_out
        .generate_enrollments(TENANT, contract_id, day(2026, 1, 20))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::ConcurrencyConflict(_)));
    holder.rollback().await.unwrap();

    let status: ContractStatus =
        sqlx::query_scalar("SELECT status FROM package_contracts WHERE id = $1")
            .bind(contract_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, ContractStatus::Pending);
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM enrollments WHERE package_contract_ref = $1",
            contract_id
        )
        .await,
        0
    );
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn repeated_fan_out_keeps_advanced_period(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let h = harness(&pool).await;
    let (contract_id, _) = seed_contract(&pool, dec!(300.00), false).await;
    let today = day(2026, 1, 20);
    h.fan_out
        .generate_enrollments(TENANT, contract_id, today)
        .await
        .unwrap();

    sqlx::query(
        "UPDATE enrollments SET due_date = '2026-03-31', next_due_date = '2026-03-31' WHERE package_contract_ref = $1",
    )
    .bind(contract_id)
    .execute(&pool)
    .await
    .unwrap();

    h.fan_out
        .generate_enrollments(TENANT, contract_id, today)
        .await
        .unwrap();

    let due_dates: Vec<NaiveDate> =
        sqlx::query_scalar("SELECT due_date FROM enrollments WHERE package_contract_ref = $1")
            .bind(contract_id)
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(due_dates.len(), 3);
    assert!(due_dates.iter().all(|due| *due == day(2026, 3, 31)));
}

/// Records whether the subscription row could be locked while each gateway call ran.
struct RowLockCheckingGateway {
    pool: PgPool,
    subscription_id: i64,
    inner: StaticGatewayClient,
    row_free: Mutex<Vec<bool>>,
}

impl RowLockCheckingGateway {
    async fn check_row(&self) {
        let mut tx = self.pool.begin().await.unwrap();
        let free = sqlx::query("SELECT id FROM subscriptions WHERE id = $1 FOR UPDATE NOWAIT")
            .bind(self.subscription_id)
            .fetch_optional(&mut *tx)
            .await
            .is_ok();
        tx.rollback().await.unwrap();
        self.row_free.lock().unwrap().push(free);
    }
}

#[async_trait]
impl GatewayClient for RowLockCheckingGateway {
    fn gateway(&self) -> &str {
        self.inner.gateway()
    }

    async fn get_payment(&self, id: &str) -> Result<PaymentResource, GatewayError> {
        self.inner.get_payment(id).await
    }

    async fn get_subscription(&self, id: &str) -> Result<SubscriptionResource, GatewayError> {
        self.inner.get_subscription(id).await
    }

    async fn find_payments_by_external_reference(
        &self,
        reference: &str,
    ) -> Result<Vec<PaymentResource>, GatewayError> {
        self.inner.find_payments_by_external_reference(reference).await
    }

    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> Result<SubscriptionResource, GatewayError> {
        self.check_row().await;
        self.inner.create_subscription(request).await
    }

    async fn cancel_subscription(&self, id: &str) -> Result<(), GatewayError> {
        self.check_row().await;
        self.inner.cancel_subscription(id).await
    }
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn gateway_calls_run_without_row_lock(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let plan_id = seed_plan(&pool, TENANT, dec!(120.00)).await;
    let student_id = seed_student(&pool, TENANT, None, "Jade").await;
    seed_draft_enrollment(&pool, 41, plan_id, student_id, "MAT-41-l").await;
    let subscription_id: i64 = sqlx::query_scalar(
        "INSERT INTO subscriptions (tenant_id, enrollment_id, gateway, external_reference, status) VALUES ($1, 41, 'static', 'MAT-41-l', 'pending') RETURNING id",
    )
    .bind(TENANT)
    .fetch_one(&pool)
    .await
    .unwrap();

    let gateway = Arc::new(RowLockCheckingGateway {
        pool: pool.clone(),
        subscription_id,
        inner: StaticGatewayClient::new(),
        row_free: Mutex::new(Vec::new()),
    });
    let service = SubscriptionService::new(pool.clone(), gateway.clone(), BillingCycle::months(1));

    let checkout = service.start_checkout(TENANT, subscription_id).await.unwrap();
    assert!(checkout.external_subscription_id.is_some());
    let cancelled = service.cancel_by_user(TENANT, subscription_id).await.unwrap();
    assert_eq!(cancelled.cancelled_by, Some(CancellationSource::User));

    assert_eq!(*gateway.row_free.lock().unwrap(), vec![true, true]);
}
