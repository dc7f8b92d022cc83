use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};

use super::error::BillingError;
use super::gateway::PaymentResource;
use super::models::{
    Beneficiary, BillingCycleRow, BillingKind, CancellationSource, Enrollment,
    GatewayPaymentRecord, Package, PackageContract, Plan, PlanPayment, ReceivableAccount,
    Subscription, SubscriptionStatus,
};
use super::reference::ExternalReference;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Block until the row lock is granted.
    Wait,
    /// Fail immediately with a concurrency conflict when the row is locked.
    NoWait,
}

#[derive(Debug, Clone)]
pub struct NewEnrollment {
    pub student_id: i64,
    pub plan_id: i64,
    pub cycle_id: Option<i64>,
    pub billing_kind: BillingKind,
    pub start_date: NaiveDate,
    pub due_date: NaiveDate,
    pub next_due_date: Option<NaiveDate>,
    pub value: Decimal,
    pub prorated_value: Option<Decimal>,
    pub package_contract_ref: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub enrollment_id: i64,
    pub gateway: String,
    pub external_reference: String,
    pub next_charge_date: Option<NaiveDate>,
    pub billing_day: Option<i32>,
}

/// key: billing-entity-store -> tenant-scoped access to billing rows
///
/// Borrows a connection (normally an open transaction) for the lifetime of one
/// unit of work. Every statement is parameterised by the tenant the store was
/// opened for, so rows of other tenants are invisible through it.
pub struct EntityStore<'c> {
    conn: &'c mut PgConnection,
    tenant_id: i64,
}

impl<'c> EntityStore<'c> {
    pub fn new(conn: &'c mut PgConnection, tenant_id: i64) -> Self {
        Self { conn, tenant_id }
    }

    pub fn tenant_id(&self) -> i64 {
        self.tenant_id
    }

    pub async fn student_exists(&mut self, student_id: i64) -> Result<bool, BillingError> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT id FROM students WHERE id = $1 AND tenant_id = $2")
                .bind(student_id)
                .bind(self.tenant_id)
                .fetch_optional(&mut *self.conn)
                .await?;
        Ok(found.is_some())
    }

    pub async fn student_for_user(&mut self, user_id: i64) -> Result<Option<i64>, BillingError> {
        let student_id = sqlx::query_scalar(
            "SELECT id FROM students WHERE user_id = $1 AND tenant_id = $2 ORDER BY id LIMIT 1",
        )
        .bind(user_id)
        .bind(self.tenant_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(student_id)
    }

    pub async fn plan(&mut self, plan_id: i64) -> Result<Option<Plan>, BillingError> {
        let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1 AND tenant_id = $2")
            .bind(plan_id)
            .bind(self.tenant_id)
            .fetch_optional(&mut *self.conn)
            .await?;
        Ok(plan)
    }

    pub async fn package(&mut self, package_id: i64) -> Result<Option<Package>, BillingError> {
        let package =
            sqlx::query_as::<_, Package>("SELECT * FROM packages WHERE id = $1 AND tenant_id = $2")
                .bind(package_id)
                .bind(self.tenant_id)
                .fetch_optional(&mut *self.conn)
                .await?;
        Ok(package)
    }

    pub async fn billing_cycle(
        &mut self,
        cycle_id: i64,
    ) -> Result<Option<BillingCycleRow>, BillingError> {
        let cycle = sqlx::query_as::<_, BillingCycleRow>(
            "SELECT * FROM billing_cycles WHERE id = $1 AND tenant_id = $2",
        )
        .bind(cycle_id)
        .bind(self.tenant_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(cycle)
    }

    /// Cycle governing an enrollment: its own cycle, else the plan's.
    pub async fn cycle_for(
        &mut self,
        plan_id: i64,
        cycle_id: Option<i64>,
    ) -> Result<Option<BillingCycleRow>, BillingError> {
        let cycle_id = match cycle_id {
            Some(id) => Some(id),
            None => self.plan(plan_id).await?.and_then(|plan| plan.cycle_id),
        };
        match cycle_id {
            Some(id) => self.billing_cycle(id).await,
            None => Ok(None),
        }
    }

    // Enrollments

    pub async fn enrollment(&mut self, enrollment_id: i64) -> Result<Option<Enrollment>, BillingError> {
        let enrollment = sqlx::query_as::<_, Enrollment>(
            "SELECT * FROM enrollments WHERE id = $1 AND tenant_id = $2",
        )
        .bind(enrollment_id)
        .bind(self.tenant_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(enrollment)
    }

    pub async fn enrollment_for_update(
        &mut self,
        enrollment_id: i64,
    ) -> Result<Option<Enrollment>, BillingError> {
        let enrollment = sqlx::query_as::<_, Enrollment>(
            "SELECT * FROM enrollments WHERE id = $1 AND tenant_id = $2 FOR UPDATE",
        )
        .bind(enrollment_id)
        .bind(self.tenant_id)
        .fetch_optional(&mut *self.conn)
        .await
        .map_err(|err| BillingError::from_db(err, format!("enrollment {enrollment_id}")))?;
        Ok(enrollment)
    }

    pub async fn contract_enrollment_for_student(
        &mut self,
        contract_id: i64,
        student_id: i64,
    ) -> Result<Option<Enrollment>, BillingError> {
        let enrollment = sqlx::query_as::<_, Enrollment>(
            r#"
            SELECT * FROM enrollments
            WHERE package_contract_ref = $1 AND student_id = $2 AND tenant_id = $3
            "#,
        )
        .bind(contract_id)
        .bind(student_id)
        .bind(self.tenant_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(enrollment)
    }

    pub async fn contract_enrollments(
        &mut self,
        contract_id: i64,
    ) -> Result<Vec<Enrollment>, BillingError> {
        let enrollments = sqlx::query_as::<_, Enrollment>(
            r#"
            SELECT * FROM enrollments
            WHERE package_contract_ref = $1 AND tenant_id = $2
            ORDER BY id
            "#,
        )
        .bind(contract_id)
        .bind(self.tenant_id)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(enrollments)
    }

    pub async fn insert_enrollment(
        &mut self,
        enrollment: &NewEnrollment,
    ) -> Result<Enrollment, BillingError> {
        let row = sqlx::query_as::<_, Enrollment>(
            r#"
            INSERT INTO enrollments (
                tenant_id,
                student_id,
                plan_id,
                cycle_id,
                billing_kind,
                status,
                start_date,
                due_date,
                next_due_date,
                value,
                prorated_value,
                package_contract_ref
            ) VALUES ($1, $2, $3, $4, $5, 'active', $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(self.tenant_id)
        .bind(enrollment.student_id)
        .bind(enrollment.plan_id)
        .bind(enrollment.cycle_id)
        .bind(enrollment.billing_kind)
        .bind(enrollment.start_date)
        .bind(enrollment.due_date)
        .bind(enrollment.next_due_date)
        .bind(enrollment.value)
        .bind(enrollment.prorated_value)
        .bind(enrollment.package_contract_ref)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(row)
    }

    /// Re-applies package terms to an existing package enrollment and marks it active.
    pub async fn refresh_package_enrollment(
        &mut self,
        enrollment_id: i64,
        share: Decimal,
        start_date: NaiveDate,
        due_date: NaiveDate,
    ) -> Result<Enrollment, BillingError> {
        let row = sqlx::query_as::<_, Enrollment>(
            r#"
            UPDATE enrollments
            SET value = $3,
                prorated_value = $3,
                start_date = $4,
                due_date = $5,
                next_due_date = $5,
                status = 'active',
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            RETURNING *
            "#,
        )
        .bind(enrollment_id)
        .bind(self.tenant_id)
        .bind(share)
        .bind(start_date)
        .bind(due_date)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(row)
    }

    pub async fn set_enrollment_share(
        &mut self,
        enrollment_id: i64,
        share: Decimal,
    ) -> Result<Enrollment, BillingError> {
        let row = sqlx::query_as::<_, Enrollment>(
            r#"
            UPDATE enrollments
            SET value = $3, prorated_value = $3, updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            RETURNING *
            "#,
        )
        .bind(enrollment_id)
        .bind(self.tenant_id)
        .bind(share)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(row)
    }

    pub async fn set_enrollment_reference(
        &mut self,
        enrollment_id: i64,
        reference: &ExternalReference,
    ) -> Result<(), BillingError> {
        sqlx::query(
            r#"
            UPDATE enrollments
            SET external_reference = $3, updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(enrollment_id)
        .bind(self.tenant_id)
        .bind(reference.to_string())
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    /// Moves a draft or overdue enrollment to `active`. Returns `None` when the
    /// enrollment was in any other state, which is left untouched.
    pub async fn activate_enrollment(
        &mut self,
        enrollment_id: i64,
    ) -> Result<Option<Enrollment>, BillingError> {
        let row = sqlx::query_as::<_, Enrollment>(
            r#"
            UPDATE enrollments
            SET status = 'active', updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND status IN ('draft', 'overdue')
            RETURNING *
            "#,
        )
        .bind(enrollment_id)
        .bind(self.tenant_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(row)
    }

    pub async fn set_enrollment_period(
        &mut self,
        enrollment_id: i64,
        due_date: NaiveDate,
        next_due_date: NaiveDate,
    ) -> Result<Enrollment, BillingError> {
        let row = sqlx::query_as::<_, Enrollment>(
            r#"
            UPDATE enrollments
            SET due_date = $3, next_due_date = $4, updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            RETURNING *
            "#,
        )
        .bind(enrollment_id)
        .bind(self.tenant_id)
        .bind(due_date)
        .bind(next_due_date)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(row)
    }

    pub async fn cancel_enrollment(
        &mut self,
        enrollment_id: i64,
    ) -> Result<Option<Enrollment>, BillingError> {
        let row = sqlx::query_as::<_, Enrollment>(
            r#"
            UPDATE enrollments
            SET status = 'cancelled', updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND status NOT IN ('cancelled', 'expired')
            RETURNING *
            "#,
        )
        .bind(enrollment_id)
        .bind(self.tenant_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(row)
    }

    // Plan payments

    pub async fn plan_payment_settled_by(
        &mut self,
        enrollment_id: i64,
        gateway_payment_id: &str,
    ) -> Result<Option<PlanPayment>, BillingError> {
        let payment = sqlx::query_as::<_, PlanPayment>(
            r#"
            SELECT * FROM plan_payments
            WHERE enrollment_id = $1 AND tenant_id = $2 AND gateway_payment_id = $3
            "#,
        )
        .bind(enrollment_id)
        .bind(self.tenant_id)
        .bind(gateway_payment_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(payment)
    }

    pub async fn open_plan_payment(
        &mut self,
        enrollment_id: i64,
    ) -> Result<Option<PlanPayment>, BillingError> {
        let payment = sqlx::query_as::<_, PlanPayment>(
            r#"
            SELECT * FROM plan_payments
            WHERE enrollment_id = $1 AND tenant_id = $2 AND status IN ('awaiting', 'overdue')
            ORDER BY due_date, id
            LIMIT 1
            "#,
        )
        .bind(enrollment_id)
        .bind(self.tenant_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(payment)
    }

    pub async fn has_overdue_plan_payment(
        &mut self,
        enrollment_id: i64,
    ) -> Result<bool, BillingError> {
        let overdue: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM plan_payments
                WHERE enrollment_id = $1 AND tenant_id = $2 AND status = 'overdue'
            )
            "#,
        )
        .bind(enrollment_id)
        .bind(self.tenant_id)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(overdue)
    }

    pub async fn plan_payment_for_period(
        &mut self,
        enrollment_id: i64,
        due_date: NaiveDate,
    ) -> Result<Option<PlanPayment>, BillingError> {
        let payment = sqlx::query_as::<_, PlanPayment>(
            r#"
            SELECT * FROM plan_payments
            WHERE enrollment_id = $1 AND tenant_id = $2 AND due_date = $3
              AND status <> 'cancelled'
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(enrollment_id)
        .bind(self.tenant_id)
        .bind(due_date)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(payment)
    }

    pub async fn insert_plan_payment(
        &mut self,
        enrollment_id: i64,
        amount: Decimal,
        due_date: NaiveDate,
    ) -> Result<PlanPayment, BillingError> {
        let payment = sqlx::query_as::<_, PlanPayment>(
            r#"
            INSERT INTO plan_payments (tenant_id, enrollment_id, amount, due_date, status)
            VALUES ($1, $2, $3, $4, 'awaiting')
            RETURNING *
            "#,
        )
        .bind(self.tenant_id)
        .bind(enrollment_id)
        .bind(amount)
        .bind(due_date)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(payment)
    }

    /// Settles the oldest open invoice of an enrollment on behalf of one gateway payment.
    pub async fn settle_oldest_open_payment(
        &mut self,
        enrollment_id: i64,
        paid_date: NaiveDate,
        method: Option<&str>,
        gateway_payment_id: &str,
    ) -> Result<Option<PlanPayment>, BillingError> {
        let payment = sqlx::query_as::<_, PlanPayment>(
            r#"
            UPDATE plan_payments
            SET status = 'paid',
                paid_date = $3,
                method = $4,
                gateway_payment_id = $5,
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM plan_payments
                WHERE enrollment_id = $1 AND tenant_id = $2 AND status IN ('awaiting', 'overdue')
                ORDER BY due_date, id
                LIMIT 1
                FOR UPDATE
            )
            RETURNING *
            "#,
        )
        .bind(enrollment_id)
        .bind(self.tenant_id)
        .bind(paid_date)
        .bind(method)
        .bind(gateway_payment_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(payment)
    }

    /// Records a gateway payment that arrived with no open invoice to settle.
    pub async fn insert_settled_plan_payment(
        &mut self,
        enrollment_id: i64,
        amount: Decimal,
        paid_date: NaiveDate,
        method: Option<&str>,
        gateway_payment_id: &str,
    ) -> Result<PlanPayment, BillingError> {
        let payment = sqlx::query_as::<_, PlanPayment>(
            r#"
            INSERT INTO plan_payments (
                tenant_id,
                enrollment_id,
                amount,
                due_date,
                paid_date,
                status,
                method,
                gateway_payment_id
            ) VALUES ($1, $2, $3, $4, $4, 'paid', $5, $6)
            RETURNING *
            "#,
        )
        .bind(self.tenant_id)
        .bind(enrollment_id)
        .bind(amount)
        .bind(paid_date)
        .bind(method)
        .bind(gateway_payment_id)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(payment)
    }

    // Subscriptions

    pub async fn subscription(
        &mut self,
        subscription_id: i64,
    ) -> Result<Option<Subscription>, BillingError> {
        let subscription = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE id = $1 AND tenant_id = $2 FOR UPDATE",
        )
        .bind(subscription_id)
        .bind(self.tenant_id)
        .fetch_optional(&mut *self.conn)
        .await
        .map_err(|err| BillingError::from_db(err, format!("subscription {subscription_id}")))?;
        Ok(subscription)
    }

    /// Unlocked read, for callers that must not hold the row across a gateway call.
    pub async fn subscription_snapshot(
        &mut self,
        subscription_id: i64,
    ) -> Result<Option<Subscription>, BillingError> {
        let subscription = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE id = $1 AND tenant_id = $2",
        )
        .bind(subscription_id)
        .bind(self.tenant_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(subscription)
    }

    /// Most recent subscription of an enrollment, whatever its status.
    pub async fn subscription_for_enrollment(
        &mut self,
        enrollment_id: i64,
    ) -> Result<Option<Subscription>, BillingError> {
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE enrollment_id = $1 AND tenant_id = $2
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(enrollment_id)
        .bind(self.tenant_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(subscription)
    }

    pub async fn insert_subscription(
        &mut self,
        subscription: &NewSubscription,
    ) -> Result<Subscription, BillingError> {
        let row = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions (
                tenant_id,
                enrollment_id,
                gateway,
                external_reference,
                status,
                next_charge_date,
                billing_day
            ) VALUES ($1, $2, $3, $4, 'pending', $5, $6)
            RETURNING *
            "#,
        )
        .bind(self.tenant_id)
        .bind(subscription.enrollment_id)
        .bind(&subscription.gateway)
        .bind(&subscription.external_reference)
        .bind(subscription.next_charge_date)
        .bind(subscription.billing_day)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(row)
    }

    /// Records an approved charge. A user cancellation is never undone here.
    pub async fn record_subscription_charge(
        &mut self,
        subscription_id: i64,
        charged_on: NaiveDate,
        next_charge_date: Option<NaiveDate>,
    ) -> Result<Subscription, BillingError> {
        let row = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET status = CASE
                    WHEN cancelled_by IS NOT NULL THEN status
                    ELSE 'active'::subscription_status
                END,
                gateway_status = 'approved',
                last_charge_date = $3,
                next_charge_date = COALESCE($4, next_charge_date),
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .bind(self.tenant_id)
        .bind(charged_on)
        .bind(next_charge_date)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(row)
    }

    pub async fn update_subscription_gateway_state(
        &mut self,
        subscription_id: i64,
        gateway_status: &str,
        status: SubscriptionStatus,
        next_charge_date: Option<NaiveDate>,
    ) -> Result<Subscription, BillingError> {
        let row = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET gateway_status = $3,
                status = $4,
                next_charge_date = COALESCE($5, next_charge_date),
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .bind(self.tenant_id)
        .bind(gateway_status)
        .bind(status)
        .bind(next_charge_date)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(row)
    }

    /// Cancels a subscription. An existing `cancelled_by` attribution is kept.
    pub async fn cancel_subscription(
        &mut self,
        subscription_id: i64,
        source: CancellationSource,
        gateway_status: Option<&str>,
    ) -> Result<Subscription, BillingError> {
        let row = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET status = 'cancelled',
                cancelled_by = COALESCE(cancelled_by, $3),
                gateway_status = COALESCE($4, gateway_status),
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .bind(self.tenant_id)
        .bind(source)
        .bind(gateway_status)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(row)
    }

    pub async fn attach_external_subscription(
        &mut self,
        subscription_id: i64,
        external_subscription_id: &str,
        gateway_status: &str,
        external_reference: Option<&str>,
    ) -> Result<Subscription, BillingError> {
        let row = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET external_subscription_id = $3,
                gateway_status = $4,
                external_reference = COALESCE(external_reference, $5),
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .bind(self.tenant_id)
        .bind(external_subscription_id)
        .bind(gateway_status)
        .bind(external_reference)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(row)
    }

    // Package contracts

    pub async fn lock_contract(
        &mut self,
        contract_id: i64,
        mode: LockMode,
    ) -> Result<Option<PackageContract>, BillingError> {
        let sql = match mode {
            LockMode::Wait => {
                "SELECT * FROM package_contracts WHERE id = $1 AND tenant_id = $2 FOR UPDATE"
            }
            LockMode::NoWait => {
                "SELECT * FROM package_contracts WHERE id = $1 AND tenant_id = $2 FOR UPDATE NOWAIT"
            }
        };
        let contract = sqlx::query_as::<_, PackageContract>(sql)
            .bind(contract_id)
            .bind(self.tenant_id)
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(|err| BillingError::from_db(err, format!("package contract {contract_id}")))?;
        Ok(contract)
    }

    pub async fn activate_contract(
        &mut self,
        contract_id: i64,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<PackageContract, BillingError> {
        let contract = sqlx::query_as::<_, PackageContract>(
            r#"
            UPDATE package_contracts
            SET status = 'active', start_date = $3, end_date = $4, updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            RETURNING *
            "#,
        )
        .bind(contract_id)
        .bind(self.tenant_id)
        .bind(start_date)
        .bind(end_date)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(contract)
    }

    pub async fn beneficiaries(&mut self, contract_id: i64) -> Result<Vec<Beneficiary>, BillingError> {
        let rows = sqlx::query_as::<_, Beneficiary>(
            r#"
            SELECT b.* FROM beneficiaries b
            JOIN package_contracts c ON c.id = b.contract_id
            WHERE b.contract_id = $1 AND c.tenant_id = $2
            ORDER BY b.id
            "#,
        )
        .bind(contract_id)
        .bind(self.tenant_id)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows)
    }

    pub async fn activate_beneficiary(
        &mut self,
        beneficiary_id: i64,
        enrollment_id: i64,
        share: Decimal,
    ) -> Result<(), BillingError> {
        sqlx::query(
            r#"
            UPDATE beneficiaries b
            SET status = 'active', enrollment_ref = $3, prorated_value = $4
            FROM package_contracts c
            WHERE b.id = $1 AND c.id = b.contract_id AND c.tenant_id = $2
            "#,
        )
        .bind(beneficiary_id)
        .bind(self.tenant_id)
        .bind(enrollment_id)
        .bind(share)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    // Receivables

    pub async fn receivable_for_update(
        &mut self,
        account_id: i64,
    ) -> Result<Option<ReceivableAccount>, BillingError> {
        let account = sqlx::query_as::<_, ReceivableAccount>(
            "SELECT * FROM receivable_accounts WHERE id = $1 AND tenant_id = $2 FOR UPDATE",
        )
        .bind(account_id)
        .bind(self.tenant_id)
        .fetch_optional(&mut *self.conn)
        .await
        .map_err(|err| BillingError::from_db(err, format!("receivable {account_id}")))?;
        Ok(account)
    }

    pub async fn settle_receivable(
        &mut self,
        account_id: i64,
        paid_date: NaiveDate,
        payment_method: Option<&str>,
        discount_amount: Decimal,
        net_value: Decimal,
    ) -> Result<ReceivableAccount, BillingError> {
        let account = sqlx::query_as::<_, ReceivableAccount>(
            r#"
            UPDATE receivable_accounts
            SET status = 'paid',
                paid_date = $3,
                payment_method = $4,
                discount_amount = $5,
                net_value = $6,
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            RETURNING *
            "#,
        )
        .bind(account_id)
        .bind(self.tenant_id)
        .bind(paid_date)
        .bind(payment_method)
        .bind(discount_amount)
        .bind(net_value)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(account)
    }

    /// Inserts the successor of `origin`, carrying forward student, plan, value and interval.
    pub async fn insert_chained_receivable(
        &mut self,
        origin: &ReceivableAccount,
        due_date: NaiveDate,
    ) -> Result<ReceivableAccount, BillingError> {
        let account = sqlx::query_as::<_, ReceivableAccount>(
            r#"
            INSERT INTO receivable_accounts (
                tenant_id,
                student_id,
                plan_id,
                value,
                due_date,
                status,
                recurring,
                interval_days,
                origin_id
            ) VALUES ($1, $2, $3, $4, $5, 'pending', TRUE, $6, $7)
            RETURNING *
            "#,
        )
        .bind(self.tenant_id)
        .bind(origin.student_id)
        .bind(origin.plan_id)
        .bind(origin.value)
        .bind(due_date)
        .bind(origin.interval_days)
        .bind(origin.id)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(account)
    }

    pub async fn link_receivable(
        &mut self,
        account_id: i64,
        next_id: i64,
    ) -> Result<ReceivableAccount, BillingError> {
        let account = sqlx::query_as::<_, ReceivableAccount>(
            r#"
            UPDATE receivable_accounts
            SET next_id = $3, updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND next_id IS NULL
            RETURNING *
            "#,
        )
        .bind(account_id)
        .bind(self.tenant_id)
        .bind(next_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        account.ok_or_else(|| {
            BillingError::InvalidState(format!("receivable {account_id} is already chained"))
        })
    }
}

// Gateway ledger and reference resolution are the only unscoped lookups.

/// Inserts the ledger row for a gateway payment. Returns `None` when another
/// transaction already recorded the same `(gateway, external_payment_id)`.
pub async fn insert_gateway_payment_record(
    conn: &mut PgConnection,
    tenant_id: i64,
    gateway: &str,
    external_reference: &str,
    payment: &PaymentResource,
) -> Result<Option<GatewayPaymentRecord>, BillingError> {
    let record = sqlx::query_as::<_, GatewayPaymentRecord>(
        r#"
        INSERT INTO gateway_payment_records (
            tenant_id,
            gateway,
            external_payment_id,
            external_reference,
            status,
            amount,
            approved_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (gateway, external_payment_id) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(tenant_id)
    .bind(gateway)
    .bind(&payment.id)
    .bind(external_reference)
    .bind(&payment.status)
    .bind(payment.amount)
    .bind(payment.approved_at)
    .fetch_optional(conn)
    .await?;
    Ok(record)
}

/// Tenant that owns the entity named by an external reference.
pub async fn resolve_reference_tenant(
    conn: &mut PgConnection,
    reference: &ExternalReference,
) -> Result<Option<i64>, BillingError> {
    let tenant_id = match reference {
        ExternalReference::Enrollment { enrollment_id, .. } => {
            sqlx::query_scalar("SELECT tenant_id FROM enrollments WHERE id = $1")
                .bind(*enrollment_id)
                .fetch_optional(conn)
                .await?
        }
        ExternalReference::Package { contract_id, .. } => {
            sqlx::query_scalar("SELECT tenant_id FROM package_contracts WHERE id = $1")
                .bind(*contract_id)
                .fetch_optional(conn)
                .await?
        }
    };
    Ok(tenant_id)
}

/// Tenant owning the subscription matching either the gateway id or the reference.
pub async fn resolve_subscription_tenant(
    conn: &mut PgConnection,
    gateway: &str,
    external_subscription_id: &str,
    external_reference: Option<&str>,
) -> Result<Option<(i64, i64)>, BillingError> {
    let row: Option<(i64, i64)> = sqlx::query_as(
        r#"
        SELECT id, tenant_id FROM subscriptions
        WHERE (gateway = $1 AND external_subscription_id = $2)
           OR ($3::TEXT IS NOT NULL AND external_reference = $3)
        ORDER BY (external_subscription_id = $2) DESC NULLS LAST, id DESC
        LIMIT 1
        "#,
    )
    .bind(gateway)
    .bind(external_subscription_id)
    .bind(external_reference)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

// Scheduler sweeps run across tenants and touch only status columns.

pub async fn mark_overdue_enrollments(
    pool: &PgPool,
    cutoff: NaiveDate,
) -> Result<Vec<(i64, i64)>, BillingError> {
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        r#"
        UPDATE enrollments
        SET status = 'overdue', updated_at = NOW()
        WHERE status = 'active' AND due_date < $1
        RETURNING id, tenant_id
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn mark_overdue_plan_payments(
    pool: &PgPool,
    cutoff: NaiveDate,
) -> Result<u64, BillingError> {
    let result = sqlx::query(
        r#"
        UPDATE plan_payments
        SET status = 'overdue', updated_at = NOW()
        WHERE status = 'awaiting' AND due_date < $1
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn mark_overdue_receivables(
    pool: &PgPool,
    cutoff: NaiveDate,
) -> Result<u64, BillingError> {
    let result = sqlx::query(
        r#"
        UPDATE receivable_accounts
        SET status = 'overdue', updated_at = NOW()
        WHERE status = 'pending' AND due_date < $1
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn expire_contracts(
    pool: &PgPool,
    today: NaiveDate,
) -> Result<Vec<PackageContract>, BillingError> {
    let contracts = sqlx::query_as::<_, PackageContract>(
        r#"
        UPDATE package_contracts
        SET status = 'expired', updated_at = NOW()
        WHERE status = 'active' AND end_date IS NOT NULL AND end_date < $1
        RETURNING *
        "#,
    )
    .bind(today)
    .fetch_all(pool)
    .await?;
    Ok(contracts)
}

/// Draft enrollments with an issued checkout reference, as `(tenant_id, enrollment_id)`.
pub async fn poll_candidates(
    pool: &PgPool,
    since: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<(i64, i64)>, BillingError> {
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        r#"
        SELECT tenant_id, id FROM enrollments
        WHERE status = 'draft'
          AND external_reference IS NOT NULL
          AND updated_at >= $1
        ORDER BY updated_at
        LIMIT $2
        "#,
    )
    .bind(since)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub fn approval_date(approved_at: Option<DateTime<Utc>>, today: NaiveDate) -> NaiveDate {
    approved_at.map(|instant| instant.date_naive()).unwrap_or(today)
}
