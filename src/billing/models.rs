use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "billing_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillingKind {
    Recurring,
    OneOff,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "enrollment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Draft,
    Active,
    Overdue,
    Cancelled,
    Expired,
}

impl EnrollmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnrollmentStatus::Cancelled | EnrollmentStatus::Expired)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Paused,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "cancellation_source", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CancellationSource {
    User,
    System,
    Gateway,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "plan_payment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlanPaymentStatus {
    Awaiting,
    Paid,
    Overdue,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "contract_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Pending,
    Active,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "beneficiary_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BeneficiaryStatus {
    Pending,
    Active,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "receivable_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReceivableStatus {
    Pending,
    Paid,
    Cancelled,
    Overdue,
}

/// key: billing-enrollment-model -> student binding to a plan period
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: i64,
    pub tenant_id: i64,
    pub student_id: i64,
    pub plan_id: i64,
    pub cycle_id: Option<i64>,
    pub billing_kind: BillingKind,
    pub status: EnrollmentStatus,
    pub start_date: NaiveDate,
    pub due_date: NaiveDate,
    pub next_due_date: Option<NaiveDate>,
    pub value: Decimal,
    pub prorated_value: Option<Decimal>,
    pub package_contract_ref: Option<i64>,
    pub external_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    /// Amount billed per period; the prorated share wins over the list value.
    pub fn billed_value(&self) -> Decimal {
        self.prorated_value.unwrap_or(self.value)
    }
}

/// key: billing-subscription-model -> recurring agreement with the gateway
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub tenant_id: i64,
    pub enrollment_id: i64,
    pub gateway: String,
    pub external_subscription_id: Option<String>,
    pub external_reference: Option<String>,
    pub status: SubscriptionStatus,
    pub gateway_status: Option<String>,
    pub next_charge_date: Option<NaiveDate>,
    pub last_charge_date: Option<NaiveDate>,
    pub billing_day: Option<i32>,
    pub cancelled_by: Option<CancellationSource>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// key: billing-plan-payment-model -> one invoice per billing period
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PlanPayment {
    pub id: i64,
    pub tenant_id: i64,
    pub enrollment_id: i64,
    pub amount: Decimal,
    pub due_date: NaiveDate,
    pub paid_date: Option<NaiveDate>,
    pub status: PlanPaymentStatus,
    pub method: Option<String>,
    pub write_off_kind: Option<String>,
    pub gateway_payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// key: billing-gateway-ledger -> immutable mirror of processed gateway payments
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct GatewayPaymentRecord {
    pub id: i64,
    pub tenant_id: i64,
    pub gateway: String,
    pub external_payment_id: String,
    pub external_reference: String,
    pub status: String,
    pub amount: Option<Decimal>,
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PackageContract {
    pub id: i64,
    pub tenant_id: i64,
    pub package_id: i64,
    pub payer_user_id: i64,
    pub status: ContractStatus,
    pub total_value: Decimal,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Beneficiary {
    pub id: i64,
    pub contract_id: i64,
    pub student_id: i64,
    pub status: BeneficiaryStatus,
    pub enrollment_ref: Option<i64>,
    pub prorated_value: Option<Decimal>,
}

/// key: billing-receivable-model -> generic recurring invoice chain
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ReceivableAccount {
    pub id: i64,
    pub tenant_id: i64,
    pub student_id: i64,
    pub plan_id: Option<i64>,
    pub value: Decimal,
    pub due_date: NaiveDate,
    pub status: ReceivableStatus,
    pub recurring: bool,
    pub interval_days: Option<i32>,
    pub origin_id: Option<i64>,
    pub next_id: Option<i64>,
    pub paid_date: Option<NaiveDate>,
    pub payment_method: Option<String>,
    pub discount_amount: Option<Decimal>,
    pub net_value: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Plan {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub value: Decimal,
    pub cycle_id: Option<i64>,
    pub active: bool,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Package {
    pub id: i64,
    pub tenant_id: i64,
    pub plan_id: i64,
    pub name: String,
    pub max_beneficiaries: i32,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BillingCycleRow {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub months: Option<i32>,
    pub days: Option<i32>,
    pub permits_recurring: bool,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PaymentMethodRow {
    pub id: i64,
    pub tenant_id: Option<i64>,
    pub code: String,
    pub name: String,
    pub discount_percent: Decimal,
    pub gateway_payment_type: Option<String>,
}
