use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, warn};

use super::cycle::{next_date, BillingCycle};
use super::error::{BillingError, FanOutError};
use super::models::{BillingKind, ContractStatus, EnrollmentStatus, PackageContract};
use super::proration::split;
use super::reference::ExternalReference;
use super::store::{EntityStore, LockMode, NewEnrollment, NewSubscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Payer,
    Beneficiary,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Payer => "payer",
            ParticipantRole::Beneficiary => "beneficiary",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FanOutParticipant {
    pub student_id: i64,
    pub enrollment_id: i64,
    pub role: ParticipantRole,
    pub share_value: Decimal,
    pub due_date: NaiveDate,
    /// False when an existing enrollment was refreshed instead of inserted.
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FanOutReport {
    pub contract_id: i64,
    pub status: ContractStatus,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub participants: Vec<FanOutParticipant>,
}

#[derive(Debug, Clone)]
pub struct FanOutSettings {
    /// Gateway recorded on subscriptions created for payers.
    pub gateway: String,
    /// Used when neither the plan nor the enrollment names a cycle.
    pub default_cycle: BillingCycle,
}

#[derive(Debug, Clone, Copy)]
struct Participant {
    student_id: i64,
    role: ParticipantRole,
    beneficiary_id: Option<i64>,
}

/// key: billing-package-fanout -> contract expansion into per-person billing rows
#[derive(Clone)]
pub struct PackageFanOutEngine {
    pool: PgPool,
    settings: FanOutSettings,
}

impl PackageFanOutEngine {
    pub fn new(pool: PgPool, settings: FanOutSettings) -> Self {
        Self { pool, settings }
    }

    /// Admin entry point: one transaction, fails fast when another caller holds the contract.
    pub async fn generate_enrollments(
        &self,
        tenant_id: i64,
        contract_id: i64,
        today: NaiveDate,
    ) -> Result<FanOutReport, BillingError> {
        let mut tx = self.pool.begin().await?;
        let report = {
            let mut store = EntityStore::new(&mut tx, tenant_id);
            self.fan_out(&mut store, contract_id, today, LockMode::NoWait)
                .await?
        };
        tx.commit()
            .await
            .map_err(|err| BillingError::from_db(err, format!("package contract {contract_id}")))?;

        info!(
            %tenant_id,
            contract_id,
            participants = report.participants.len(),
            "package contract fanned out"
        );
        Ok(report)
    }

    /// Expands the contract inside the caller's transaction. Safe to repeat: existing
    /// enrollments, open invoices and subscriptions are reused.
    pub async fn fan_out(
        &self,
        store: &mut EntityStore<'_>,
        contract_id: i64,
        today: NaiveDate,
        lock: LockMode,
    ) -> Result<FanOutReport, BillingError> {
        let contract = store
            .lock_contract(contract_id, lock)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("package contract {contract_id}")))?;

        if matches!(
            contract.status,
            ContractStatus::Cancelled | ContractStatus::Expired
        ) {
            return Err(BillingError::InvalidState(format!(
                "package contract {contract_id} is {:?}",
                contract.status
            )));
        }

        let package = store.package(contract.package_id).await?.ok_or_else(|| {
            FanOutError::new(contract_id, format!("package {} not found", contract.package_id))
        })?;
        let plan = store.plan(package.plan_id).await?.ok_or_else(|| {
            FanOutError::new(contract_id, format!("plan {} not found", package.plan_id))
        })?;

        let participants = self.participants(store, &contract).await?;
        let beneficiary_count = participants
            .iter()
            .filter(|participant| participant.beneficiary_id.is_some())
            .count();
        if beneficiary_count > package.max_beneficiaries.max(0) as usize {
            return Err(FanOutError::new(
                contract_id,
                format!(
                    "{beneficiary_count} beneficiaries exceed the package limit of {}",
                    package.max_beneficiaries
                ),
            )
            .into());
        }
        if participants.is_empty() {
            return Err(FanOutError::new(contract_id, "contract has no participants").into());
        }

        let cycle_row = store.cycle_for(plan.id, None).await?;
        let (cycle, permits_recurring) = match &cycle_row {
            Some(row) => (BillingCycle::from(row), row.permits_recurring),
            None => (self.settings.default_cycle, false),
        };
        let start_date = contract.start_date.unwrap_or(today);
        let end_date = next_date(start_date, &cycle)
            .map_err(|err| FanOutError::new(contract_id, err.to_string()))?;
        let billing_kind = if permits_recurring {
            BillingKind::Recurring
        } else {
            BillingKind::OneOff
        };

        let shares = split(contract.total_value, participants.len())
            .map_err(|err| FanOutError::new(contract_id, err.to_string()))?;

        let mut outputs = Vec::with_capacity(participants.len());
        for (participant, share) in participants.iter().zip(shares) {
            let output = self
                .upsert_participant(
                    store,
                    &contract,
                    participant,
                    ParticipantTerms {
                        plan_id: plan.id,
                        cycle_id: cycle_row.as_ref().map(|row| row.id),
                        billing_kind,
                        share,
                        start_date,
                        end_date,
                        permits_recurring,
                    },
                )
                .await
                .map_err(|err| match err {
                    BillingError::ConcurrencyConflict(_) | BillingError::FanOut(_) => err,
                    other => FanOutError::for_participant(
                        contract_id,
                        participant.student_id,
                        participant.role.as_str(),
                        other.to_string(),
                    )
                    .into(),
                })?;
            outputs.push(output);
        }

        let contract = store
            .activate_contract(contract_id, start_date, end_date)
            .await?;

        Ok(FanOutReport {
            contract_id,
            status: contract.status,
            start_date,
            end_date,
            participants: outputs,
        })
    }

    async fn participants(
        &self,
        store: &mut EntityStore<'_>,
        contract: &PackageContract,
    ) -> Result<Vec<Participant>, BillingError> {
        let payer_student = store.student_for_user(contract.payer_user_id).await?;
        if payer_student.is_none() {
            warn!(
                contract_id = contract.id,
                payer_user_id = contract.payer_user_id,
                "payer has no student profile; fanning out to beneficiaries only"
            );
        }
        let beneficiaries = store.beneficiaries(contract.id).await?;

        let mut participants = Vec::with_capacity(beneficiaries.len() + 1);
        if let Some(student_id) = payer_student {
            participants.push(Participant {
                student_id,
                role: ParticipantRole::Payer,
                beneficiary_id: beneficiaries
                    .iter()
                    .find(|beneficiary| beneficiary.student_id == student_id)
                    .map(|beneficiary| beneficiary.id),
            });
        }
        for beneficiary in &beneficiaries {
            if Some(beneficiary.student_id) == payer_student {
                continue;
            }
            participants.push(Participant {
                student_id: beneficiary.student_id,
                role: ParticipantRole::Beneficiary,
                beneficiary_id: Some(beneficiary.id),
            });
        }
        Ok(participants)
    }

    async fn upsert_participant(
        &self,
        store: &mut EntityStore<'_>,
        contract: &PackageContract,
        participant: &Participant,
        terms: ParticipantTerms,
    ) -> Result<FanOutParticipant, BillingError> {
        if !store.student_exists(participant.student_id).await? {
            return Err(BillingError::Validation(format!(
                "student {} does not belong to tenant {}",
                participant.student_id,
                store.tenant_id()
            )));
        }

        let existing = store
            .contract_enrollment_for_student(contract.id, participant.student_id)
            .await?;
        let created = existing.is_none();
        let enrollment = match existing {
            // Live enrollments keep the period reconciliation has advanced.
            Some(enrollment)
                if matches!(
                    enrollment.status,
                    EnrollmentStatus::Active | EnrollmentStatus::Overdue
                ) =>
            {
                store.set_enrollment_share(enrollment.id, terms.share).await?
            }
            Some(enrollment) => {
                store
                    .refresh_package_enrollment(
                        enrollment.id,
                        terms.share,
                        terms.start_date,
                        terms.end_date,
                    )
                    .await?
            }
            None => {
                store
                    .insert_enrollment(&NewEnrollment {
                        student_id: participant.student_id,
                        plan_id: terms.plan_id,
                        cycle_id: terms.cycle_id,
                        billing_kind: terms.billing_kind,
                        start_date: terms.start_date,
                        due_date: terms.end_date,
                        next_due_date: Some(terms.end_date),
                        value: terms.share,
                        prorated_value: Some(terms.share),
                        package_contract_ref: Some(contract.id),
                    })
                    .await?
            }
        };

        let reference = ExternalReference::for_package(contract.id, enrollment.id);
        if enrollment.external_reference.is_none() {
            store
                .set_enrollment_reference(enrollment.id, &reference)
                .await?;
        }

        let has_open = store.open_plan_payment(enrollment.id).await?.is_some();
        let has_period = store
            .plan_payment_for_period(enrollment.id, terms.start_date)
            .await?
            .is_some();
        if !has_open && !has_period {
            store
                .insert_plan_payment(enrollment.id, terms.share, terms.start_date)
                .await?;
        }

        if let Some(beneficiary_id) = participant.beneficiary_id {
            store
                .activate_beneficiary(beneficiary_id, enrollment.id, terms.share)
                .await?;
        }

        if participant.role == ParticipantRole::Payer
            && terms.permits_recurring
            && store
                .subscription_for_enrollment(enrollment.id)
                .await?
                .is_none()
        {
            store
                .insert_subscription(&NewSubscription {
                    enrollment_id: enrollment.id,
                    gateway: self.settings.gateway.clone(),
                    external_reference: reference.to_string(),
                    next_charge_date: Some(terms.end_date),
                    billing_day: Some(terms.start_date.day() as i32),
                })
                .await?;
        }

        Ok(FanOutParticipant {
            student_id: participant.student_id,
            enrollment_id: enrollment.id,
            role: participant.role,
            share_value: terms.share,
            due_date: enrollment.due_date,
            created,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct ParticipantTerms {
    plan_id: i64,
    cycle_id: Option<i64>,
    billing_kind: BillingKind,
    share: Decimal,
    start_date: NaiveDate,
    end_date: NaiveDate,
    permits_recurring: bool,
}
