use chrono::{Duration, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use super::error::BillingError;
use super::models::BillingCycleRow;

/// Length of one billing period. Months win when both are set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingCycle {
    #[serde(default)]
    pub months: Option<i32>,
    #[serde(default)]
    pub days: Option<i32>,
}

impl BillingCycle {
    pub fn months(months: i32) -> Self {
        Self {
            months: Some(months),
            days: None,
        }
    }

    pub fn days(days: i32) -> Self {
        Self {
            months: None,
            days: Some(days),
        }
    }

    fn effective_months(&self) -> Option<i32> {
        self.months.filter(|value| *value > 0)
    }

    fn effective_days(&self) -> Option<i32> {
        self.days.filter(|value| *value > 0)
    }
}

impl From<&BillingCycleRow> for BillingCycle {
    fn from(row: &BillingCycleRow) -> Self {
        Self {
            months: row.months,
            days: row.days,
        }
    }
}

/// Advances `start` by one cycle. Calendar-month additions clamp to the last valid day
/// of the target month (Jan 31 + 1 month is Feb 28/29).
pub fn next_date(start: NaiveDate, cycle: &BillingCycle) -> Result<NaiveDate, BillingError> {
    if cycle.months.map_or(false, |value| value < 0) || cycle.days.map_or(false, |value| value < 0)
    {
        return Err(BillingError::InvalidArgument(format!(
            "billing cycle must not be negative: {cycle:?}"
        )));
    }

    if let Some(months) = cycle.effective_months() {
        return start
            .checked_add_months(Months::new(months as u32))
            .ok_or_else(|| overflow(start, cycle));
    }

    if let Some(days) = cycle.effective_days() {
        return start
            .checked_add_signed(Duration::days(days as i64))
            .ok_or_else(|| overflow(start, cycle));
    }

    Err(BillingError::InvalidArgument(
        "billing cycle needs a positive month or day count".into(),
    ))
}

/// Adds a plain day interval, used by receivable chains.
pub fn add_days(start: NaiveDate, days: i32) -> Result<NaiveDate, BillingError> {
    next_date(start, &BillingCycle::days(days))
}

fn overflow(start: NaiveDate, cycle: &BillingCycle) -> BillingError {
    BillingError::InvalidArgument(format!("{start} + {cycle:?} is out of range"))
}
