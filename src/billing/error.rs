use serde::Serialize;
use thiserror::Error;

use super::gateway::GatewayError;

/// key: billing-errors -> tagged failure taxonomy shared by every billing entrypoint
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("external reference `{0}` does not resolve to a known entity")]
    UnresolvableReference(String),
    #[error("gateway event {0} was already processed")]
    DuplicateEvent(String),
    #[error("concurrent update in progress for {0}")]
    ConcurrencyConflict(String),
    #[error("payment gateway unavailable: {0}")]
    GatewayUnavailable(String),
    #[error("payment gateway error: {0}")]
    Gateway(GatewayError),
    #[error("{0}")]
    FanOut(FanOutError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("transaction failure: {0}")]
    Transaction(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    Validation,
    UnresolvableReference,
    DuplicateEvent,
    ConcurrencyConflict,
    GatewayUnavailable,
    GatewayRejected,
    FanOut,
    NotFound,
    InvalidState,
    TransactionFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Validation => "validation",
            ErrorKind::UnresolvableReference => "unresolvable_reference",
            ErrorKind::DuplicateEvent => "duplicate_event",
            ErrorKind::ConcurrencyConflict => "concurrency_conflict",
            ErrorKind::GatewayUnavailable => "gateway_unavailable",
            ErrorKind::GatewayRejected => "gateway_rejected",
            ErrorKind::FanOut => "fan_out",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::TransactionFailure => "transaction_failure",
        }
    }

    /// Recoverable kinds converge on their own through retry, poll or force-validate.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::DuplicateEvent
                | ErrorKind::ConcurrencyConflict
                | ErrorKind::GatewayUnavailable
        )
    }
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            BillingError::Validation(_) => ErrorKind::Validation,
            BillingError::UnresolvableReference(_) => ErrorKind::UnresolvableReference,
            BillingError::DuplicateEvent(_) => ErrorKind::DuplicateEvent,
            BillingError::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
            BillingError::GatewayUnavailable(_) => ErrorKind::GatewayUnavailable,
            BillingError::Gateway(GatewayError::Unavailable(_)) => ErrorKind::GatewayUnavailable,
            BillingError::Gateway(_) => ErrorKind::GatewayRejected,
            BillingError::FanOut(_) => ErrorKind::FanOut,
            BillingError::NotFound(_) => ErrorKind::NotFound,
            BillingError::InvalidState(_) => ErrorKind::InvalidState,
            BillingError::Transaction(_) => ErrorKind::TransactionFailure,
        }
    }

    /// Classifies a database error raised while holding `subject`, turning lock
    /// contention into [`BillingError::ConcurrencyConflict`].
    pub fn from_db(err: sqlx::Error, subject: impl Into<String>) -> Self {
        match pg_error_code(&err).as_deref() {
            Some(LOCK_NOT_AVAILABLE) | Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => {
                BillingError::ConcurrencyConflict(subject.into())
            }
            _ => BillingError::Transaction(err),
        }
    }
}

impl From<GatewayError> for BillingError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable(message) => BillingError::GatewayUnavailable(message),
            other => BillingError::Gateway(other),
        }
    }
}

impl From<FanOutError> for BillingError {
    fn from(err: FanOutError) -> Self {
        BillingError::FanOut(err)
    }
}

const LOCK_NOT_AVAILABLE: &str = "55P03";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

fn pg_error_code(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| code.into_owned()),
        _ => None,
    }
}

/// key: billing-fanout-error -> participant-level breakdown of an aborted fan-out
#[derive(Debug, Clone, Serialize)]
pub struct FanOutError {
    pub contract_id: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<ParticipantFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantFailure {
    pub student_id: i64,
    pub role: String,
    pub cause: String,
}

impl FanOutError {
    pub fn new(contract_id: i64, message: impl Into<String>) -> Self {
        Self {
            contract_id,
            message: message.into(),
            participants: Vec::new(),
        }
    }

    pub fn for_participant(
        contract_id: i64,
        student_id: i64,
        role: &str,
        cause: impl Into<String>,
    ) -> Self {
        let cause = cause.into();
        Self {
            contract_id,
            message: format!("fan-out aborted at student {student_id}: {cause}"),
            participants: vec![ParticipantFailure {
                student_id,
                role: role.to_string(),
                cause,
            }],
        }
    }
}

impl std::fmt::Display for FanOutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "fan-out failed for contract {}: {}",
            self.contract_id, self.message
        )
    }
}
