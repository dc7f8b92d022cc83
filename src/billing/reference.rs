use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use uuid::Uuid;

const ENROLLMENT_PREFIX: &str = "MAT";
const PACKAGE_PREFIX: &str = "PKG";

/// key: billing-external-reference -> `{PREFIX}-{entityId}-{nonce}` wire format
///
/// The gateway echoes this string back on every payment, so the rendering is a
/// stable contract with already-issued checkouts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExternalReference {
    /// `MAT-{enrollmentId}-{nonce}`
    Enrollment { enrollment_id: i64, nonce: String },
    /// `PKG-{contractId}-{enrollmentId}`; the tail is a nonce for checkouts issued
    /// before the contract was fanned out.
    Package { contract_id: i64, tail: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("external reference is empty")]
    Empty,
    #[error("unknown external reference prefix `{0}`")]
    UnknownPrefix(String),
    #[error("external reference `{0}` is malformed")]
    Malformed(String),
}

impl ExternalReference {
    /// Fresh checkout reference for a single enrollment.
    pub fn for_enrollment(enrollment_id: i64) -> Self {
        let nonce = Uuid::new_v4().simple().to_string();
        ExternalReference::Enrollment {
            enrollment_id,
            nonce: nonce[..12].to_string(),
        }
    }

    pub fn for_package(contract_id: i64, enrollment_id: i64) -> Self {
        ExternalReference::Package {
            contract_id,
            tail: enrollment_id.to_string(),
        }
    }

    /// Enrollment named by the reference, when it names one.
    pub fn enrollment_id(&self) -> Option<i64> {
        match self {
            ExternalReference::Enrollment { enrollment_id, .. } => Some(*enrollment_id),
            ExternalReference::Package { tail, .. } => tail.parse().ok(),
        }
    }

    pub fn contract_id(&self) -> Option<i64> {
        match self {
            ExternalReference::Package { contract_id, .. } => Some(*contract_id),
            ExternalReference::Enrollment { .. } => None,
        }
    }
}

impl fmt::Display for ExternalReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalReference::Enrollment {
                enrollment_id,
                nonce,
            } => write!(f, "{ENROLLMENT_PREFIX}-{enrollment_id}-{nonce}"),
            ExternalReference::Package { contract_id, tail } => {
                write!(f, "{PACKAGE_PREFIX}-{contract_id}-{tail}")
            }
        }
    }
}

impl FromStr for ExternalReference {
    type Err = ReferenceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let mut parts = trimmed.splitn(3, '-');
        let prefix = parts.next().unwrap_or_default();
        let entity = parts.next();
        let tail = parts.next();

        if prefix != ENROLLMENT_PREFIX && prefix != PACKAGE_PREFIX {
            return Err(ReferenceError::UnknownPrefix(prefix.to_string()));
        }

        let (Some(entity), Some(tail)) = (entity, tail) else {
            return Err(ReferenceError::Malformed(trimmed.to_string()));
        };
        let entity_id = entity
            .parse::<i64>()
            .ok()
            .filter(|value| *value > 0)
            .ok_or_else(|| ReferenceError::Malformed(trimmed.to_string()))?;
        if tail.is_empty() {
            return Err(ReferenceError::Malformed(trimmed.to_string()));
        }

        Ok(if prefix == ENROLLMENT_PREFIX {
            ExternalReference::Enrollment {
                enrollment_id: entity_id,
                nonce: tail.to_string(),
            }
        } else {
            ExternalReference::Package {
                contract_id: entity_id,
                tail: tail.to_string(),
            }
        })
    }
}
