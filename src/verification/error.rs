use super::types::VerificationStatus;
use crate::database::error::DatabaseError;
use crate::error::{AppError, AppErrorKind, DomainError, ValidationError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum VerificationError {
    #[error("verification {verification_id} not found")]
    NotFound { verification_id: String },

    #[error("verification {verification_id} cannot move from {from} to {to}")]
    InvalidTransition {
        verification_id: String,
        from: VerificationStatus,
        to: VerificationStatus,
    },

    #[error("verification {verification_id} has expired")]
    Expired { verification_id: String },

    #[error("verification {verification_id} failed: {reason}")]
    Failed {
        verification_id: String,
        reason: String,
    },

    #[error("invalid evidence: {0}")]
    InvalidEvidence(String),

    #[error(transparent)]
    Storage(#[from] DatabaseError),
}

pub type VerificationResult<T> = Result<T, VerificationError>;

impl From<VerificationError> for AppError {
    fn from(err: VerificationError) -> Self {
        match err {
            VerificationError::NotFound { verification_id } => AppError::new(
                AppErrorKind::Domain(DomainError::VerificationNotFound { verification_id }),
            ),
            VerificationError::InvalidTransition {
                verification_id,
                from,
                to,
            } => AppError::new(AppErrorKind::Domain(DomainError::InvalidTransition {
                entity: "Verification".to_string(),
                id: verification_id,
                from: from.to_string(),
                to: to.to_string(),
            })),
            VerificationError::Expired { verification_id } => AppError::new(
                AppErrorKind::Domain(DomainError::VerificationExpired { verification_id }),
            ),
            VerificationError::Failed {
                verification_id,
                reason,
            } => AppError::new(AppErrorKind::Domain(DomainError::VerificationFailed {
                verification_id,
                reason,
            })),
            VerificationError::InvalidEvidence(reason) => AppError::new(AppErrorKind::Validation(
                ValidationError::InvalidField {
                    field: "evidence".to_string(),
                    reason,
                },
            )),
            VerificationError::Storage(inner) => inner.into(),
        }
    }
}
