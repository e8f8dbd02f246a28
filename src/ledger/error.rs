use super::types::{MinorUnits, TransactionStatus};

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient balance for {user_id}: available {available}, required {required}")]
    InsufficientBalance {
        user_id: String,
        available: MinorUnits,
        required: MinorUnits,
    },

    #[error("transaction {transaction_id} cannot move from {from} to {to}")]
    InvalidTransition {
        transaction_id: String,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("transaction {transaction_id} was already applied with a different payload")]
    IdempotencyConflict { transaction_id: String },

    #[error("transaction {transaction_id} not found")]
    TransactionNotFound { transaction_id: String },

    #[error("invalid transaction: {0}")]
    Validation(String),

    #[error("ledger storage error: {message}")]
    Storage { message: String, retryable: bool },
}

impl LedgerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Storage { retryable: true, .. })
    }

    /// How much the debit exceeds the available balance.
    pub fn shortfall(&self) -> Option<MinorUnits> {
        match self {
            LedgerError::InsufficientBalance {
                available,
                required,
                ..
            } => Some(required - available),
            _ => None,
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
