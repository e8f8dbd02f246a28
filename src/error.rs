//! Unified error handling for the rezpay backend
//!
//! Every module keeps its own error enum; this module maps them onto one
//! application error with HTTP status codes, stable error codes and
//! user-facing messages.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::fmt;

use crate::ledger::LedgerError;
use crate::services::reconciliation::ReconciliationError;
use crate::services::reward_ingestion::IngestionError;

/// Error codes for programmatic handling by clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "INSUFFICIENT_BALANCE")]
    InsufficientBalance,
    #[serde(rename = "INVALID_TRANSITION")]
    InvalidTransition,
    #[serde(rename = "TRANSACTION_NOT_FOUND")]
    TransactionNotFound,
    #[serde(rename = "PAYMENT_NOT_FOUND")]
    PaymentNotFound,
    #[serde(rename = "VERIFICATION_NOT_FOUND")]
    VerificationNotFound,
    #[serde(rename = "IDEMPOTENCY_CONFLICT")]
    IdempotencyConflict,
    #[serde(rename = "VERIFICATION_FAILED")]
    VerificationFailed,
    #[serde(rename = "VERIFICATION_EXPIRED")]
    VerificationExpired,
    #[serde(rename = "PAYMENT_METHOD_UNAVAILABLE")]
    PaymentMethodUnavailable,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CACHE_ERROR")]
    CacheError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,
    #[serde(rename = "INGESTION_FAILED")]
    IngestionFailed,

    // External errors (502, 503, 504)
    #[serde(rename = "PAYMENT_GATEWAY_ERROR")]
    PaymentGatewayError,
    #[serde(rename = "RATE_LIMIT_ERROR")]
    RateLimitError,
    #[serde(rename = "EXTERNAL_SERVICE_TIMEOUT")]
    ExternalServiceTimeout,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
    #[serde(rename = "INVALID_SIGNATURE")]
    InvalidSignature,
}

/// Domain-specific business logic errors
#[derive(Debug, Clone)]
pub enum DomainError {
    /// Debit larger than the spendable balance
    InsufficientBalance { available: i64, required: i64 },
    /// Lifecycle move not allowed from the current state
    InvalidTransition {
        entity: String,
        id: String,
        from: String,
        to: String,
    },
    TransactionNotFound { transaction_id: String },
    PaymentNotFound { payment_id: String },
    VerificationNotFound { verification_id: String },
    /// Idempotency key reused with a different payload
    IdempotencyConflict { key: String },
    VerificationFailed {
        verification_id: String,
        reason: String,
    },
    VerificationExpired { verification_id: String },
    PaymentMethodUnavailable { method: String, reason: String },
}

/// Infrastructure-level errors (database, cache, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    Cache { message: String },
    Configuration { message: String },
    /// Ledger write still failing after the retry budget
    Ingestion {
        idempotency_key: String,
        attempts: u32,
        reason: String,
    },
}

/// External service errors
#[derive(Debug, Clone)]
pub enum ExternalError {
    PaymentGateway {
        gateway: String,
        message: String,
        is_retryable: bool,
    },
    RateLimit {
        service: String,
        retry_after: Option<u64>,
    },
    Timeout { service: String, timeout_secs: u64 },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    InvalidAmount { amount: String, reason: String },
    MissingField { field: String },
    InvalidField { field: String, reason: String },
    OutOfRange {
        field: String,
        min: Option<String>,
        max: Option<String>,
    },
    InvalidSignature { reason: String },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Validation(ValidationError::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }))
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InsufficientBalance { .. } => 422,
                DomainError::InvalidTransition { .. } => 409,
                DomainError::TransactionNotFound { .. } => 404,
                DomainError::PaymentNotFound { .. } => 404,
                DomainError::VerificationNotFound { .. } => 404,
                DomainError::IdempotencyConflict { .. } => 409,
                DomainError::VerificationFailed { .. } => 422,
                DomainError::VerificationExpired { .. } => 410,
                DomainError::PaymentMethodUnavailable { .. } => 422,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => 500,
                InfrastructureError::Cache { .. } => 500,
                InfrastructureError::Configuration { .. } => 500,
                InfrastructureError::Ingestion { .. } => 503,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentGateway { .. } => 502,
                ExternalError::RateLimit { .. } => 429,
                ExternalError::Timeout { .. } => 504,
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidSignature { .. } => 401,
                _ => 400,
            },
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InsufficientBalance { .. } => ErrorCode::InsufficientBalance,
                DomainError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
                DomainError::TransactionNotFound { .. } => ErrorCode::TransactionNotFound,
                DomainError::PaymentNotFound { .. } => ErrorCode::PaymentNotFound,
                DomainError::VerificationNotFound { .. } => ErrorCode::VerificationNotFound,
                DomainError::IdempotencyConflict { .. } => ErrorCode::IdempotencyConflict,
                DomainError::VerificationFailed { .. } => ErrorCode::VerificationFailed,
                DomainError::VerificationExpired { .. } => ErrorCode::VerificationExpired,
                DomainError::PaymentMethodUnavailable { .. } => {
                    ErrorCode::PaymentMethodUnavailable
                }
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Cache { .. } => ErrorCode::CacheError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
                InfrastructureError::Ingestion { .. } => ErrorCode::IngestionFailed,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentGateway { .. } => ErrorCode::PaymentGatewayError,
                ExternalError::RateLimit { .. } => ErrorCode::RateLimitError,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidSignature { .. } => ErrorCode::InvalidSignature,
                _ => ErrorCode::ValidationError,
            },
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InsufficientBalance {
                    available,
                    required,
                } => format!(
                    "Insufficient balance. Available: {}, Required: {}",
                    available, required
                ),
                DomainError::InvalidTransition {
                    entity,
                    id,
                    from,
                    to,
                } => format!("{} '{}' cannot move from {} to {}", entity, id, from, to),
                DomainError::TransactionNotFound { transaction_id } => {
                    format!("Transaction '{}' not found", transaction_id)
                }
                DomainError::PaymentNotFound { payment_id } => {
                    format!("Payment '{}' not found", payment_id)
                }
                DomainError::VerificationNotFound { verification_id } => {
                    format!("Verification '{}' not found", verification_id)
                }
                DomainError::IdempotencyConflict { key } => format!(
                    "Idempotency key '{}' was already used with a different request",
                    key
                ),
                DomainError::VerificationFailed { reason, .. } => {
                    format!("Verification failed: {}", reason)
                }
                DomainError::VerificationExpired { verification_id } => format!(
                    "Verification '{}' has expired. Please start a new one",
                    verification_id
                ),
                DomainError::PaymentMethodUnavailable { method, reason } => {
                    format!("Payment method '{}' is unavailable: {}", method, reason)
                }
            },
            AppErrorKind::Infrastructure(InfrastructureError::Ingestion { .. }) => {
                "Ledger is temporarily unavailable. Retry with the same idempotency key"
                    .to_string()
            }
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentGateway {
                    gateway,
                    is_retryable,
                    ..
                } => {
                    if *is_retryable {
                        format!(
                            "Payment gateway ({}) is temporarily unavailable. Please try again",
                            gateway
                        )
                    } else {
                        "Payment processing failed. Please contact support".to_string()
                    }
                }
                ExternalError::RateLimit {
                    service,
                    retry_after,
                } => match retry_after {
                    Some(secs) => format!(
                        "Rate limit exceeded for {}. Please try again in {} seconds",
                        service, secs
                    ),
                    None => format!("Rate limit exceeded for {}. Please try again later", service),
                },
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => format!(
                    "{} request timed out after {} seconds. Please try again",
                    service, timeout_secs
                ),
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
                ValidationError::InvalidField { field, reason } => {
                    format!("Invalid value for '{}': {}", field, reason)
                }
                ValidationError::OutOfRange { field, min, max } => match (min, max) {
                    (Some(min), Some(max)) => {
                        format!("Field '{}' must be between {} and {}", field, min, max)
                    }
                    (Some(min), None) => format!("Field '{}' must be at least {}", field, min),
                    (None, Some(max)) => format!("Field '{}' must be at most {}", field, max),
                    (None, None) => format!("Field '{}' is out of acceptable range", field),
                },
                ValidationError::InvalidSignature { .. } => "Invalid signature".to_string(),
            },
        }
    }

    /// Structured details for the error response body.
    pub fn details(&self) -> Option<JsonValue> {
        match &self.kind {
            AppErrorKind::Domain(DomainError::InsufficientBalance {
                available,
                required,
            }) => Some(json!({
                "available": available,
                "required": required,
                "shortfall": required - available,
            })),
            AppErrorKind::Domain(DomainError::InvalidTransition { from, to, .. }) => {
                Some(json!({ "from": from, "to": to }))
            }
            AppErrorKind::Infrastructure(InfrastructureError::Ingestion {
                idempotency_key,
                attempts,
                ..
            }) => Some(json!({
                "idempotency_key": idempotency_key,
                "attempts": attempts,
            })),
            AppErrorKind::Validation(ValidationError::InvalidField { field, reason }) => {
                Some(json!({ "field": field, "error": reason }))
            }
            _ => None,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Cache { .. } => true,
                InfrastructureError::Configuration { .. } => false,
                InfrastructureError::Ingestion { .. } => true,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentGateway { is_retryable, .. } => *is_retryable,
                ExternalError::RateLimit { .. } => true,
                ExternalError::Timeout { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

// Conversions from specific error types
// Note: gateway, verification and database conversions live next to those error types

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        let kind = match err {
            LedgerError::InsufficientBalance {
                available,
                required,
                ..
            } => AppErrorKind::Domain(DomainError::InsufficientBalance {
                available,
                required,
            }),
            LedgerError::InvalidTransition {
                transaction_id,
                from,
                to,
            } => AppErrorKind::Domain(DomainError::InvalidTransition {
                entity: "Transaction".to_string(),
                id: transaction_id,
                from: from.to_string(),
                to: to.to_string(),
            }),
            LedgerError::IdempotencyConflict { transaction_id } => {
                AppErrorKind::Domain(DomainError::IdempotencyConflict {
                    key: transaction_id,
                })
            }
            LedgerError::TransactionNotFound { transaction_id } => {
                AppErrorKind::Domain(DomainError::TransactionNotFound { transaction_id })
            }
            LedgerError::Validation(reason) => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field: "transaction".to_string(),
                    reason,
                })
            }
            LedgerError::Storage { message, retryable } => {
                AppErrorKind::Infrastructure(InfrastructureError::Database {
                    message,
                    is_retryable: retryable,
                })
            }
        };
        AppError::new(kind)
    }
}

impl From<IngestionError> for AppError {
    fn from(err: IngestionError) -> Self {
        match err {
            IngestionError::InvalidEvent(reason) => AppError::validation("event", reason),
            IngestionError::InsufficientFunds {
                available,
                required,
                ..
            } => AppError::new(AppErrorKind::Domain(DomainError::InsufficientBalance {
                available,
                required,
            })),
            IngestionError::IngestionFailed {
                idempotency_key,
                attempts,
                reason,
            } => AppError::new(AppErrorKind::Infrastructure(
                InfrastructureError::Ingestion {
                    idempotency_key,
                    attempts,
                    reason,
                },
            )),
            IngestionError::Ledger(inner) => inner.into(),
        }
    }
}

impl From<ReconciliationError> for AppError {
    fn from(err: ReconciliationError) -> Self {
        match err {
            ReconciliationError::Ledger(inner) => inner.into(),
            ReconciliationError::State(message) => {
                AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Cache {
                    message,
                }))
            }
        }
    }
}

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;
