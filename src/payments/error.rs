use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Insufficient funds: available={available}, required={required}")]
    InsufficientFunds { available: i64, required: i64 },

    #[error("Payment declined: {message}")]
    Declined {
        message: String,
        provider_code: Option<String>,
    },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Rate limit exceeded: {message}")]
    RateLimitError {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("Callback verification failed: {message}")]
    CallbackVerificationError { message: String },

    #[error("Gateway error: gateway={gateway}, message={message}")]
    ProviderError {
        gateway: String,
        message: String,
        provider_code: Option<String>,
        retryable: bool,
    },

    #[error("Rail {rail} does not support {operation}")]
    Unsupported { rail: String, operation: String },
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::ValidationError { .. } => false,
            GatewayError::InsufficientFunds { .. } => false,
            GatewayError::Declined { .. } => false,
            GatewayError::NetworkError { .. } => true,
            GatewayError::RateLimitError { .. } => true,
            GatewayError::CallbackVerificationError { .. } => false,
            GatewayError::ProviderError { retryable, .. } => *retryable,
            GatewayError::Unsupported { .. } => false,
        }
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            GatewayError::ValidationError { .. } => 400,
            GatewayError::InsufficientFunds { .. } => 422,
            GatewayError::Declined { .. } => 402,
            GatewayError::NetworkError { .. } => 503,
            GatewayError::RateLimitError { .. } => 429,
            GatewayError::CallbackVerificationError { .. } => 401,
            GatewayError::ProviderError { .. } => 502,
            GatewayError::Unsupported { .. } => 400,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            GatewayError::ValidationError { message, .. } => message.clone(),
            GatewayError::InsufficientFunds { .. } => {
                "Insufficient balance to complete payment".to_string()
            }
            GatewayError::Declined { .. } => "Payment was declined by the gateway".to_string(),
            GatewayError::NetworkError { .. } => {
                "Payment gateway is temporarily unavailable".to_string()
            }
            GatewayError::RateLimitError { .. } => {
                "Too many requests to payment gateway. Please retry shortly".to_string()
            }
            GatewayError::CallbackVerificationError { .. } => {
                "Invalid callback signature".to_string()
            }
            GatewayError::ProviderError { .. } => "Payment gateway returned an error".to_string(),
            GatewayError::Unsupported { operation, .. } => {
                format!("Operation '{}' is not supported for this payment method", operation)
            }
        }
    }
}

impl From<GatewayError> for crate::error::AppError {
    fn from(err: GatewayError) -> Self {
        use crate::error::{
            AppError, AppErrorKind, DomainError, ExternalError, ValidationError,
        };

        let kind = match err {
            GatewayError::ValidationError { message, field } => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field: field.unwrap_or_else(|| "request".to_string()),
                    reason: message,
                })
            }
            GatewayError::InsufficientFunds {
                available,
                required,
            } => AppErrorKind::Domain(DomainError::InsufficientBalance {
                available,
                required,
            }),
            GatewayError::CallbackVerificationError { message } => {
                AppErrorKind::Validation(ValidationError::InvalidSignature { reason: message })
            }
            GatewayError::RateLimitError {
                retry_after_seconds,
                ..
            } => AppErrorKind::External(ExternalError::RateLimit {
                service: "payment gateway".to_string(),
                retry_after: retry_after_seconds,
            }),
            GatewayError::Unsupported { rail, operation } => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field: "method".to_string(),
                    reason: format!("rail {} does not support {}", rail, operation),
                })
            }
            other => AppErrorKind::External(ExternalError::PaymentGateway {
                gateway: match &other {
                    GatewayError::ProviderError { gateway, .. } => gateway.clone(),
                    _ => "payments".to_string(),
                },
                message: other.to_string(),
                is_retryable: other.is_retryable(),
            }),
        };
        AppError::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_http_status_mapping() {
        assert_eq!(
            GatewayError::ValidationError {
                message: "bad".to_string(),
                field: None
            }
            .http_status_code(),
            400
        );
        assert_eq!(
            GatewayError::RateLimitError {
                message: "limited".to_string(),
                retry_after_seconds: Some(30)
            }
            .http_status_code(),
            429
        );
    }

    #[test]
    fn test_retryable_flags() {
        assert!(GatewayError::NetworkError {
            message: "timeout".to_string()
        }
        .is_retryable());
        assert!(!GatewayError::Declined {
            message: "declined".to_string(),
            provider_code: None
        }
        .is_retryable());
        assert!(!GatewayError::InsufficientFunds {
            available: 5,
            required: 10
        }
        .is_retryable());
    }

    #[test]
    fn test_insufficient_funds_maps_to_domain_error() {
        let app: crate::error::AppError = GatewayError::InsufficientFunds {
            available: 40,
            required: 100,
        }
        .into();
        assert_eq!(app.status_code(), 422);
        assert_eq!(app.details().unwrap()["shortfall"], 60);
    }
}
