//! Deterministic in-process stand-in for a remote gateway.
//!
//! Used for every external rail when the environment is `sandbox`. Payments
//! stay pending until [`SandboxGateway::complete`] is called or a signed
//! callback built with [`SandboxGateway::signed_callback`] is delivered.

use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::gateway::{parse_standard_callback, verify_signed_callback, GatewayAdapter};
use crate::payments::types::{
    CancelAck, GatewayCallback, GatewayInitiation, GatewayKind, GatewayOutcome, GatewayRail,
    PaymentRecord,
};
use crate::payments::utils::sign_hmac_sha256_hex;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

pub struct SandboxGateway {
    rail: GatewayRail,
    currencies: Vec<String>,
    callback_secret: String,
    outcomes: Mutex<HashMap<String, GatewayOutcome>>,
    fail_next_initiation: AtomicBool,
}

impl SandboxGateway {
    pub fn new(rail: GatewayRail, currencies: Vec<String>, callback_secret: impl Into<String>) -> Self {
        Self {
            rail,
            currencies,
            callback_secret: callback_secret.into(),
            outcomes: Mutex::new(HashMap::new()),
            fail_next_initiation: AtomicBool::new(false),
        }
    }

    /// Make the next `initiate` call fail with a retryable network error.
    pub fn fail_next_initiation(&self) {
        self.fail_next_initiation.store(true, Ordering::SeqCst);
    }

    /// Decide what polling `reference` reports from now on.
    pub fn complete(&self, reference: &str, outcome: GatewayOutcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference.to_string(), outcome);
    }

    /// Body and signature of a callback this gateway would send.
    pub fn signed_callback(
        &self,
        event_id: &str,
        reference: &str,
        outcome: &GatewayOutcome,
    ) -> (Vec<u8>, String) {
        let mut body = serde_json::to_value(outcome).unwrap_or_else(|_| serde_json::json!({}));
        body["event_id"] = serde_json::Value::from(event_id);
        body["reference"] = serde_json::Value::from(reference);
        let bytes = body.to_string().into_bytes();
        let signature = sign_hmac_sha256_hex(&bytes, &self.callback_secret).unwrap_or_default();
        (bytes, signature)
    }

    fn outcome(&self, reference: &str) -> Option<GatewayOutcome> {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference)
            .cloned()
    }
}

#[async_trait]
impl GatewayAdapter for SandboxGateway {
    fn rail(&self) -> GatewayRail {
        self.rail
    }

    fn gateway(&self) -> GatewayKind {
        self.rail.gateway()
    }

    fn supported_currencies(&self) -> &[String] {
        &self.currencies
    }

    async fn initiate(&self, payment: &PaymentRecord) -> GatewayResult<GatewayInitiation> {
        if self.fail_next_initiation.swap(false, Ordering::SeqCst) {
            return Err(GatewayError::NetworkError {
                message: format!("sandbox {} gateway unreachable", self.rail),
            });
        }
        if !self.supports_currency(&payment.currency) {
            return Err(GatewayError::ValidationError {
                message: format!("currency {} not supported on {}", payment.currency, self.rail),
                field: Some("currency".to_string()),
            });
        }

        let reference = format!("sbx_{}_{}", self.rail, Uuid::new_v4().simple());
        self.complete(&reference, GatewayOutcome::Pending);
        info!(
            payment_id = %payment.id,
            rail = %self.rail,
            reference = %reference,
            "sandbox payment initiated"
        );

        Ok(GatewayInitiation {
            redirect_url: Some(format!("https://sandbox.rezpay.local/pay/{}", reference)),
            reference,
            provider_data: Some(serde_json::json!({ "sandbox": true })),
        })
    }

    async fn poll_status(&self, reference: &str) -> GatewayResult<GatewayOutcome> {
        self.outcome(reference)
            .ok_or_else(|| GatewayError::ProviderError {
                gateway: self.gateway().to_string(),
                message: format!("unknown reference {}", reference),
                provider_code: Some("404".to_string()),
                retryable: false,
            })
    }

    async fn cancel(&self, reference: &str) -> GatewayResult<CancelAck> {
        match self.outcome(reference) {
            Some(GatewayOutcome::Pending) => {
                debug!(reference = %reference, "sandbox cancel accepted");
                self.complete(
                    reference,
                    GatewayOutcome::Cancelled {
                        reason: "cancelled by merchant".to_string(),
                    },
                );
                Ok(CancelAck {
                    accepted: true,
                    message: None,
                })
            }
            Some(_) => Ok(CancelAck {
                accepted: false,
                message: Some("payment already finalised".to_string()),
            }),
            None => Err(GatewayError::ProviderError {
                gateway: self.gateway().to_string(),
                message: format!("unknown reference {}", reference),
                provider_code: Some("404".to_string()),
                retryable: false,
            }),
        }
    }

    fn verify_callback(&self, payload: &[u8], signature: Option<&str>) -> GatewayResult<bool> {
        verify_signed_callback(self.rail, Some(&self.callback_secret), payload, signature)
    }

    fn parse_callback(&self, payload: &[u8]) -> GatewayResult<GatewayCallback> {
        parse_standard_callback(self.rail, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::PaymentMethodType;

    fn gateway() -> SandboxGateway {
        SandboxGateway::new(GatewayRail::Upi, vec!["INR".to_string()], "sandbox-secret")
    }

    #[tokio::test]
    async fn test_payment_pending_until_completed() {
        let gateway = gateway();
        let payment = PaymentRecord::new("o1", "u1", "m1", 500, "INR", PaymentMethodType::Upi);
        let init = gateway.initiate(&payment).await.unwrap();

        assert_eq!(gateway.poll_status(&init.reference).await.unwrap(), GatewayOutcome::Pending);
        gateway.complete(&init.reference, GatewayOutcome::Succeeded);
        assert_eq!(gateway.poll_status(&init.reference).await.unwrap(), GatewayOutcome::Succeeded);

        let ack = gateway.cancel(&init.reference).await.unwrap();
        assert!(!ack.accepted);
    }

    #[tokio::test]
    async fn test_injected_initiation_failure_is_one_shot() {
        let gateway = gateway();
        let payment = PaymentRecord::new("o1", "u1", "m1", 500, "INR", PaymentMethodType::Upi);
        gateway.fail_next_initiation();

        let err = gateway.initiate(&payment).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(gateway.initiate(&payment).await.is_ok());
    }

    #[tokio::test]
    async fn test_signed_callback_round_trips_through_verification() {
        let gateway = gateway();
        let (body, signature) = gateway.signed_callback(
            "evt_7",
            "sbx_upi_abc",
            &GatewayOutcome::Failed {
                reason: "collect request expired".to_string(),
            },
        );

        assert!(gateway.verify_callback(&body, Some(&signature)).unwrap());
        let callback = gateway.parse_callback(&body).unwrap();
        assert_eq!(callback.event_id, "evt_7");
        assert!(matches!(callback.outcome, GatewayOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_rejects_unsupported_currency() {
        let gateway = gateway();
        let payment = PaymentRecord::new("o1", "u1", "m1", 500, "USD", PaymentMethodType::Upi);
        assert!(matches!(
            gateway.initiate(&payment).await,
            Err(GatewayError::ValidationError { .. })
        ));
    }
}
