//! Cash on delivery. Nothing is collected up front; the courier's signed
//! delivery callback is the only confirmation.

use crate::payments::error::GatewayResult;
use crate::payments::gateway::{parse_standard_callback, verify_signed_callback, GatewayAdapter};
use crate::payments::types::{
    CancelAck, GatewayCallback, GatewayInitiation, GatewayKind, GatewayOutcome, GatewayRail,
    PaymentRecord,
};
use async_trait::async_trait;
use tracing::info;

pub struct CashOnDeliveryGateway {
    currencies: Vec<String>,
    callback_secret: Option<String>,
}

impl CashOnDeliveryGateway {
    pub fn new(currencies: Vec<String>, callback_secret: Option<String>) -> Self {
        Self {
            currencies,
            callback_secret,
        }
    }
}

#[async_trait]
impl GatewayAdapter for CashOnDeliveryGateway {
    fn rail(&self) -> GatewayRail {
        GatewayRail::Cod
    }

    fn gateway(&self) -> GatewayKind {
        GatewayKind::None
    }

    fn supported_currencies(&self) -> &[String] {
        &self.currencies
    }

    async fn initiate(&self, payment: &PaymentRecord) -> GatewayResult<GatewayInitiation> {
        let reference = format!("cod_{}", payment.id);
        info!(payment_id = %payment.id, reference = %reference, "cash on delivery booked");
        Ok(GatewayInitiation {
            reference,
            redirect_url: None,
            provider_data: Some(serde_json::json!({
                "collect_amount": payment.amount,
                "currency": payment.currency,
            })),
        })
    }

    async fn poll_status(&self, _reference: &str) -> GatewayResult<GatewayOutcome> {
        Ok(GatewayOutcome::Pending)
    }

    async fn cancel(&self, _reference: &str) -> GatewayResult<CancelAck> {
        Ok(CancelAck {
            accepted: true,
            message: Some("delivery collection cancelled".to_string()),
        })
    }

    fn verify_callback(&self, payload: &[u8], signature: Option<&str>) -> GatewayResult<bool> {
        verify_signed_callback(
            GatewayRail::Cod,
            self.callback_secret.as_deref(),
            payload,
            signature,
        )
    }

    fn parse_callback(&self, payload: &[u8]) -> GatewayResult<GatewayCallback> {
        parse_standard_callback(GatewayRail::Cod, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::PaymentMethodType;
    use crate::payments::utils::sign_hmac_sha256_hex;

    #[tokio::test]
    async fn test_cod_stays_pending_until_delivery_callback() {
        let gateway = CashOnDeliveryGateway::new(vec!["INR".to_string()], Some("courier".to_string()));
        let payment = PaymentRecord::new("o1", "u1", "m1", 900, "INR", PaymentMethodType::Cod);

        let init = gateway.initiate(&payment).await.unwrap();
        assert!(init.reference.starts_with("cod_pay_"));
        assert_eq!(gateway.poll_status(&init.reference).await.unwrap(), GatewayOutcome::Pending);

        let body = format!(
            r#"{{"event_id":"dlv_1","reference":"{}","status":"delivered"}}"#,
            init.reference
        );
        let signature = sign_hmac_sha256_hex(body.as_bytes(), "courier").unwrap();
        assert!(gateway.verify_callback(body.as_bytes(), Some(&signature)).unwrap());
        assert_eq!(
            gateway.parse_callback(body.as_bytes()).unwrap().outcome,
            GatewayOutcome::Succeeded
        );
    }
}
