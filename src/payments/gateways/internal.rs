//! Wallet balance and coin payments settled inside the ledger.

use crate::ledger::LedgerStore;
use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::gateway::GatewayAdapter;
use crate::payments::types::{
    CancelAck, GatewayCallback, GatewayInitiation, GatewayKind, GatewayOutcome, GatewayRail,
    PaymentRecord,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub struct InternalWalletGateway {
    ledger: Arc<dyn LedgerStore>,
    currencies: Vec<String>,
}

impl InternalWalletGateway {
    pub fn new(ledger: Arc<dyn LedgerStore>, currencies: Vec<String>) -> Self {
        Self { ledger, currencies }
    }

    fn unsupported(operation: &str) -> GatewayError {
        GatewayError::Unsupported {
            rail: GatewayRail::Internal.to_string(),
            operation: operation.to_string(),
        }
    }
}

#[async_trait]
impl GatewayAdapter for InternalWalletGateway {
    fn rail(&self) -> GatewayRail {
        GatewayRail::Internal
    }

    fn gateway(&self) -> GatewayKind {
        GatewayKind::Internal
    }

    fn supported_currencies(&self) -> &[String] {
        &self.currencies
    }

    fn settles_synchronously(&self) -> bool {
        true
    }

    async fn initiate(&self, payment: &PaymentRecord) -> GatewayResult<GatewayInitiation> {
        if payment.amount <= 0 {
            return Err(GatewayError::ValidationError {
                message: "amount must be greater than zero".to_string(),
                field: Some("amount".to_string()),
            });
        }

        let balance = self
            .ledger
            .get_balance(&payment.user_id)
            .await
            .map_err(|e| GatewayError::ProviderError {
                gateway: GatewayKind::Internal.to_string(),
                message: e.to_string(),
                provider_code: None,
                retryable: e.is_retryable(),
            })?;

        if balance.available < payment.amount {
            return Err(GatewayError::InsufficientFunds {
                available: balance.available,
                required: payment.amount,
            });
        }

        debug!(
            payment_id = %payment.id,
            available = balance.available,
            amount = payment.amount,
            "internal payment pre-check passed"
        );

        Ok(GatewayInitiation {
            reference: format!("int_{}", payment.id),
            redirect_url: None,
            provider_data: Some(serde_json::json!({ "available": balance.available })),
        })
    }

    /// The debit happens at settlement, so an initiated internal payment is
    /// always ready to settle.
    async fn poll_status(&self, _reference: &str) -> GatewayResult<GatewayOutcome> {
        Ok(GatewayOutcome::Succeeded)
    }

    async fn cancel(&self, _reference: &str) -> GatewayResult<CancelAck> {
        Ok(CancelAck {
            accepted: true,
            message: None,
        })
    }

    fn verify_callback(&self, _payload: &[u8], _signature: Option<&str>) -> GatewayResult<bool> {
        Err(Self::unsupported("callbacks"))
    }

    fn parse_callback(&self, _payload: &[u8]) -> GatewayResult<GatewayCallback> {
        Err(Self::unsupported("callbacks"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{InMemoryLedgerStore, NewTransaction, TransactionSource};
    use crate::payments::types::PaymentMethodType;

    fn payment(user_id: &str, amount: i64) -> PaymentRecord {
        PaymentRecord {
            id: "pay_1".to_string(),
            ..PaymentRecord::new("order_1", user_id, "merchant_1", amount, "INR", PaymentMethodType::Paybill)
        }
    }

    #[tokio::test]
    async fn test_initiate_checks_available_balance() {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        ledger
            .apply(NewTransaction::credit("c1", "u1", 300, TransactionSource::Bonus))
            .await
            .unwrap();
        let gateway = InternalWalletGateway::new(ledger, vec!["INR".to_string()]);

        let ok = gateway.initiate(&payment("u1", 300)).await.unwrap();
        assert_eq!(ok.reference, "int_pay_1");

        let err = gateway.initiate(&payment("u1", 301)).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::InsufficientFunds {
                available: 300,
                required: 301
            }
        ));
    }

    #[tokio::test]
    async fn test_callbacks_are_unsupported() {
        let gateway =
            InternalWalletGateway::new(Arc::new(InMemoryLedgerStore::new()), vec!["INR".to_string()]);
        assert!(gateway.settles_synchronously());
        assert!(gateway.verify_callback(b"{}", None).is_err());
        assert_eq!(gateway.poll_status("int_x").await.unwrap(), GatewayOutcome::Succeeded);
    }
}
