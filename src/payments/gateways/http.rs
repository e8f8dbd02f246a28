//! Production adapter for card, bank, UPI and wallet rails served over a
//! JSON REST gateway API.

use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::gateway::{
    outcome_from_status, parse_standard_callback, verify_signed_callback, GatewayAdapter,
};
use crate::payments::types::{
    CancelAck, GatewayCallback, GatewayInitiation, GatewayKind, GatewayOutcome, GatewayRail,
    PaymentRecord,
};
use crate::payments::utils::PaymentHttpClient;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub webhook_secret: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub currencies: Vec<String>,
}

impl HttpGatewayConfig {
    /// Reads `GATEWAY_<RAIL>_*` variables, e.g. `GATEWAY_UPI_API_KEY`.
    pub fn from_env(rail: GatewayRail) -> GatewayResult<Self> {
        let prefix = rail.env_prefix();
        let required = |suffix: &str| {
            let key = format!("{}_{}", prefix, suffix);
            std::env::var(&key).map_err(|_| GatewayError::ValidationError {
                message: format!("{} environment variable is required", key),
                field: Some(key.clone()),
            })
        };

        Ok(Self {
            base_url: required("BASE_URL")?.trim_end_matches('/').to_string(),
            api_key: required("API_KEY")?,
            webhook_secret: std::env::var(format!("{}_WEBHOOK_SECRET", prefix)).ok(),
            timeout_secs: std::env::var(format!("{}_TIMEOUT_SECS", prefix))
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30),
            max_retries: std::env::var(format!("{}_MAX_RETRIES", prefix))
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(3),
            currencies: std::env::var(format!("{}_CURRENCIES", prefix))
                .map(|raw| parse_currency_list(&raw))
                .unwrap_or_else(|_| vec!["INR".to_string()]),
        })
    }
}

pub fn parse_currency_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|c| c.trim().to_uppercase())
        .filter(|c| !c.is_empty())
        .collect()
}

#[derive(Debug, Deserialize)]
struct HttpPaymentData {
    id: String,
    status: String,
    #[serde(default)]
    redirect_url: Option<String>,
    #[serde(default)]
    failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HttpCancelData {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

pub struct HttpGateway {
    rail: GatewayRail,
    config: HttpGatewayConfig,
    http: PaymentHttpClient,
}

impl HttpGateway {
    pub fn new(rail: GatewayRail, config: HttpGatewayConfig) -> GatewayResult<Self> {
        let http =
            PaymentHttpClient::new(Duration::from_secs(config.timeout_secs), config.max_retries)?;
        Ok(Self { rail, config, http })
    }

    pub fn from_env(rail: GatewayRail) -> GatewayResult<Self> {
        Self::new(rail, HttpGatewayConfig::from_env(rail)?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    fn gateway_name(&self) -> String {
        format!("{}:{}", self.rail.gateway(), self.rail)
    }
}

#[async_trait]
impl GatewayAdapter for HttpGateway {
    fn rail(&self) -> GatewayRail {
        self.rail
    }

    fn gateway(&self) -> GatewayKind {
        self.rail.gateway()
    }

    fn supported_currencies(&self) -> &[String] {
        &self.config.currencies
    }

    async fn initiate(&self, payment: &PaymentRecord) -> GatewayResult<GatewayInitiation> {
        if payment.amount <= 0 {
            return Err(GatewayError::ValidationError {
                message: "amount must be greater than zero".to_string(),
                field: Some("amount".to_string()),
            });
        }

        let payload = serde_json::json!({
            "merchant_reference": payment.id,
            "order_id": payment.order_id,
            "amount": payment.amount,
            "currency": payment.currency,
            "method": payment.method,
            "customer_id": payment.user_id,
            "instrument_id": payment.instrument_id,
        });

        let data: HttpPaymentData = self
            .http
            .request_json(
                &self.gateway_name(),
                reqwest::Method::POST,
                &self.endpoint("/v1/payments"),
                Some(&self.config.api_key),
                Some(&payload),
                &[("Idempotency-Key", payment.id.as_str())],
            )
            .await?;

        if let Some(GatewayOutcome::Failed { reason }) =
            outcome_from_status(&data.status, data.failure_reason.clone())
        {
            return Err(GatewayError::Declined {
                message: reason,
                provider_code: Some(data.status),
            });
        }

        info!(
            payment_id = %payment.id,
            reference = %data.id,
            rail = %self.rail,
            "gateway payment initiated"
        );

        Ok(GatewayInitiation {
            reference: data.id,
            redirect_url: data.redirect_url,
            provider_data: None,
        })
    }

    async fn poll_status(&self, reference: &str) -> GatewayResult<GatewayOutcome> {
        let data: HttpPaymentData = self
            .http
            .request_json(
                &self.gateway_name(),
                reqwest::Method::GET,
                &self.endpoint(&format!("/v1/payments/{}", reference)),
                Some(&self.config.api_key),
                None,
                &[],
            )
            .await?;

        outcome_from_status(&data.status, data.failure_reason).ok_or_else(|| {
            GatewayError::ProviderError {
                gateway: self.gateway_name(),
                message: format!("unrecognised payment status '{}'", data.status),
                provider_code: None,
                retryable: false,
            }
        })
    }

    async fn cancel(&self, reference: &str) -> GatewayResult<CancelAck> {
        let data: HttpCancelData = self
            .http
            .request_json(
                &self.gateway_name(),
                reqwest::Method::POST,
                &self.endpoint(&format!("/v1/payments/{}/cancel", reference)),
                Some(&self.config.api_key),
                None,
                &[],
            )
            .await?;

        let accepted = matches!(
            data.status.as_str(),
            "cancelled" | "canceled" | "cancel_requested"
        );
        Ok(CancelAck {
            accepted,
            message: data.message,
        })
    }

    fn verify_callback(&self, payload: &[u8], signature: Option<&str>) -> GatewayResult<bool> {
        verify_signed_callback(
            self.rail,
            self.config.webhook_secret.as_deref(),
            payload,
            signature,
        )
    }

    fn parse_callback(&self, payload: &[u8]) -> GatewayResult<GatewayCallback> {
        parse_standard_callback(self.rail, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HttpGatewayConfig {
        HttpGatewayConfig {
            base_url: "https://api.gateway.test".to_string(),
            api_key: "key".to_string(),
            webhook_secret: None,
            timeout_secs: 5,
            max_retries: 0,
            currencies: vec!["INR".to_string(), "USD".to_string()],
        }
    }

    #[test]
    fn test_currency_list_parsing() {
        assert_eq!(parse_currency_list(" inr, usd ,,"), vec!["INR", "USD"]);
    }

    #[test]
    fn test_gateway_identity_follows_rail() {
        let gateway = HttpGateway::new(GatewayRail::Card3ds, config()).unwrap();
        assert_eq!(gateway.gateway(), GatewayKind::Stripe);
        assert!(gateway.supports_currency("usd"));
        assert_eq!(
            gateway.endpoint("/v1/payments"),
            "https://api.gateway.test/v1/payments"
        );
    }

    #[test]
    fn test_callbacks_rejected_without_secret() {
        let gateway = HttpGateway::new(GatewayRail::Bank, config()).unwrap();
        assert!(matches!(
            gateway.verify_callback(b"{}", Some("abc")),
            Err(GatewayError::CallbackVerificationError { .. })
        ));
    }
}
