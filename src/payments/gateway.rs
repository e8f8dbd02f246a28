use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::types::{
    CancelAck, GatewayCallback, GatewayInitiation, GatewayKind, GatewayOutcome, GatewayRail,
    PaymentRecord,
};
use crate::payments::utils::verify_hmac_sha256_hex;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;

/// One payment rail. The orchestrator only talks to rails through this trait.
#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    fn rail(&self) -> GatewayRail;

    fn gateway(&self) -> GatewayKind;

    fn supported_currencies(&self) -> &[String];

    fn supports_currency(&self, currency: &str) -> bool {
        self.supported_currencies()
            .iter()
            .any(|c| c.eq_ignore_ascii_case(currency))
    }

    /// Rails whose outcome is known as soon as initiation returns.
    fn settles_synchronously(&self) -> bool {
        false
    }

    async fn initiate(&self, payment: &PaymentRecord) -> GatewayResult<GatewayInitiation>;

    async fn poll_status(&self, reference: &str) -> GatewayResult<GatewayOutcome>;

    /// Ask the rail to stop a payment. Acceptance is advisory; the final
    /// outcome still arrives through a callback or poll.
    async fn cancel(&self, reference: &str) -> GatewayResult<CancelAck>;

    fn verify_callback(&self, payload: &[u8], signature: Option<&str>) -> GatewayResult<bool>;

    fn parse_callback(&self, payload: &[u8]) -> GatewayResult<GatewayCallback>;
}

/// Callback body shared by the HTTP, sandbox and cash-on-delivery rails.
#[derive(Debug, Deserialize)]
struct CallbackBody {
    event_id: String,
    reference: String,
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

pub fn outcome_from_status(status: &str, reason: Option<String>) -> Option<GatewayOutcome> {
    let reason = || reason.clone().unwrap_or_else(|| status.to_string());
    match status.trim().to_lowercase().as_str() {
        "pending" | "processing" | "created" | "authorized" => Some(GatewayOutcome::Pending),
        "succeeded" | "success" | "captured" | "paid" | "delivered" => {
            Some(GatewayOutcome::Succeeded)
        }
        "failed" | "declined" | "rejected" => Some(GatewayOutcome::Failed { reason: reason() }),
        "cancelled" | "canceled" | "abandoned" | "returned" => {
            Some(GatewayOutcome::Cancelled { reason: reason() })
        }
        _ => None,
    }
}

pub fn parse_standard_callback(rail: GatewayRail, payload: &[u8]) -> GatewayResult<GatewayCallback> {
    let raw: JsonValue =
        serde_json::from_slice(payload).map_err(|e| GatewayError::ValidationError {
            message: format!("invalid {} callback payload: {}", rail, e),
            field: Some("payload".to_string()),
        })?;
    let body: CallbackBody =
        serde_json::from_value(raw.clone()).map_err(|e| GatewayError::ValidationError {
            message: format!("malformed {} callback: {}", rail, e),
            field: Some("payload".to_string()),
        })?;

    let outcome = outcome_from_status(&body.status, body.reason).ok_or_else(|| {
        GatewayError::ValidationError {
            message: format!("unknown callback status '{}'", body.status),
            field: Some("status".to_string()),
        }
    })?;

    Ok(GatewayCallback {
        event_id: body.event_id,
        reference: body.reference,
        outcome,
        payload: raw,
    })
}

/// HMAC-SHA256 check used by every rail that signs its callbacks.
pub fn verify_signed_callback(
    rail: GatewayRail,
    secret: Option<&str>,
    payload: &[u8],
    signature: Option<&str>,
) -> GatewayResult<bool> {
    let secret = secret
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| GatewayError::CallbackVerificationError {
            message: format!("no callback secret configured for {}", rail),
        })?;
    let signature = signature.ok_or_else(|| GatewayError::CallbackVerificationError {
        message: "missing signature header".to_string(),
    })?;
    Ok(verify_hmac_sha256_hex(payload, secret, signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::utils::sign_hmac_sha256_hex;

    #[test]
    fn test_parse_standard_callback() {
        let payload = br#"{"event_id":"evt_1","reference":"ref_9","status":"declined","reason":"do not honor"}"#;
        let callback = parse_standard_callback(GatewayRail::Card3ds, payload).unwrap();
        assert_eq!(callback.event_id, "evt_1");
        assert_eq!(callback.reference, "ref_9");
        assert_eq!(
            callback.outcome,
            GatewayOutcome::Failed {
                reason: "do not honor".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let payload = br#"{"event_id":"evt_1","reference":"ref_9","status":"mystery"}"#;
        assert!(parse_standard_callback(GatewayRail::Upi, payload).is_err());
        assert!(parse_standard_callback(GatewayRail::Upi, b"not json").is_err());
    }

    #[test]
    fn test_signed_callback_requires_secret_and_signature() {
        let payload = br#"{"event_id":"evt_1"}"#;
        let signature = sign_hmac_sha256_hex(payload, "whsec").unwrap();

        assert!(verify_signed_callback(GatewayRail::Upi, Some("whsec"), payload, Some(&signature)).unwrap());
        assert!(!verify_signed_callback(GatewayRail::Upi, Some("whsec"), payload, Some("00")).unwrap());
        assert!(verify_signed_callback(GatewayRail::Upi, Some("whsec"), payload, None).is_err());
        assert!(verify_signed_callback(GatewayRail::Upi, None, payload, Some(&signature)).is_err());
    }
}
