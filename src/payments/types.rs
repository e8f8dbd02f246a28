use crate::payments::error::GatewayError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethodType {
    Paybill,
    Rezcoins,
    Upi,
    Card,
    Netbanking,
    Wallet,
    Cod,
}

impl PaymentMethodType {
    /// Catalog order, used as the insertion order for stable sorting.
    pub const ALL: [PaymentMethodType; 7] = [
        PaymentMethodType::Paybill,
        PaymentMethodType::Rezcoins,
        PaymentMethodType::Upi,
        PaymentMethodType::Card,
        PaymentMethodType::Netbanking,
        PaymentMethodType::Wallet,
        PaymentMethodType::Cod,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethodType::Paybill => "paybill",
            PaymentMethodType::Rezcoins => "rezcoins",
            PaymentMethodType::Upi => "upi",
            PaymentMethodType::Card => "card",
            PaymentMethodType::Netbanking => "netbanking",
            PaymentMethodType::Wallet => "wallet",
            PaymentMethodType::Cod => "cod",
        }
    }

    /// Wallet balance and coins settle inside the ledger.
    pub fn is_internal(&self) -> bool {
        matches!(self, PaymentMethodType::Paybill | PaymentMethodType::Rezcoins)
    }

    pub fn rail(&self) -> GatewayRail {
        match self {
            PaymentMethodType::Paybill | PaymentMethodType::Rezcoins => GatewayRail::Internal,
            PaymentMethodType::Upi => GatewayRail::Upi,
            PaymentMethodType::Card => GatewayRail::Card3ds,
            PaymentMethodType::Netbanking => GatewayRail::Bank,
            PaymentMethodType::Wallet => GatewayRail::ExternalWallet,
            PaymentMethodType::Cod => GatewayRail::Cod,
        }
    }

    pub fn gateway(&self) -> GatewayKind {
        match self {
            PaymentMethodType::Paybill | PaymentMethodType::Rezcoins => GatewayKind::Internal,
            PaymentMethodType::Upi | PaymentMethodType::Netbanking | PaymentMethodType::Wallet => {
                GatewayKind::Razorpay
            }
            PaymentMethodType::Card => GatewayKind::Stripe,
            PaymentMethodType::Cod => GatewayKind::None,
        }
    }
}

impl fmt::Display for PaymentMethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentMethodType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        PaymentMethodType::ALL
            .iter()
            .copied()
            .find(|method| method.as_str() == needle)
            .ok_or_else(|| GatewayError::ValidationError {
                message: format!("unsupported payment method: {}", s),
                field: Some("method".to_string()),
            })
    }
}

/// Who operates the rail behind a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    Internal,
    Razorpay,
    Stripe,
    None,
}

impl GatewayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayKind::Internal => "internal",
            GatewayKind::Razorpay => "razorpay",
            GatewayKind::Stripe => "stripe",
            GatewayKind::None => "none",
        }
    }
}

impl fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for GatewayKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "internal" => Ok(GatewayKind::Internal),
            "razorpay" => Ok(GatewayKind::Razorpay),
            "stripe" => Ok(GatewayKind::Stripe),
            "none" => Ok(GatewayKind::None),
            other => Err(GatewayError::ValidationError {
                message: format!("unknown gateway: {}", other),
                field: Some("gateway".to_string()),
            }),
        }
    }
}

/// Adapter variant a payment is routed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayRail {
    Internal,
    #[serde(rename = "card_3ds")]
    Card3ds,
    Bank,
    Upi,
    ExternalWallet,
    Cod,
}

impl GatewayRail {
    pub const ALL: [GatewayRail; 6] = [
        GatewayRail::Internal,
        GatewayRail::Card3ds,
        GatewayRail::Bank,
        GatewayRail::Upi,
        GatewayRail::ExternalWallet,
        GatewayRail::Cod,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayRail::Internal => "internal",
            GatewayRail::Card3ds => "card_3ds",
            GatewayRail::Bank => "bank",
            GatewayRail::Upi => "upi",
            GatewayRail::ExternalWallet => "external_wallet",
            GatewayRail::Cod => "cod",
        }
    }

    /// Rails served by a remote payment gateway.
    pub fn is_external(&self) -> bool {
        !matches!(self, GatewayRail::Internal | GatewayRail::Cod)
    }

    pub fn gateway(&self) -> GatewayKind {
        match self {
            GatewayRail::Internal => GatewayKind::Internal,
            GatewayRail::Card3ds => GatewayKind::Stripe,
            GatewayRail::Bank | GatewayRail::Upi | GatewayRail::ExternalWallet => {
                GatewayKind::Razorpay
            }
            GatewayRail::Cod => GatewayKind::None,
        }
    }

    /// Prefix for per-rail environment variables.
    pub fn env_prefix(&self) -> String {
        format!("GATEWAY_{}", self.as_str().to_uppercase())
    }
}

impl fmt::Display for GatewayRail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for GatewayRail {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase().replace('-', "_");
        GatewayRail::ALL
            .iter()
            .copied()
            .find(|rail| rail.as_str() == needle)
            .ok_or_else(|| GatewayError::ValidationError {
                message: format!("unknown gateway rail: {}", s),
                field: Some("rail".to_string()),
            })
    }
}

// ============================================================================
// Payment lifecycle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Created,
    Initiated,
    AwaitingVerification,
    AwaitingGatewayConfirmation,
    Settled,
    Failed,
    Cancelled,
}

impl PaymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentState::Created => "created",
            PaymentState::Initiated => "initiated",
            PaymentState::AwaitingVerification => "awaiting_verification",
            PaymentState::AwaitingGatewayConfirmation => "awaiting_gateway_confirmation",
            PaymentState::Settled => "settled",
            PaymentState::Failed => "failed",
            PaymentState::Cancelled => "cancelled",
        }
    }

    pub fn valid_transitions(&self) -> Vec<PaymentState> {
        match self {
            PaymentState::Created => vec![PaymentState::Initiated, PaymentState::Cancelled],
            PaymentState::Initiated => vec![
                PaymentState::AwaitingVerification,
                PaymentState::AwaitingGatewayConfirmation,
                PaymentState::Failed,
                PaymentState::Cancelled,
            ],
            PaymentState::AwaitingVerification => vec![
                PaymentState::AwaitingGatewayConfirmation,
                PaymentState::Failed,
                PaymentState::Cancelled,
            ],
            PaymentState::AwaitingGatewayConfirmation => vec![
                PaymentState::Settled,
                PaymentState::Failed,
                PaymentState::Cancelled,
            ],
            PaymentState::Settled | PaymentState::Failed | PaymentState::Cancelled => vec![],
        }
    }

    pub fn can_transition_to(&self, target: PaymentState) -> bool {
        self.valid_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentState::Settled | PaymentState::Failed | PaymentState::Cancelled
        )
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentState {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "created" => Ok(PaymentState::Created),
            "initiated" => Ok(PaymentState::Initiated),
            "awaiting_verification" => Ok(PaymentState::AwaitingVerification),
            "awaiting_gateway_confirmation" => Ok(PaymentState::AwaitingGatewayConfirmation),
            "settled" => Ok(PaymentState::Settled),
            "failed" => Ok(PaymentState::Failed),
            "cancelled" => Ok(PaymentState::Cancelled),
            other => Err(GatewayError::ValidationError {
                message: format!("unknown payment state: {}", other),
                field: Some("state".to_string()),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    GatewayDeclined,
    GatewayTimeout,
    VerificationTimeout,
    VerificationFailed,
    InsufficientFunds,
    UserCancelled,
    GatewayCancelled,
    /// Initiation started but the payment never reached a waiting state.
    InitiationIncomplete,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::GatewayDeclined => "gateway_declined",
            FailureCode::GatewayTimeout => "gateway_timeout",
            FailureCode::VerificationTimeout => "verification_timeout",
            FailureCode::VerificationFailed => "verification_failed",
            FailureCode::InsufficientFunds => "insufficient_funds",
            FailureCode::UserCancelled => "user_cancelled",
            FailureCode::GatewayCancelled => "gateway_cancelled",
            FailureCode::InitiationIncomplete => "initiation_incomplete",
        }
    }
}

impl FromStr for FailureCode {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let codes = [
            FailureCode::GatewayDeclined,
            FailureCode::GatewayTimeout,
            FailureCode::VerificationTimeout,
            FailureCode::VerificationFailed,
            FailureCode::InsufficientFunds,
            FailureCode::UserCancelled,
            FailureCode::GatewayCancelled,
            FailureCode::InitiationIncomplete,
        ];
        codes
            .iter()
            .copied()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| GatewayError::ValidationError {
                message: format!("unknown failure code: {}", s),
                field: Some("failure_code".to_string()),
            })
    }
}

/// One entry of a payment's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentTransition {
    pub from: PaymentState,
    pub to: PaymentState,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: String,
    pub order_id: String,
    pub user_id: String,
    /// Ledger account credited when an external payment settles.
    pub merchant_id: String,
    pub amount: i64,
    pub currency: String,
    pub method: PaymentMethodType,
    pub gateway: GatewayKind,
    pub rail: GatewayRail,
    pub state: PaymentState,
    pub instrument_id: Option<String>,
    pub gateway_reference: Option<String>,
    pub verification_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub failure_reason: Option<String>,
    pub failure_code: Option<FailureCode>,
    /// When the current waiting state gives up.
    pub deadline_at: Option<DateTime<Utc>>,
    pub poll_attempts: u32,
    pub last_polled_at: Option<DateTime<Utc>>,
    /// Set when the payment left `awaiting_gateway_confirmation` for a
    /// terminal state and its settlement ledger entry may still be pending.
    #[serde(default)]
    pub ledger_sync_pending: bool,
    pub transitions: Vec<PaymentTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRecord {
    pub fn new(
        order_id: impl Into<String>,
        user_id: impl Into<String>,
        merchant_id: impl Into<String>,
        amount: i64,
        currency: impl Into<String>,
        method: PaymentMethodType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("pay_{}", Uuid::new_v4().simple()),
            order_id: order_id.into(),
            user_id: user_id.into(),
            merchant_id: merchant_id.into(),
            amount,
            currency: currency.into().to_uppercase(),
            method,
            gateway: method.gateway(),
            rail: method.rail(),
            state: PaymentState::Created,
            instrument_id: None,
            gateway_reference: None,
            verification_id: None,
            idempotency_key: None,
            failure_reason: None,
            failure_code: None,
            deadline_at: None,
            poll_attempts: 0,
            last_polled_at: None,
            ledger_sync_pending: false,
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Instrument the risk engine and verification history are keyed on.
    pub fn effective_instrument(&self) -> String {
        self.instrument_id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.method, self.user_id))
    }

    pub fn has_entered(&self, state: PaymentState) -> bool {
        self.state == state || self.transitions.iter().any(|t| t.to == state)
    }
}

// ============================================================================
// Gateway exchange types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayInitiation {
    pub reference: String,
    pub redirect_url: Option<String>,
    pub provider_data: Option<JsonValue>,
}

/// What a gateway says about a payment, whether pushed or polled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GatewayOutcome {
    Pending,
    Succeeded,
    Failed { reason: String },
    Cancelled { reason: String },
}

impl GatewayOutcome {
    pub fn is_final(&self) -> bool {
        !matches!(self, GatewayOutcome::Pending)
    }
}

/// A verified, parsed gateway callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayCallback {
    pub event_id: String,
    pub reference: String,
    pub outcome: GatewayOutcome,
    pub payload: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelAck {
    pub accepted: bool,
    pub message: Option<String>,
}
