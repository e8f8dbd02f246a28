use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error::VerificationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationType {
    #[serde(rename = "card_3ds")]
    Card3ds,
    Bank,
    Upi,
    Kyc,
    Otp,
    Biometric,
    Identity,
}

impl VerificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationType::Card3ds => "card_3ds",
            VerificationType::Bank => "bank",
            VerificationType::Upi => "upi",
            VerificationType::Kyc => "kyc",
            VerificationType::Otp => "otp",
            VerificationType::Biometric => "biometric",
            VerificationType::Identity => "identity",
        }
    }

    /// Trust a verified record of this type confers on its instrument.
    pub fn grants(&self) -> VerificationLevel {
        match self {
            VerificationType::Otp => VerificationLevel::Basic,
            VerificationType::Biometric
            | VerificationType::Upi
            | VerificationType::Card3ds
            | VerificationType::Bank => VerificationLevel::Elevated,
            VerificationType::Kyc | VerificationType::Identity => VerificationLevel::Full,
        }
    }

    /// Resolved by an external reviewer rather than by submitted evidence.
    pub fn requires_review(&self) -> bool {
        matches!(self, VerificationType::Kyc | VerificationType::Identity)
    }
}

impl fmt::Display for VerificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for VerificationType {
    type Err = VerificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "card_3ds" | "card3ds" | "3ds" => Ok(VerificationType::Card3ds),
            "bank" => Ok(VerificationType::Bank),
            "upi" => Ok(VerificationType::Upi),
            "kyc" => Ok(VerificationType::Kyc),
            "otp" => Ok(VerificationType::Otp),
            "biometric" => Ok(VerificationType::Biometric),
            "identity" => Ok(VerificationType::Identity),
            other => Err(VerificationError::InvalidEvidence(format!(
                "unknown verification type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    NotStarted,
    Pending,
    InProgress,
    Verified,
    Failed,
    Expired,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::NotStarted => "not_started",
            VerificationStatus::Pending => "pending",
            VerificationStatus::InProgress => "in_progress",
            VerificationStatus::Verified => "verified",
            VerificationStatus::Failed => "failed",
            VerificationStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VerificationStatus::Verified | VerificationStatus::Failed | VerificationStatus::Expired
        )
    }

    pub fn can_transition_to(&self, target: VerificationStatus) -> bool {
        use VerificationStatus::*;
        match self {
            NotStarted => matches!(target, Pending | InProgress | Failed | Expired),
            Pending => matches!(target, InProgress | Verified | Failed | Expired),
            InProgress => matches!(target, Verified | Failed | Expired),
            Verified | Failed | Expired => false,
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for VerificationStatus {
    type Err = VerificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(VerificationStatus::NotStarted),
            "pending" => Ok(VerificationStatus::Pending),
            "in_progress" => Ok(VerificationStatus::InProgress),
            "verified" => Ok(VerificationStatus::Verified),
            "failed" => Ok(VerificationStatus::Failed),
            "expired" => Ok(VerificationStatus::Expired),
            other => Err(VerificationError::InvalidEvidence(format!(
                "unknown verification status: {}",
                other
            ))),
        }
    }
}

/// Ordered trust classification: none < basic < elevated < full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationLevel {
    None,
    Basic,
    Elevated,
    Full,
}

impl VerificationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationLevel::None => "none",
            VerificationLevel::Basic => "basic",
            VerificationLevel::Elevated => "elevated",
            VerificationLevel::Full => "full",
        }
    }

    pub fn bump(self) -> Self {
        match self {
            VerificationLevel::None => VerificationLevel::Basic,
            VerificationLevel::Basic => VerificationLevel::Elevated,
            VerificationLevel::Elevated | VerificationLevel::Full => VerificationLevel::Full,
        }
    }
}

impl fmt::Display for VerificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Secret half of a challenge. Never serialized into API responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChallengeSecret {
    /// SHA-256 hex of the one-time code.
    CodeHash { hash: String },
    MicroDeposits { amounts: [i64; 2] },
}

/// Evidence submitted to confirm a verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VerificationEvidence {
    Otp {
        code: String,
    },
    Biometric {
        matched: bool,
        score: f64,
    },
    Upi {
        vpa: String,
        code: String,
    },
    #[serde(rename = "card_3ds")]
    Card3ds {
        /// ACS transaction status: Y, A, N, R or U.
        result: String,
        #[serde(default)]
        transaction_id: Option<String>,
    },
    Bank {
        amounts: [i64; 2],
    },
    Document {
        document_type: String,
        reference: String,
    },
}

impl VerificationEvidence {
    pub fn kind(&self) -> &'static str {
        match self {
            VerificationEvidence::Otp { .. } => "otp",
            VerificationEvidence::Biometric { .. } => "biometric",
            VerificationEvidence::Upi { .. } => "upi",
            VerificationEvidence::Card3ds { .. } => "card_3ds",
            VerificationEvidence::Bank { .. } => "bank",
            VerificationEvidence::Document { .. } => "document",
        }
    }

    /// Whether this evidence shape belongs to `verification_type`.
    pub fn fits(&self, verification_type: VerificationType) -> bool {
        matches!(
            (self, verification_type),
            (VerificationEvidence::Otp { .. }, VerificationType::Otp)
                | (VerificationEvidence::Biometric { .. }, VerificationType::Biometric)
                | (VerificationEvidence::Upi { .. }, VerificationType::Upi)
                | (VerificationEvidence::Card3ds { .. }, VerificationType::Card3ds)
                | (VerificationEvidence::Bank { .. }, VerificationType::Bank)
                | (VerificationEvidence::Document { .. }, VerificationType::Kyc)
                | (VerificationEvidence::Document { .. }, VerificationType::Identity)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub id: String,
    pub instrument_id: String,
    pub verification_type: VerificationType,
    pub status: VerificationStatus,
    pub payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Non-secret evidence trail (VPA, document reference, 3DS result).
    pub evidence: JsonValue,
    pub failure_reason: Option<String>,
    #[serde(skip_serializing, default)]
    pub challenge: Option<ChallengeSecret>,
}

impl VerificationRecord {
    pub fn new(
        instrument_id: impl Into<String>,
        verification_type: VerificationType,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("ver_{}", Uuid::new_v4().simple()),
            instrument_id: instrument_id.into(),
            verification_type,
            status: VerificationStatus::NotStarted,
            payment_id: None,
            created_at: now,
            updated_at: now,
            expires_at: None,
            verified_at: None,
            attempts: 0,
            max_attempts,
            evidence: JsonValue::Object(Default::default()),
            failure_reason: None,
            challenge: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

/// Reviewer outcome for KYC and identity checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Reviewer picked the case up.
    InReview,
    Approved,
    Rejected { reason: String },
}
