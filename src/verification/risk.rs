//! Risk decision: which trust level an instrument needs for an amount.

use serde::{Deserialize, Serialize};

use super::types::{VerificationLevel, VerificationRecord, VerificationStatus, VerificationType};
use crate::payments::types::GatewayRail;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Amounts at or above each threshold need at least that level.
    pub basic_threshold: i64,
    pub elevated_threshold: i64,
    pub full_threshold: i64,
    /// Failed verifications on the instrument before the requirement rises.
    pub failed_attempts_escalation: usize,
    pub fraud_score_escalation: f64,
    pub fraud_score_block: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            basic_threshold: 2_000,
            elevated_threshold: 10_000,
            full_threshold: 100_000,
            failed_attempts_escalation: 3,
            fraud_score_escalation: 0.7,
            fraud_score_block: 0.9,
        }
    }
}

impl RiskConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let read_i64 = |key: &str, default: i64| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        Self {
            basic_threshold: read_i64("RISK_BASIC_THRESHOLD", defaults.basic_threshold),
            elevated_threshold: read_i64("RISK_ELEVATED_THRESHOLD", defaults.elevated_threshold),
            full_threshold: read_i64("RISK_FULL_THRESHOLD", defaults.full_threshold),
            failed_attempts_escalation: std::env::var("RISK_FAILED_ATTEMPTS_ESCALATION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.failed_attempts_escalation),
            ..defaults
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.basic_threshold > self.elevated_threshold
            || self.elevated_threshold > self.full_threshold
        {
            return Err("risk thresholds must be non-decreasing: basic <= elevated <= full".to_string());
        }
        Ok(())
    }
}

/// Fraud signals available at decision time. All optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskSignals {
    #[serde(default)]
    pub new_device: bool,
    #[serde(default)]
    pub geo_mismatch: bool,
    #[serde(default)]
    pub velocity_exceeded: bool,
    #[serde(default)]
    pub fraud_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub required: VerificationLevel,
    pub current: VerificationLevel,
    pub requires_verification: bool,
    pub reasons: Vec<String>,
}

/// Highest level granted by any verified record. Verified records never lapse.
pub fn trust_level(history: &[VerificationRecord]) -> VerificationLevel {
    history
        .iter()
        .filter(|r| r.status == VerificationStatus::Verified)
        .map(|r| r.verification_type.grants())
        .max()
        .unwrap_or(VerificationLevel::None)
}

pub fn risk_decision(
    config: &RiskConfig,
    history: &[VerificationRecord],
    amount: i64,
    signals: &RiskSignals,
) -> RiskAssessment {
    let mut reasons = Vec::new();

    let mut required = if amount >= config.full_threshold {
        VerificationLevel::Full
    } else if amount >= config.elevated_threshold {
        VerificationLevel::Elevated
    } else if amount >= config.basic_threshold {
        VerificationLevel::Basic
    } else {
        VerificationLevel::None
    };
    if required > VerificationLevel::None {
        reasons.push(format!("amount {} requires {}", amount, required));
    }

    let flagged = signals.new_device || signals.geo_mismatch || signals.velocity_exceeded;
    match signals.fraud_score {
        Some(score) if score >= config.fraud_score_block => {
            required = VerificationLevel::Full;
            reasons.push(format!("fraud score {:.2}", score));
        }
        Some(score) if score >= config.fraud_score_escalation => {
            required = required.bump();
            reasons.push(format!("fraud score {:.2}", score));
        }
        _ if flagged => {
            required = required.bump();
            reasons.push("fraud signals present".to_string());
        }
        _ => {}
    }

    let failures = history
        .iter()
        .filter(|r| r.status == VerificationStatus::Failed)
        .count();
    if failures >= config.failed_attempts_escalation {
        required = required.bump();
        reasons.push(format!("{} failed verifications on instrument", failures));
    }

    let current = trust_level(history);
    RiskAssessment {
        required,
        current,
        requires_verification: current < required,
        reasons,
    }
}

/// Verification the orchestrator starts when a payment on `rail` needs `required`.
pub fn verification_type_for(rail: GatewayRail, required: VerificationLevel) -> VerificationType {
    if required >= VerificationLevel::Full {
        return VerificationType::Kyc;
    }
    match rail {
        GatewayRail::Card3ds => VerificationType::Card3ds,
        GatewayRail::Bank => VerificationType::Bank,
        GatewayRail::Upi => VerificationType::Upi,
        GatewayRail::Internal | GatewayRail::ExternalWallet | GatewayRail::Cod => {
            if required <= VerificationLevel::Basic {
                VerificationType::Otp
            } else {
                VerificationType::Biometric
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(verification_type: VerificationType, status: VerificationStatus) -> VerificationRecord {
        let mut record = VerificationRecord::new("card_1", verification_type, 3, Utc::now());
        record.status = status;
        record
    }

    #[test]
    fn test_small_amount_needs_nothing() {
        let assessment = risk_decision(&RiskConfig::default(), &[], 500, &RiskSignals::default());
        assert_eq!(assessment.required, VerificationLevel::None);
        assert!(!assessment.requires_verification);
    }

    #[test]
    fn test_unverified_card_needs_elevated_for_large_amount() {
        let assessment = risk_decision(&RiskConfig::default(), &[], 20_000, &RiskSignals::default());
        assert_eq!(assessment.required, VerificationLevel::Elevated);
        assert_eq!(assessment.current, VerificationLevel::None);
        assert!(assessment.requires_verification);
        assert_eq!(
            verification_type_for(GatewayRail::Card3ds, assessment.required),
            VerificationType::Card3ds
        );
    }

    #[test]
    fn test_verified_history_satisfies_requirement() {
        let history = vec![
            record(VerificationType::Otp, VerificationStatus::Verified),
            record(VerificationType::Card3ds, VerificationStatus::Verified),
        ];
        let assessment =
            risk_decision(&RiskConfig::default(), &history, 20_000, &RiskSignals::default());
        assert_eq!(assessment.current, VerificationLevel::Elevated);
        assert!(!assessment.requires_verification);
    }

    #[test]
    fn test_signals_and_failures_escalate() {
        let signals = RiskSignals {
            new_device: true,
            ..Default::default()
        };
        let assessment = risk_decision(&RiskConfig::default(), &[], 500, &signals);
        assert_eq!(assessment.required, VerificationLevel::Basic);

        let failures: Vec<_> = (0..3)
            .map(|_| record(VerificationType::Otp, VerificationStatus::Failed))
            .collect();
        let assessment =
            risk_decision(&RiskConfig::default(), &failures, 2_500, &RiskSignals::default());
        assert_eq!(assessment.required, VerificationLevel::Elevated);

        let blocked = RiskSignals {
            fraud_score: Some(0.95),
            ..Default::default()
        };
        let assessment = risk_decision(&RiskConfig::default(), &[], 10, &blocked);
        assert_eq!(assessment.required, VerificationLevel::Full);
        assert_eq!(
            verification_type_for(GatewayRail::Upi, assessment.required),
            VerificationType::Kyc
        );
    }

    #[test]
    fn test_failed_or_expired_records_grant_nothing() {
        let history = vec![
            record(VerificationType::Kyc, VerificationStatus::Failed),
            record(VerificationType::Card3ds, VerificationStatus::Expired),
        ];
        assert_eq!(trust_level(&history), VerificationLevel::None);
    }
}
