//! Verification state machine
//!
//! Drives a `VerificationRecord` from `not_started` to `verified`, `failed`
//! or `expired`. Every type shares the same status names; only the evidence
//! and the way it is evaluated differ. A verified record is never changed
//! again; re-verification appends a new record to the instrument's history.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, OnceLock};
use tracing::{error, info, warn};

use super::challenge::{code_matches, deposits_match, hash_code, ChallengeIssuer};
use super::error::{VerificationError, VerificationResult};
use super::risk::{risk_decision, trust_level, RiskAssessment, RiskConfig, RiskSignals};
use super::store::VerificationStore;
use super::types::{
    ChallengeSecret, ReviewDecision, VerificationEvidence, VerificationLevel, VerificationRecord,
    VerificationStatus, VerificationType,
};
use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::services::notification::NotificationService;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Evidence submissions allowed before a record fails.
    pub max_attempts: u32,
    pub otp_ttl_minutes: i64,
    pub upi_ttl_minutes: i64,
    pub biometric_ttl_minutes: i64,
    pub card_3ds_ttl_minutes: i64,
    pub micro_deposit_ttl_days: i64,
    pub kyc_ttl_days: i64,
    pub biometric_min_score: f64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            otp_ttl_minutes: 10,
            upi_ttl_minutes: 10,
            biometric_ttl_minutes: 5,
            card_3ds_ttl_minutes: 15,
            micro_deposit_ttl_days: 5,
            kyc_ttl_days: 30,
            biometric_min_score: 0.8,
        }
    }
}

impl VerificationConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let read_i64 = |key: &str, default: i64| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        Self {
            max_attempts: std::env::var("VERIFICATION_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_attempts),
            otp_ttl_minutes: read_i64("VERIFICATION_OTP_TTL_MINUTES", defaults.otp_ttl_minutes),
            upi_ttl_minutes: read_i64("VERIFICATION_UPI_TTL_MINUTES", defaults.upi_ttl_minutes),
            biometric_ttl_minutes: read_i64(
                "VERIFICATION_BIOMETRIC_TTL_MINUTES",
                defaults.biometric_ttl_minutes,
            ),
            card_3ds_ttl_minutes: read_i64(
                "VERIFICATION_3DS_TTL_MINUTES",
                defaults.card_3ds_ttl_minutes,
            ),
            micro_deposit_ttl_days: read_i64(
                "VERIFICATION_MICRO_DEPOSIT_TTL_DAYS",
                defaults.micro_deposit_ttl_days,
            ),
            kyc_ttl_days: read_i64("VERIFICATION_KYC_TTL_DAYS", defaults.kyc_ttl_days),
            biometric_min_score: std::env::var("VERIFICATION_BIOMETRIC_MIN_SCORE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.biometric_min_score),
        }
    }

    pub fn ttl_for(&self, verification_type: VerificationType) -> Duration {
        match verification_type {
            VerificationType::Otp => Duration::minutes(self.otp_ttl_minutes),
            VerificationType::Upi => Duration::minutes(self.upi_ttl_minutes),
            VerificationType::Biometric => Duration::minutes(self.biometric_ttl_minutes),
            VerificationType::Card3ds => Duration::minutes(self.card_3ds_ttl_minutes),
            VerificationType::Bank => Duration::days(self.micro_deposit_ttl_days),
            VerificationType::Kyc | VerificationType::Identity => {
                Duration::days(self.kyc_ttl_days)
            }
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartVerificationRequest {
    pub instrument_id: String,
    pub verification_type: VerificationType,
    #[serde(default)]
    pub payment_id: Option<String>,
    /// Virtual payment address, required for UPI.
    #[serde(default)]
    pub vpa: Option<String>,
}

impl StartVerificationRequest {
    pub fn new(instrument_id: impl Into<String>, verification_type: VerificationType) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            verification_type,
            payment_id: None,
            vpa: None,
        }
    }

    pub fn for_payment(mut self, payment_id: impl Into<String>) -> Self {
        self.payment_id = Some(payment_id.into());
        self
    }

    pub fn with_vpa(mut self, vpa: impl Into<String>) -> Self {
        self.vpa = Some(vpa.into());
        self
    }
}

pub fn is_valid_vpa(vpa: &str) -> bool {
    static VPA_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    VPA_PATTERN
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9.\-_]{2,256}@[a-zA-Z][a-zA-Z0-9]{2,64}$").ok())
        .as_ref()
        .map(|re| re.is_match(vpa))
        .unwrap_or(false)
}

enum Verdict {
    Passed,
    /// Evidence is conclusive against the instrument; no further attempts.
    Rejected(String),
    /// Wrong evidence; counts against the attempt budget.
    Retry(String),
}

// ============================================================================
// Service
// ============================================================================

pub struct VerificationService {
    store: Arc<dyn VerificationStore>,
    issuer: Arc<dyn ChallengeIssuer>,
    notifier: Arc<NotificationService>,
    config: VerificationConfig,
    risk: RiskConfig,
}

impl VerificationService {
    pub fn new(
        store: Arc<dyn VerificationStore>,
        issuer: Arc<dyn ChallengeIssuer>,
        notifier: Arc<NotificationService>,
        config: VerificationConfig,
        risk: RiskConfig,
    ) -> Self {
        Self {
            store,
            issuer,
            notifier,
            config,
            risk,
        }
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    pub async fn get(&self, verification_id: &str) -> VerificationResult<VerificationRecord> {
        self.store
            .get(verification_id)
            .await?
            .ok_or_else(|| VerificationError::NotFound {
                verification_id: verification_id.to_string(),
            })
    }

    pub async fn history(&self, instrument_id: &str) -> VerificationResult<Vec<VerificationRecord>> {
        Ok(self.store.history(instrument_id).await?)
    }

    pub async fn trust_level(&self, instrument_id: &str) -> VerificationResult<VerificationLevel> {
        let history = self.store.history(instrument_id).await?;
        Ok(trust_level(&history))
    }

    /// Trust required for `amount` against what the instrument already holds.
    pub async fn assess(
        &self,
        instrument_id: &str,
        amount: i64,
        signals: &RiskSignals,
    ) -> VerificationResult<RiskAssessment> {
        let history = self.store.history(instrument_id).await?;
        Ok(risk_decision(&self.risk, &history, amount, signals))
    }

    /// Open a new verification record and issue its challenge, if any.
    pub async fn start_verification(
        &self,
        request: StartVerificationRequest,
        now: DateTime<Utc>,
    ) -> VerificationResult<VerificationRecord> {
        if request.instrument_id.trim().is_empty() {
            return Err(VerificationError::InvalidEvidence(
                "instrument_id is required".to_string(),
            ));
        }

        let verification_type = request.verification_type;
        let mut record = VerificationRecord::new(
            request.instrument_id.trim(),
            verification_type,
            self.config.max_attempts,
            now,
        );
        record.payment_id = request.payment_id.clone();
        record.expires_at = Some(now + self.config.ttl_for(verification_type));

        let channel = match verification_type {
            VerificationType::Otp => {
                let code = self.issuer.one_time_code();
                record.challenge = Some(ChallengeSecret::CodeHash {
                    hash: hash_code(&code),
                });
                record.status = VerificationStatus::Pending;
                Some("sms")
            }
            VerificationType::Upi => {
                let vpa = request
                    .vpa
                    .as_deref()
                    .map(str::trim)
                    .filter(|v| is_valid_vpa(v))
                    .ok_or_else(|| {
                        VerificationError::InvalidEvidence(
                            "a valid UPI VPA (name@handle) is required".to_string(),
                        )
                    })?;
                let code = self.issuer.one_time_code();
                record.challenge = Some(ChallengeSecret::CodeHash {
                    hash: hash_code(&code),
                });
                record.evidence = json!({ "vpa": vpa.to_lowercase() });
                record.status = VerificationStatus::Pending;
                Some("upi_collect")
            }
            VerificationType::Bank => {
                record.challenge = Some(ChallengeSecret::MicroDeposits {
                    amounts: self.issuer.micro_deposits(),
                });
                record.status = VerificationStatus::Pending;
                Some("bank_transfer")
            }
            VerificationType::Biometric | VerificationType::Card3ds => {
                record.status = VerificationStatus::Pending;
                None
            }
            // Waits for document submission.
            VerificationType::Kyc | VerificationType::Identity => None,
        };

        self.store.insert(&record).await?;

        info!(
            verification_id = %record.id,
            instrument_id = %record.instrument_id,
            verification_type = %verification_type,
            status = %record.status,
            payment_id = record.payment_id.as_deref().unwrap_or(""),
            "Verification started"
        );

        if let Some(channel) = channel {
            self.notifier.challenge_issued(&record, channel).await;
        }

        Ok(record)
    }

    /// Evaluate submitted evidence.
    ///
    /// A wrong answer consumes an attempt and leaves the record `in_progress`
    /// until the budget runs out. Confirming an already verified record
    /// returns it unchanged.
    pub async fn confirm_verification(
        &self,
        verification_id: &str,
        evidence: VerificationEvidence,
        now: DateTime<Utc>,
    ) -> VerificationResult<VerificationRecord> {
        let record = self.get(verification_id).await?;
        let record = self.ensure_open(record, now).await?;
        if record.status == VerificationStatus::Verified {
            return Ok(record);
        }

        if !evidence.fits(record.verification_type) {
            return Err(VerificationError::InvalidEvidence(format!(
                "{} evidence does not apply to a {} verification",
                evidence.kind(),
                record.verification_type
            )));
        }

        if record.verification_type.requires_review() {
            return self.submit_documents(record, evidence, now).await;
        }

        let expected = record.status;
        let mut updated = record;
        let verdict = self.evaluate(&updated, &evidence);
        updated.attempts += 1;
        updated.updated_at = now;
        updated.evidence = merge_evidence(&updated.evidence, &evidence);

        match verdict {
            Verdict::Passed => {
                updated.status = VerificationStatus::Verified;
                updated.verified_at = Some(now);
                updated.challenge = None;
            }
            Verdict::Rejected(reason) => {
                updated.status = VerificationStatus::Failed;
                updated.failure_reason = Some(reason);
                updated.challenge = None;
            }
            Verdict::Retry(reason) if updated.attempts >= updated.max_attempts => {
                updated.status = VerificationStatus::Failed;
                updated.failure_reason =
                    Some(format!("{} (attempt limit of {} reached)", reason, updated.max_attempts));
                updated.challenge = None;
            }
            Verdict::Retry(reason) => {
                updated.status = VerificationStatus::InProgress;
                updated.failure_reason = Some(reason);
            }
        }

        self.write(expected, &updated).await?;

        match updated.status {
            VerificationStatus::Verified => info!(
                verification_id = %updated.id,
                instrument_id = %updated.instrument_id,
                verification_type = %updated.verification_type,
                attempts = updated.attempts,
                "Verification succeeded"
            ),
            VerificationStatus::Failed => warn!(
                verification_id = %updated.id,
                instrument_id = %updated.instrument_id,
                verification_type = %updated.verification_type,
                attempts = updated.attempts,
                reason = updated.failure_reason.as_deref().unwrap_or(""),
                "Verification failed"
            ),
            _ => info!(
                verification_id = %updated.id,
                attempts_remaining = updated.attempts_remaining(),
                "Verification evidence rejected, attempts remain"
            ),
        }

        Ok(updated)
    }

    /// Apply an external reviewer's decision to a KYC or identity record.
    pub async fn resolve_review(
        &self,
        verification_id: &str,
        decision: ReviewDecision,
        now: DateTime<Utc>,
    ) -> VerificationResult<VerificationRecord> {
        let record = self.get(verification_id).await?;
        if !record.verification_type.requires_review() {
            return Err(VerificationError::InvalidEvidence(format!(
                "{} verifications are not resolved by review",
                record.verification_type
            )));
        }
        let record = self.ensure_open(record, now).await?;

        let target = match &decision {
            ReviewDecision::InReview => VerificationStatus::InProgress,
            ReviewDecision::Approved => VerificationStatus::Verified,
            ReviewDecision::Rejected { .. } => VerificationStatus::Failed,
        };
        if record.status == target {
            return Ok(record);
        }
        if !record.status.can_transition_to(target) {
            error!(
                verification_id = %record.id,
                from_status = %record.status,
                to_status = %target,
                "Invalid verification transition from review"
            );
            return Err(VerificationError::InvalidTransition {
                verification_id: record.id,
                from: record.status,
                to: target,
            });
        }

        let expected = record.status;
        let mut updated = record;
        updated.status = target;
        updated.updated_at = now;
        match decision {
            ReviewDecision::Approved => updated.verified_at = Some(now),
            ReviewDecision::Rejected { reason } => updated.failure_reason = Some(reason),
            ReviewDecision::InReview => {}
        }

        self.write(expected, &updated).await?;

        info!(
            verification_id = %updated.id,
            instrument_id = %updated.instrument_id,
            from_status = %expected,
            to_status = %updated.status,
            "Verification review applied"
        );

        Ok(updated)
    }

    /// Move every open record past its deadline to `expired`.
    pub async fn expire_stale(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> VerificationResult<Vec<VerificationRecord>> {
        let candidates = self.store.list_expired(now, limit).await?;
        let mut expired = Vec::with_capacity(candidates.len());

        for record in candidates {
            let id = record.id.clone();
            match self.expire(record, now).await {
                Ok(Some(record)) => expired.push(record),
                Ok(None) => {}
                Err(e) => warn!(verification_id = %id, error = %e, "Failed to expire verification"),
            }
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Expired stale verifications");
        }
        Ok(expired)
    }

    /// Rejects terminal failures and lazily expires records past their deadline.
    async fn ensure_open(
        &self,
        record: VerificationRecord,
        now: DateTime<Utc>,
    ) -> VerificationResult<VerificationRecord> {
        match record.status {
            VerificationStatus::Verified => return Ok(record),
            VerificationStatus::Failed => {
                return Err(VerificationError::Failed {
                    verification_id: record.id,
                    reason: record
                        .failure_reason
                        .unwrap_or_else(|| "verification failed".to_string()),
                })
            }
            VerificationStatus::Expired => {
                return Err(VerificationError::Expired {
                    verification_id: record.id,
                })
            }
            _ => {}
        }

        if record.is_expired_at(now) {
            let verification_id = record.id.clone();
            self.expire(record, now).await?;
            return Err(VerificationError::Expired { verification_id });
        }
        Ok(record)
    }

    async fn expire(
        &self,
        record: VerificationRecord,
        now: DateTime<Utc>,
    ) -> VerificationResult<Option<VerificationRecord>> {
        if record.status.is_terminal() {
            return Ok(None);
        }
        let expected = record.status;
        let mut updated = record;
        updated.status = VerificationStatus::Expired;
        updated.updated_at = now;
        updated.failure_reason = Some("verification window elapsed".to_string());
        updated.challenge = None;

        if !self.store.compare_and_swap(expected, &updated).await? {
            return Ok(None);
        }
        info!(
            verification_id = %updated.id,
            instrument_id = %updated.instrument_id,
            from_status = %expected,
            "Verification expired"
        );
        Ok(Some(updated))
    }

    async fn submit_documents(
        &self,
        record: VerificationRecord,
        evidence: VerificationEvidence,
        now: DateTime<Utc>,
    ) -> VerificationResult<VerificationRecord> {
        if record.status != VerificationStatus::NotStarted {
            error!(
                verification_id = %record.id,
                from_status = %record.status,
                to_status = %VerificationStatus::Pending,
                "Documents already submitted for verification"
            );
            return Err(VerificationError::InvalidTransition {
                verification_id: record.id,
                from: record.status,
                to: VerificationStatus::Pending,
            });
        }

        let mut updated = record;
        updated.status = VerificationStatus::Pending;
        updated.updated_at = now;
        updated.attempts += 1;
        updated.evidence = merge_evidence(&updated.evidence, &evidence);

        self.write(VerificationStatus::NotStarted, &updated).await?;

        info!(
            verification_id = %updated.id,
            instrument_id = %updated.instrument_id,
            verification_type = %updated.verification_type,
            "Verification documents submitted for review"
        );
        Ok(updated)
    }

    fn evaluate(&self, record: &VerificationRecord, evidence: &VerificationEvidence) -> Verdict {
        match (evidence, record.challenge.as_ref()) {
            (VerificationEvidence::Otp { code }, Some(ChallengeSecret::CodeHash { hash })) => {
                if code_matches(code, hash) {
                    Verdict::Passed
                } else {
                    Verdict::Retry("one-time code did not match".to_string())
                }
            }
            (VerificationEvidence::Upi { vpa, code }, Some(ChallengeSecret::CodeHash { hash })) => {
                let expected_vpa = record.evidence.get("vpa").and_then(|v| v.as_str());
                if expected_vpa != Some(vpa.trim().to_lowercase().as_str()) {
                    Verdict::Retry("VPA does not match the address being verified".to_string())
                } else if !code_matches(code, hash) {
                    Verdict::Retry("UPI collect code did not match".to_string())
                } else {
                    Verdict::Passed
                }
            }
            (VerificationEvidence::Bank { amounts }, Some(ChallengeSecret::MicroDeposits { amounts: expected })) => {
                if deposits_match(*expected, *amounts) {
                    Verdict::Passed
                } else {
                    Verdict::Retry("micro-deposit amounts did not match".to_string())
                }
            }
            (VerificationEvidence::Biometric { matched, score }, _) => {
                if *matched && *score >= self.config.biometric_min_score {
                    Verdict::Passed
                } else {
                    Verdict::Retry(format!("biometric match below threshold (score {:.2})", score))
                }
            }
            (VerificationEvidence::Card3ds { result, .. }, _) => {
                match result.trim().to_uppercase().as_str() {
                    "Y" | "A" => Verdict::Passed,
                    "N" | "R" => Verdict::Rejected(format!(
                        "3-D Secure authentication rejected ({})",
                        result.trim().to_uppercase()
                    )),
                    other => Verdict::Retry(format!("3-D Secure result {} is inconclusive", other)),
                }
            }
            _ => Verdict::Rejected("verification challenge is no longer available".to_string()),
        }
    }

    async fn write(
        &self,
        expected: VerificationStatus,
        record: &VerificationRecord,
    ) -> VerificationResult<()> {
        if self.store.compare_and_swap(expected, record).await? {
            return Ok(());
        }
        Err(VerificationError::Storage(DatabaseError::new(
            DatabaseErrorKind::Conflict {
                message: format!("verification {} changed concurrently", record.id),
            },
        )))
    }
}

/// Keep only the non-secret parts of evidence on the record.
fn merge_evidence(current: &serde_json::Value, evidence: &VerificationEvidence) -> serde_json::Value {
    let mut trail = current.clone();
    let addition = match evidence {
        VerificationEvidence::Otp { .. } | VerificationEvidence::Bank { .. } => json!({}),
        VerificationEvidence::Upi { vpa, .. } => json!({ "submitted_vpa": vpa.trim().to_lowercase() }),
        VerificationEvidence::Biometric { matched, score } => {
            json!({ "biometric_matched": matched, "biometric_score": score })
        }
        VerificationEvidence::Card3ds {
            result,
            transaction_id,
        } => json!({ "three_ds_result": result, "three_ds_transaction_id": transaction_id }),
        VerificationEvidence::Document {
            document_type,
            reference,
        } => json!({ "document_type": document_type, "document_reference": reference }),
    };
    if let (Some(target), Some(source)) = (trail.as_object_mut(), addition.as_object()) {
        for (key, value) in source {
            target.insert(key.clone(), value.clone());
        }
    }
    trail
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::challenge::SandboxChallengeIssuer;
    use crate::verification::store::InMemoryVerificationStore;

    fn service() -> VerificationService {
        VerificationService::new(
            Arc::new(InMemoryVerificationStore::new()),
            Arc::new(SandboxChallengeIssuer),
            Arc::new(NotificationService::new()),
            VerificationConfig::default(),
            RiskConfig::default(),
        )
    }

    #[test]
    fn test_vpa_validation() {
        assert!(is_valid_vpa("priya.s@okaxis"));
        assert!(is_valid_vpa("98765-43210@ybl"));
        assert!(!is_valid_vpa("no-handle"));
        assert!(!is_valid_vpa("a@1bank"));
        assert!(!is_valid_vpa("x@ab"));
    }

    #[tokio::test]
    async fn test_otp_verifies_with_correct_code() {
        let service = service();
        let now = Utc::now();
        let record = service
            .start_verification(StartVerificationRequest::new("card_1", VerificationType::Otp), now)
            .await
            .unwrap();
        assert_eq!(record.status, VerificationStatus::Pending);
        assert_eq!(record.expires_at, Some(now + Duration::minutes(10)));

        let verified = service
            .confirm_verification(
                &record.id,
                VerificationEvidence::Otp {
                    code: SandboxChallengeIssuer::CODE.to_string(),
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(verified.status, VerificationStatus::Verified);
        assert_eq!(verified.verified_at, Some(now));
        assert!(verified.challenge.is_none());
        assert_eq!(
            service.trust_level("card_1").await.unwrap(),
            VerificationLevel::Basic
        );

        // Confirming again is a no-op.
        let again = service
            .confirm_verification(
                &record.id,
                VerificationEvidence::Otp {
                    code: "000000".to_string(),
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(again.status, VerificationStatus::Verified);
        assert_eq!(again.attempts, 1);
    }

    #[tokio::test]
    async fn test_otp_fails_after_attempt_budget() {
        let service = service();
        let now = Utc::now();
        let record = service
            .start_verification(StartVerificationRequest::new("card_1", VerificationType::Otp), now)
            .await
            .unwrap();
        let wrong = || VerificationEvidence::Otp {
            code: "999999".to_string(),
        };

        let first = service.confirm_verification(&record.id, wrong(), now).await.unwrap();
        assert_eq!(first.status, VerificationStatus::InProgress);
        assert_eq!(first.attempts_remaining(), 2);
        let second = service.confirm_verification(&record.id, wrong(), now).await.unwrap();
        assert_eq!(second.status, VerificationStatus::InProgress);
        let third = service.confirm_verification(&record.id, wrong(), now).await.unwrap();
        assert_eq!(third.status, VerificationStatus::Failed);
        assert!(third.failure_reason.is_some());

        let err = service
            .confirm_verification(
                &record.id,
                VerificationEvidence::Otp {
                    code: SandboxChallengeIssuer::CODE.to_string(),
                },
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::Failed { .. }));
    }

    #[tokio::test]
    async fn test_bank_micro_deposits_need_exact_amounts() {
        let service = service();
        let now = Utc::now();
        let record = service
            .start_verification(StartVerificationRequest::new("acct_1", VerificationType::Bank), now)
            .await
            .unwrap();
        assert_eq!(record.expires_at, Some(now + Duration::days(5)));

        let off_by_one = service
            .confirm_verification(&record.id, VerificationEvidence::Bank { amounts: [12, 35] }, now)
            .await
            .unwrap();
        assert_eq!(off_by_one.status, VerificationStatus::InProgress);

        let verified = service
            .confirm_verification(&record.id, VerificationEvidence::Bank { amounts: [34, 12] }, now)
            .await
            .unwrap();
        assert_eq!(verified.status, VerificationStatus::Verified);
        // Deposit amounts are never written to the evidence trail.
        assert!(!verified.evidence.to_string().contains("34"));
    }

    #[tokio::test]
    async fn test_upi_requires_valid_vpa() {
        let service = service();
        let now = Utc::now();
        let err = service
            .start_verification(
                StartVerificationRequest::new("upi_1", VerificationType::Upi).with_vpa("bad"),
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::InvalidEvidence(_)));

        let record = service
            .start_verification(
                StartVerificationRequest::new("upi_1", VerificationType::Upi)
                    .with_vpa("Priya@okaxis"),
                now,
            )
            .await
            .unwrap();
        let verified = service
            .confirm_verification(
                &record.id,
                VerificationEvidence::Upi {
                    vpa: "priya@okaxis".to_string(),
                    code: SandboxChallengeIssuer::CODE.to_string(),
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(verified.status, VerificationStatus::Verified);
    }

    #[tokio::test]
    async fn test_3ds_rejection_is_final() {
        let service = service();
        let now = Utc::now();
        let record = service
            .start_verification(StartVerificationRequest::new("card_9", VerificationType::Card3ds), now)
            .await
            .unwrap();
        let failed = service
            .confirm_verification(
                &record.id,
                VerificationEvidence::Card3ds {
                    result: "N".to_string(),
                    transaction_id: None,
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(failed.status, VerificationStatus::Failed);
        assert_eq!(failed.attempts, 1);
    }

    #[tokio::test]
    async fn test_mismatched_evidence_is_rejected() {
        let service = service();
        let now = Utc::now();
        let record = service
            .start_verification(StartVerificationRequest::new("card_1", VerificationType::Otp), now)
            .await
            .unwrap();
        let err = service
            .confirm_verification(&record.id, VerificationEvidence::Bank { amounts: [1, 2] }, now)
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::InvalidEvidence(_)));
        assert_eq!(service.get(&record.id).await.unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_expired_record_cannot_be_confirmed() {
        let service = service();
        let now = Utc::now();
        let record = service
            .start_verification(
                StartVerificationRequest::new("bio_1", VerificationType::Biometric),
                now,
            )
            .await
            .unwrap();
        let later = now + Duration::minutes(6);
        let err = service
            .confirm_verification(
                &record.id,
                VerificationEvidence::Biometric {
                    matched: true,
                    score: 0.99,
                },
                later,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::Expired { .. }));
        assert_eq!(
            service.get(&record.id).await.unwrap().status,
            VerificationStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_expire_stale_sweeps_open_records() {
        let service = service();
        let now = Utc::now();
        let otp = service
            .start_verification(StartVerificationRequest::new("card_1", VerificationType::Otp), now)
            .await
            .unwrap();
        service
            .start_verification(StartVerificationRequest::new("acct_1", VerificationType::Bank), now)
            .await
            .unwrap();

        let expired = service
            .expire_stale(now + Duration::hours(1), 100)
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, otp.id);
    }

    #[tokio::test]
    async fn test_kyc_review_flow() {
        let service = service();
        let now = Utc::now();
        let record = service
            .start_verification(StartVerificationRequest::new("user_7", VerificationType::Kyc), now)
            .await
            .unwrap();
        assert_eq!(record.status, VerificationStatus::NotStarted);

        // A reviewer cannot approve before documents arrive.
        let err = service
            .resolve_review(&record.id, ReviewDecision::Approved, now)
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::InvalidTransition { .. }));

        let pending = service
            .confirm_verification(
                &record.id,
                VerificationEvidence::Document {
                    document_type: "passport".to_string(),
                    reference: "doc_123".to_string(),
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(pending.status, VerificationStatus::Pending);

        let reviewing = service
            .resolve_review(&record.id, ReviewDecision::InReview, now)
            .await
            .unwrap();
        assert_eq!(reviewing.status, VerificationStatus::InProgress);

        let verified = service
            .resolve_review(&record.id, ReviewDecision::Approved, now)
            .await
            .unwrap();
        assert_eq!(verified.status, VerificationStatus::Verified);
        assert_eq!(
            service.trust_level("user_7").await.unwrap(),
            VerificationLevel::Full
        );

        // Verified records never revert.
        let err = service
            .resolve_review(
                &record.id,
                ReviewDecision::Rejected {
                    reason: "late".to_string(),
                },
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_reverification_appends_history() {
        let service = service();
        let now = Utc::now();
        for offset in 0..2 {
            let record = service
                .start_verification(
                    StartVerificationRequest::new("card_1", VerificationType::Otp),
                    now + Duration::seconds(offset),
                )
                .await
                .unwrap();
            service
                .confirm_verification(
                    &record.id,
                    VerificationEvidence::Otp {
                        code: SandboxChallengeIssuer::CODE.to_string(),
                    },
                    now + Duration::seconds(offset),
                )
                .await
                .unwrap();
        }
        let history = service.history("card_1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history
            .iter()
            .all(|r| r.status == VerificationStatus::Verified));
    }
}
