//! Ledger domain types: balances, transactions and their lifecycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

use super::error::LedgerError;

/// Amounts are integer minor units (paise, cents, coins).
pub type MinorUnits = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Credit => "credit",
            Direction::Debit => "debit",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Direction {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "credit" => Ok(Direction::Credit),
            "debit" => Ok(Direction::Debit),
            other => Err(LedgerError::Validation(format!(
                "unknown transaction direction: {}",
                other
            ))),
        }
    }
}

/// Where a balance-affecting event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionSource {
    Purchase,
    Review,
    Referral,
    DailyLogin,
    Achievement,
    Challenge,
    SpinWheel,
    BillUpload,
    VideoUpload,
    SocialShare,
    Bonus,
    Admin,
    PaymentSettlement,
}

impl TransactionSource {
    pub const ALL: [TransactionSource; 13] = [
        TransactionSource::Purchase,
        TransactionSource::Review,
        TransactionSource::Referral,
        TransactionSource::DailyLogin,
        TransactionSource::Achievement,
        TransactionSource::Challenge,
        TransactionSource::SpinWheel,
        TransactionSource::BillUpload,
        TransactionSource::VideoUpload,
        TransactionSource::SocialShare,
        TransactionSource::Bonus,
        TransactionSource::Admin,
        TransactionSource::PaymentSettlement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionSource::Purchase => "purchase",
            TransactionSource::Review => "review",
            TransactionSource::Referral => "referral",
            TransactionSource::DailyLogin => "daily_login",
            TransactionSource::Achievement => "achievement",
            TransactionSource::Challenge => "challenge",
            TransactionSource::SpinWheel => "spin_wheel",
            TransactionSource::BillUpload => "bill_upload",
            TransactionSource::VideoUpload => "video_upload",
            TransactionSource::SocialShare => "social_share",
            TransactionSource::Bonus => "bonus",
            TransactionSource::Admin => "admin",
            TransactionSource::PaymentSettlement => "payment_settlement",
        }
    }
}

impl fmt::Display for TransactionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionSource {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        TransactionSource::ALL
            .iter()
            .copied()
            .find(|source| source.as_str() == needle)
            .ok_or_else(|| LedgerError::Validation(format!("unknown transaction source: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Cancelled,
    Expired,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Cancelled => "cancelled",
            TransactionStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    /// Only `pending` may move, and only into one of the terminal states.
    pub fn can_transition_to(&self, target: TransactionStatus) -> bool {
        matches!(self, TransactionStatus::Pending) && target.is_terminal()
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "cancelled" => Ok(TransactionStatus::Cancelled),
            "expired" => Ok(TransactionStatus::Expired),
            other => Err(LedgerError::Validation(format!(
                "unknown transaction status: {}",
                other
            ))),
        }
    }
}

/// Per-user aggregate maintained by the ledger.
///
/// `available + pending == lifetime_earned - lifetime_spent` holds after every
/// accepted operation; see [`Balance::is_conserved`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub user_id: String,
    pub available: MinorUnits,
    pub pending: MinorUnits,
    pub lifetime_earned: MinorUnits,
    pub lifetime_spent: MinorUnits,
}

/// Immutable record in the append-only transaction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: String,
    pub user_id: String,
    /// Position in the user's log, assigned when the store first accepts the id.
    pub sequence: i64,
    pub direction: Direction,
    pub amount: MinorUnits,
    pub source: TransactionSource,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: JsonValue,
}

impl LedgerTransaction {
    /// True when `other` describes the same economic effect as this record.
    pub fn same_effect(&self, other: &NewTransaction) -> bool {
        self.user_id == other.user_id
            && self.direction == other.direction
            && self.amount == other.amount
            && self.source == other.source
    }
}

/// A transaction as submitted to [`crate::ledger::LedgerStore::apply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub id: String,
    pub user_id: String,
    pub direction: Direction,
    pub amount: MinorUnits,
    pub source: TransactionSource,
    /// `Pending` or `Completed`; terminal failure states cannot be applied.
    pub status: TransactionStatus,
    #[serde(default)]
    pub metadata: JsonValue,
}

impl NewTransaction {
    pub fn credit(
        id: impl Into<String>,
        user_id: impl Into<String>,
        amount: MinorUnits,
        source: TransactionSource,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            direction: Direction::Credit,
            amount,
            source,
            status: TransactionStatus::Completed,
            metadata: JsonValue::Object(Default::default()),
        }
    }

    pub fn debit(
        id: impl Into<String>,
        user_id: impl Into<String>,
        amount: MinorUnits,
        source: TransactionSource,
    ) -> Self {
        Self {
            direction: Direction::Debit,
            ..Self::credit(id, user_id, amount, source)
        }
    }

    pub fn pending(mut self) -> Self {
        self.status = TransactionStatus::Pending;
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.id.trim().is_empty() {
            return Err(LedgerError::Validation(
                "transaction id must not be empty".to_string(),
            ));
        }
        if self.user_id.trim().is_empty() {
            return Err(LedgerError::Validation(
                "user id must not be empty".to_string(),
            ));
        }
        if self.amount < 0 {
            return Err(LedgerError::Validation(format!(
                "amount must be non-negative, got {}",
                self.amount
            )));
        }
        if self.status.is_terminal() && self.status != TransactionStatus::Completed {
            return Err(LedgerError::Validation(format!(
                "a new transaction cannot start in status {}",
                self.status
            )));
        }
        Ok(())
    }

    pub fn into_record(self, sequence: i64, now: DateTime<Utc>) -> LedgerTransaction {
        let completed_at = (self.status == TransactionStatus::Completed).then_some(now);
        LedgerTransaction {
            id: self.id,
            user_id: self.user_id,
            sequence,
            direction: self.direction,
            amount: self.amount,
            source: self.source,
            status: self.status,
            created_at: now,
            completed_at,
            metadata: self.metadata,
        }
    }
}

/// Result of a ledger mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyOutcome {
    pub transaction: LedgerTransaction,
    pub balance: Balance,
    /// Set when the idempotency key had already been applied and nothing changed.
    pub duplicate: bool,
}

/// Balance and log for one user, read at a single point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerSnapshot {
    pub balance: Balance,
    pub log: Vec<LedgerTransaction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_round_trips_through_str() {
        for source in TransactionSource::ALL {
            assert_eq!(source.as_str().parse::<TransactionSource>().unwrap(), source);
        }
        assert!("jackpot".parse::<TransactionSource>().is_err());
    }

    #[test]
    fn test_source_serializes_snake_case() {
        let json = serde_json::to_string(&TransactionSource::PaymentSettlement).unwrap();
        assert_eq!(json, "\"payment_settlement\"");
    }

    #[test]
    fn test_only_pending_status_can_move() {
        assert!(TransactionStatus::Pending.can_transition_to(TransactionStatus::Completed));
        assert!(TransactionStatus::Pending.can_transition_to(TransactionStatus::Expired));
        assert!(!TransactionStatus::Pending.can_transition_to(TransactionStatus::Pending));
        assert!(!TransactionStatus::Completed.can_transition_to(TransactionStatus::Cancelled));
        assert!(!TransactionStatus::Cancelled.can_transition_to(TransactionStatus::Completed));
    }

    #[test]
    fn test_new_transaction_validation() {
        let ok = NewTransaction::credit("tx-1", "u1", 10, TransactionSource::Bonus);
        assert!(ok.validate().is_ok());

        let negative = NewTransaction::credit("tx-2", "u1", -1, TransactionSource::Bonus);
        assert!(negative.validate().is_err());

        let mut cancelled = NewTransaction::debit("tx-3", "u1", 5, TransactionSource::Purchase);
        cancelled.status = TransactionStatus::Cancelled;
        assert!(cancelled.validate().is_err());

        let blank = NewTransaction::credit("  ", "u1", 5, TransactionSource::Bonus);
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_completed_record_gets_completion_time() {
        let now = Utc::now();
        let record = NewTransaction::credit("tx-1", "u1", 10, TransactionSource::Review)
            .into_record(1, now);
        assert_eq!(record.completed_at, Some(now));

        let pending = NewTransaction::credit("tx-2", "u1", 10, TransactionSource::Review)
            .pending()
            .into_record(2, now);
        assert!(pending.completed_at.is_none());
    }
}
