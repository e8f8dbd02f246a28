//! Reward Ingestion
//!
//! Accepts reward and spend events from upstream producers (gamification,
//! orders, reviews, refunds, the payment orchestrator) and applies each one to
//! the ledger exactly once. Every accepted event is mirrored into the points
//! projection so reconciliation has an independent view to compare against.

use crate::ledger::projection::{resolution_key, spendable_effect};
use crate::ledger::{
    Direction, LedgerError, LedgerResult, LedgerStore, LedgerTransaction, MinorUnits,
    NewTransaction, ProjectionStore, TransactionSource, TransactionStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Total attempts against the ledger for transient storage failures.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl IngestionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: std::env::var("INGESTION_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_attempts),
            initial_backoff: Duration::from_millis(
                std::env::var("INGESTION_INITIAL_BACKOFF_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.initial_backoff.as_millis() as u64),
            ),
            max_backoff: Duration::from_millis(
                std::env::var("INGESTION_MAX_BACKOFF_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.max_backoff.as_millis() as u64),
            ),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardEventKind {
    #[default]
    Earn,
    Spend,
    Refund,
}

impl RewardEventKind {
    pub fn direction(&self) -> Direction {
        match self {
            RewardEventKind::Earn | RewardEventKind::Refund => Direction::Credit,
            RewardEventKind::Spend => Direction::Debit,
        }
    }
}

/// A balance-affecting event as emitted by a producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardEvent {
    pub user_id: String,
    pub amount: MinorUnits,
    pub source: TransactionSource,
    #[serde(default)]
    pub kind: RewardEventKind,
    pub producer_id: Option<String>,
    pub event_id: Option<String>,
    /// Overrides the derived key. The payment orchestrator passes the payment id.
    pub idempotency_key: Option<String>,
    /// Apply as a pending transaction to be settled or cancelled later.
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub metadata: JsonValue,
}

impl RewardEvent {
    pub fn earn(user_id: impl Into<String>, amount: MinorUnits, source: TransactionSource) -> Self {
        Self {
            user_id: user_id.into(),
            amount,
            source,
            kind: RewardEventKind::Earn,
            producer_id: None,
            event_id: None,
            idempotency_key: None,
            pending: false,
            metadata: JsonValue::Null,
        }
    }

    pub fn spend(user_id: impl Into<String>, amount: MinorUnits, source: TransactionSource) -> Self {
        Self {
            kind: RewardEventKind::Spend,
            ..Self::earn(user_id, amount, source)
        }
    }

    pub fn from_producer(mut self, producer_id: impl Into<String>, event_id: impl Into<String>) -> Self {
        self.producer_id = Some(producer_id.into());
        self.event_id = Some(event_id.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn as_pending(mut self) -> Self {
        self.pending = true;
        self
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum IngestionError {
    #[error("invalid reward event: {0}")]
    InvalidEvent(String),

    #[error("insufficient funds for {user_id}: short by {shortfall}")]
    InsufficientFunds {
        user_id: String,
        available: MinorUnits,
        required: MinorUnits,
        shortfall: MinorUnits,
    },

    #[error("ingestion of {idempotency_key} failed after {attempts} attempt(s): {reason}")]
    IngestionFailed {
        idempotency_key: String,
        attempts: u32,
        reason: String,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub type IngestionResult<T> = Result<T, IngestionError>;

// ============================================================================
// Service
// ============================================================================

pub struct RewardIngestionService {
    ledger: Arc<dyn LedgerStore>,
    projection: Arc<dyn ProjectionStore>,
    config: IngestionConfig,
}

impl RewardIngestionService {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        projection: Arc<dyn ProjectionStore>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            ledger,
            projection,
            config,
        }
    }

    /// Key under which an event is applied: explicit key, then
    /// `producer:event`, then a generated one.
    pub fn idempotency_key(event: &RewardEvent) -> String {
        if let Some(key) = event.idempotency_key.as_deref().filter(|k| !k.trim().is_empty()) {
            return key.to_string();
        }
        match event.event_id.as_deref().filter(|e| !e.trim().is_empty()) {
            Some(event_id) => format!(
                "{}:{}",
                event.producer_id.as_deref().unwrap_or("default"),
                event_id
            ),
            None => format!("rwd_{}", Uuid::new_v4().simple()),
        }
    }

    /// Apply one producer event to the ledger.
    ///
    /// Re-delivering an event with the same key returns the originally applied
    /// transaction.
    pub async fn ingest(&self, event: RewardEvent) -> IngestionResult<LedgerTransaction> {
        validate_event(&event)?;

        let key = Self::idempotency_key(&event);
        let tx = to_transaction(&key, &event);

        let outcome = self
            .with_retry(&key, move || self.ledger.apply(tx.clone()))
            .await
            .map_err(|e| {
                if let IngestionError::InsufficientFunds { shortfall, .. } = &e {
                    info!(
                        user_id = %event.user_id,
                        idempotency_key = %key,
                        shortfall = shortfall,
                        "Spend rejected for insufficient funds"
                    );
                }
                e
            })?;

        let record = outcome.transaction;
        self.mirror(
            &record.user_id,
            &record.id,
            spendable_effect(record.direction, record.amount, record.status),
        )
        .await;

        if outcome.duplicate {
            info!(
                idempotency_key = %record.id,
                user_id = %record.user_id,
                "Duplicate reward event, returning prior transaction"
            );
        } else {
            info!(
                idempotency_key = %record.id,
                user_id = %record.user_id,
                source = %record.source,
                direction = %record.direction,
                amount = record.amount,
                available = outcome.balance.available,
                "Reward event ingested"
            );
        }

        Ok(record)
    }

    pub async fn settle_event(&self, tx_id: &str) -> IngestionResult<LedgerTransaction> {
        self.resolve_event(tx_id, TransactionStatus::Completed).await
    }

    pub async fn cancel_event(&self, tx_id: &str) -> IngestionResult<LedgerTransaction> {
        self.resolve_event(tx_id, TransactionStatus::Cancelled).await
    }

    pub async fn expire_event(&self, tx_id: &str) -> IngestionResult<LedgerTransaction> {
        self.resolve_event(tx_id, TransactionStatus::Expired).await
    }

    async fn resolve_event(
        &self,
        tx_id: &str,
        target: TransactionStatus,
    ) -> IngestionResult<LedgerTransaction> {
        let outcome = self
            .with_retry(tx_id, move || self.ledger.resolve(tx_id, target))
            .await?;
        let record = outcome.transaction;

        let delta = spendable_effect(record.direction, record.amount, record.status)
            - spendable_effect(record.direction, record.amount, TransactionStatus::Pending);
        self.mirror(&record.user_id, &resolution_key(&record.id, record.status), delta)
            .await;

        Ok(record)
    }

    /// Projection writes are best effort; drift is caught by reconciliation.
    async fn mirror(&self, user_id: &str, event_key: &str, delta: MinorUnits) {
        if let Err(e) = self.projection.record(user_id, event_key, delta).await {
            warn!(
                user_id = %user_id,
                event_key = %event_key,
                error = %e,
                "Failed to mirror event into points projection"
            );
        }
    }

    async fn with_retry<T, F, Fut>(&self, key: &str, mut op: F) -> IngestionResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.calculate_retry_delay(attempt);
                    warn!(
                        idempotency_key = %key,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient ledger failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    error!(
                        idempotency_key = %key,
                        attempts = attempt,
                        error = %e,
                        "Ledger retries exhausted"
                    );
                    return Err(IngestionError::IngestionFailed {
                        idempotency_key: key.to_string(),
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(translate(e)),
            }
        }
    }

    /// Exponential backoff: initial * 2^(attempt-1), capped.
    fn calculate_retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.config.initial_backoff.saturating_mul(1u32 << exponent);
        delay.min(self.config.max_backoff)
    }
}

fn validate_event(event: &RewardEvent) -> IngestionResult<()> {
    if event.amount <= 0 {
        return Err(IngestionError::InvalidEvent(format!(
            "amount must be greater than zero, got {}",
            event.amount
        )));
    }
    if event.user_id.trim().is_empty() {
        return Err(IngestionError::InvalidEvent("user_id is required".to_string()));
    }
    if event.source == TransactionSource::PaymentSettlement && event.idempotency_key.is_none() {
        return Err(IngestionError::InvalidEvent(
            "payment settlements must carry the payment id as idempotency key".to_string(),
        ));
    }
    Ok(())
}

fn to_transaction(key: &str, event: &RewardEvent) -> NewTransaction {
    let mut metadata = match &event.metadata {
        JsonValue::Object(map) => map.clone(),
        JsonValue::Null => Default::default(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("payload".to_string(), other.clone());
            map
        }
    };
    metadata.insert("kind".to_string(), json!(event.kind));
    if let Some(producer_id) = &event.producer_id {
        metadata.insert("producer_id".to_string(), json!(producer_id));
    }
    if let Some(event_id) = &event.event_id {
        metadata.insert("event_id".to_string(), json!(event_id));
    }

    let tx = NewTransaction {
        id: key.to_string(),
        user_id: event.user_id.clone(),
        direction: event.kind.direction(),
        amount: event.amount,
        source: event.source,
        status: TransactionStatus::Completed,
        metadata: JsonValue::Object(metadata),
    };
    if event.pending {
        tx.pending()
    } else {
        tx
    }
}

fn translate(err: LedgerError) -> IngestionError {
    match err {
        LedgerError::InsufficientBalance {
            user_id,
            available,
            required,
        } => IngestionError::InsufficientFunds {
            user_id,
            available,
            required,
            shortfall: required - available,
        },
        LedgerError::Validation(message) => IngestionError::InvalidEvent(message),
        other => IngestionError::Ledger(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{InMemoryLedgerStore, InMemoryProjectionStore};

    fn service() -> (RewardIngestionService, Arc<InMemoryLedgerStore>, Arc<InMemoryProjectionStore>) {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let projection = Arc::new(InMemoryProjectionStore::new());
        let config = IngestionConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        };
        (
            RewardIngestionService::new(ledger.clone(), projection.clone(), config),
            ledger,
            projection,
        )
    }

    #[test]
    fn test_idempotency_key_precedence() {
        let explicit = RewardEvent::earn("u1", 5, TransactionSource::Bonus)
            .from_producer("games", "e-1")
            .with_idempotency_key("pay_123");
        assert_eq!(RewardIngestionService::idempotency_key(&explicit), "pay_123");

        let derived = RewardEvent::earn("u1", 5, TransactionSource::Bonus).from_producer("games", "e-1");
        assert_eq!(RewardIngestionService::idempotency_key(&derived), "games:e-1");

        let generated = RewardEvent::earn("u1", 5, TransactionSource::Bonus);
        let a = RewardIngestionService::idempotency_key(&generated);
        let b = RewardIngestionService::idempotency_key(&generated);
        assert!(a.starts_with("rwd_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let (svc, _, _) = service();
        assert_eq!(svc.calculate_retry_delay(1), Duration::from_millis(1));
        assert_eq!(svc.calculate_retry_delay(2), Duration::from_millis(2));
        assert_eq!(svc.calculate_retry_delay(3), Duration::from_millis(4));
        assert_eq!(svc.calculate_retry_delay(10), Duration::from_millis(4));
    }

    #[tokio::test]
    async fn test_rejects_non_positive_amount() {
        let (svc, _, _) = service();
        let err = svc
            .ingest(RewardEvent::earn("u1", 0, TransactionSource::DailyLogin))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::InvalidEvent(_)));
    }

    #[tokio::test]
    async fn test_redelivery_returns_prior_transaction() {
        let (svc, ledger, projection) = service();
        let event = RewardEvent::earn("u1", 40, TransactionSource::Review).from_producer("reviews", "r-9");

        let first = svc.ingest(event.clone()).await.unwrap();
        let second = svc.ingest(event).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(ledger.get_balance("u1").await.unwrap().available, 40);
        assert_eq!(projection.get("u1").await.unwrap().total, 40);
    }

    #[tokio::test]
    async fn test_pending_event_settles_through_ingestion() {
        let (svc, ledger, projection) = service();
        let tx = svc
            .ingest(
                RewardEvent::earn("u1", 60, TransactionSource::Purchase)
                    .from_producer("orders", "o-1")
                    .as_pending(),
            )
            .await
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(projection.get("u1").await.unwrap().total, 0);

        let settled = svc.settle_event(&tx.id).await.unwrap();
        assert_eq!(settled.status, TransactionStatus::Completed);
        assert_eq!(ledger.get_balance("u1").await.unwrap().available, 60);
        assert_eq!(projection.get("u1").await.unwrap().total, 60);

        // settling again is a no-op for both views
        svc.settle_event(&tx.id).await.unwrap();
        assert_eq!(projection.get("u1").await.unwrap().total, 60);
    }

    #[tokio::test]
    async fn test_cancelled_hold_restores_projection() {
        let (svc, ledger, projection) = service();
        svc.ingest(RewardEvent::earn("u1", 100, TransactionSource::Bonus).from_producer("ops", "seed"))
            .await
            .unwrap();
        let hold = svc
            .ingest(
                RewardEvent::spend("u1", 30, TransactionSource::Purchase)
                    .from_producer("orders", "o-2")
                    .as_pending(),
            )
            .await
            .unwrap();
        assert_eq!(projection.get("u1").await.unwrap().total, 70);

        svc.cancel_event(&hold.id).await.unwrap();
        assert_eq!(ledger.get_balance("u1").await.unwrap().available, 100);
        assert_eq!(projection.get("u1").await.unwrap().total, 100);
    }
}
