//! Reconciliation Monitor
//!
//! Compares the ledger's spendable balance with the independently maintained
//! points projection. The ledger is authoritative and is never written here;
//! on drift the monitor reports, and optionally rebuilds the projection from
//! the ledger log.

use crate::ledger::{Balance, LedgerError, LedgerSnapshot, LedgerStore, MinorUnits, ProjectionStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub interval: Duration,
    /// Largest absolute difference still reported as in sync.
    pub tolerance: MinorUnits,
    pub rebuild_projection_on_mismatch: bool,
    pub max_concurrency: usize,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            tolerance: 1,
            rebuild_projection_on_mismatch: false,
            max_concurrency: 8,
        }
    }
}

impl ReconciliationConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval: Duration::from_secs(
                std::env::var("RECONCILIATION_INTERVAL_SECONDS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.interval.as_secs()),
            ),
            tolerance: std::env::var("RECONCILIATION_TOLERANCE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.tolerance),
            rebuild_projection_on_mismatch: std::env::var("RECONCILIATION_REBUILD_PROJECTION")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.rebuild_projection_on_mismatch),
            max_concurrency: std::env::var("RECONCILIATION_MAX_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v: &usize| *v > 0)
                .unwrap_or(defaults.max_concurrency),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub user_id: String,
    pub ledger_balance: MinorUnits,
    pub projection_balance: MinorUnits,
    pub in_sync: bool,
    /// Absolute difference between the two views.
    pub difference: MinorUnits,
    /// Materialized balance equals a replay of the transaction log.
    pub replay_consistent: bool,
    pub projection_rebuilt: bool,
    pub checked_at: DateTime<Utc>,
}

/// Per-user reconciliation history, passed into and returned from each check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationState {
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_in_sync_at: Option<DateTime<Utc>>,
    pub consecutive_mismatches: u32,
    pub last_report: Option<SyncReport>,
}

impl ReconciliationState {
    pub fn advance(mut self, report: &SyncReport) -> Self {
        self.last_checked_at = Some(report.checked_at);
        if report.in_sync {
            self.last_in_sync_at = Some(report.checked_at);
            self.consecutive_mismatches = 0;
        } else {
            self.consecutive_mismatches += 1;
        }
        self.last_report = Some(report.clone());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconciliationError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("reconciliation state store error: {0}")]
    State(String),
}

pub type ReconciliationResult<T> = Result<T, ReconciliationError>;

#[async_trait]
pub trait ReconciliationStateStore: Send + Sync {
    async fn load(&self, user_id: &str) -> ReconciliationResult<ReconciliationState>;
    async fn save(&self, user_id: &str, state: &ReconciliationState) -> ReconciliationResult<()>;
}

#[derive(Default)]
pub struct InMemoryReconciliationStateStore {
    states: RwLock<HashMap<String, ReconciliationState>>,
}

impl InMemoryReconciliationStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReconciliationStateStore for InMemoryReconciliationStateStore {
    async fn load(&self, user_id: &str) -> ReconciliationResult<ReconciliationState> {
        Ok(self
            .states
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, user_id: &str, state: &ReconciliationState) -> ReconciliationResult<()> {
        self.states
            .write()
            .await
            .insert(user_id.to_string(), state.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub users_checked: usize,
    pub mismatches: usize,
    pub failures: usize,
}

pub struct ReconciliationMonitor {
    ledger: Arc<dyn LedgerStore>,
    projection: Arc<dyn ProjectionStore>,
    config: ReconciliationConfig,
}

impl ReconciliationMonitor {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        projection: Arc<dyn ProjectionStore>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            ledger,
            projection,
            config,
        }
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    /// Compare both views for one user and fold the result into `state`.
    pub async fn check_sync(
        &self,
        user_id: &str,
        state: ReconciliationState,
    ) -> ReconciliationResult<(SyncReport, ReconciliationState)> {
        let LedgerSnapshot { balance, log } = self.ledger.snapshot(user_id).await?;
        let replayed = Balance::replay(user_id, &log);
        let projection = self.projection.get(user_id).await?;

        let delta = projection.total.saturating_sub(balance.available);
        let in_sync = delta.saturating_abs() <= self.config.tolerance;
        let replay_consistent = replayed == balance;

        if !replay_consistent {
            error!(
                user_id = %user_id,
                materialized_available = balance.available,
                replayed_available = replayed.available,
                materialized_pending = balance.pending,
                replayed_pending = replayed.pending,
                "Materialized balance diverges from transaction log replay"
            );
        }

        let mut projection_rebuilt = false;
        if !in_sync {
            warn!(
                user_id = %user_id,
                ledger_balance = balance.available,
                projection_balance = projection.total,
                delta = delta,
                tolerance = self.config.tolerance,
                consecutive_mismatches = state.consecutive_mismatches + 1,
                "Ledger and points projection out of sync"
            );
            if self.config.rebuild_projection_on_mismatch {
                self.projection.rebuild(user_id, &log).await?;
                projection_rebuilt = true;
            }
        } else {
            debug!(user_id = %user_id, available = balance.available, "Ledger in sync with projection");
        }

        let report = SyncReport {
            user_id: user_id.to_string(),
            ledger_balance: balance.available,
            projection_balance: projection.total,
            in_sync,
            difference: delta.saturating_abs(),
            replay_consistent,
            projection_rebuilt,
            checked_at: Utc::now(),
        };
        let state = state.advance(&report);
        Ok((report, state))
    }

    /// Check every known user, loading and saving per-user state through `states`.
    pub async fn sweep(&self, states: &dyn ReconciliationStateStore) -> ReconciliationResult<SweepSummary> {
        let users = self.ledger.user_ids().await?;
        let concurrency = self.config.max_concurrency.max(1);

        let results: Vec<ReconciliationResult<bool>> = stream::iter(users)
            .map(|user_id| async move {
                let state = states.load(&user_id).await?;
                let (report, state) = self.check_sync(&user_id, state).await?;
                states.save(&user_id, &state).await?;
                Ok::<bool, ReconciliationError>(report.in_sync)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut summary = SweepSummary::default();
        for result in results {
            summary.users_checked += 1;
            match result {
                Ok(true) => {}
                Ok(false) => summary.mismatches += 1,
                Err(e) => {
                    summary.failures += 1;
                    warn!(error = %e, "Reconciliation check failed for user");
                }
            }
        }

        info!(
            users_checked = summary.users_checked,
            mismatches = summary.mismatches,
            failures = summary.failures,
            "Reconciliation sweep complete"
        );
        Ok(summary)
    }
}
