use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::payments::error::GatewayError;
use crate::payments::types::PaymentRecord;
use crate::services::payment_orchestrator::{
    OrchestratorError, OutcomeAction, PaymentOrchestrator, SweepReport,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PaymentSweeperConfig {
    /// How often the worker wakes up.
    pub poll_interval: Duration,
    /// Payments polled against their gateway per cycle.
    pub poll_batch_size: usize,
}

impl Default for PaymentSweeperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            poll_batch_size: 100,
        }
    }
}

impl PaymentSweeperConfig {
    pub fn from_env(default_interval_secs: u64) -> Self {
        let mut cfg = Self {
            poll_interval: Duration::from_secs(default_interval_secs.max(1)),
            ..Self::default()
        };
        cfg.poll_interval = Duration::from_secs(
            std::env::var("PAYMENT_SWEEPER_INTERVAL_SECONDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(cfg.poll_interval.as_secs()),
        );
        cfg.poll_batch_size = std::env::var("PAYMENT_SWEEPER_POLL_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(cfg.poll_batch_size);
        cfg
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub polled: usize,
    pub skipped: usize,
    pub settled: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Drives payment deadlines: expires stale verifications, times out
/// payments past their deadline and polls gateways for payments still
/// waiting on a confirmation callback.
pub struct PaymentTimeoutSweeper {
    orchestrator: Arc<PaymentOrchestrator>,
    config: PaymentSweeperConfig,
}

impl PaymentTimeoutSweeper {
    pub fn new(orchestrator: Arc<PaymentOrchestrator>, config: PaymentSweeperConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            poll_batch_size = self.config.poll_batch_size,
            "payment timeout sweeper started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("payment timeout sweeper stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_cycle(Utc::now()).await {
                        warn!(error = %e, "payment sweep cycle failed");
                    }
                }
            }
        }

        info!("payment timeout sweeper stopped");
    }

    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<PollSummary, OrchestratorError> {
        let report = self.orchestrator.sweep_expired(now).await?;
        if report != SweepReport::default() {
            info!(
                verifications_expired = report.verifications_expired,
                verification_timeouts = report.verification_timeouts,
                gateway_timeouts = report.gateway_timeouts,
                initiation_timeouts = report.initiation_timeouts,
                settled_late = report.settled_late,
                ledger_entries_resolved = report.ledger_entries_resolved,
                "payment deadlines swept"
            );
        }
        self.poll_gateways(now).await
    }

    async fn poll_gateways(&self, now: DateTime<Utc>) -> Result<PollSummary, OrchestratorError> {
        let mut summary = PollSummary::default();
        let awaiting = self
            .orchestrator
            .payments_awaiting_confirmation(self.config.poll_batch_size)
            .await?;

        for payment in awaiting {
            if !is_ready_for_poll(&payment, now) {
                summary.skipped += 1;
                continue;
            }
            summary.polled += 1;

            match self.orchestrator.refresh_from_gateway(&payment.id).await {
                Ok(disposition) => match disposition.action {
                    OutcomeAction::Settled => summary.settled += 1,
                    OutcomeAction::Failed | OutcomeAction::Cancelled => summary.failed += 1,
                    _ => {}
                },
                Err(OrchestratorError::Gateway(e)) if is_transient(&e) => {
                    // Keep polling on the backoff schedule; the deadline still applies.
                    debug!(payment_id = %payment.id, error = %e, "transient gateway poll failure");
                }
                Err(e) => {
                    warn!(payment_id = %payment.id, error = %e, "gateway poll failed");
                }
            }
        }

        Ok(summary)
    }
}

/// Delay before the next gateway poll, given how many polls already happened.
pub fn backoff_delay(poll_attempts: u32) -> Duration {
    match poll_attempts {
        0 => Duration::from_secs(0),
        1 => Duration::from_secs(10),
        2 => Duration::from_secs(30),
        3 => Duration::from_secs(120),
        4 => Duration::from_secs(300),
        _ => Duration::from_secs(600),
    }
}

fn is_ready_for_poll(payment: &PaymentRecord, now: DateTime<Utc>) -> bool {
    let delay = backoff_delay(payment.poll_attempts);
    if delay.is_zero() {
        return true;
    }
    match payment.last_polled_at {
        None => true,
        Some(last) => (now - last).to_std().map(|d| d >= delay).unwrap_or(false),
    }
}

fn is_transient(error: &GatewayError) -> bool {
    error.is_retryable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::PaymentMethodType;
    use chrono::Duration as ChronoDuration;

    fn payment(poll_attempts: u32, last_polled_secs_ago: Option<i64>, now: DateTime<Utc>) -> PaymentRecord {
        let mut record = PaymentRecord::new("o1", "u1", "m1", 1_000, "INR", PaymentMethodType::Upi);
        record.poll_attempts = poll_attempts;
        record.last_polled_at = last_polled_secs_ago.map(|s| now - ChronoDuration::seconds(s));
        record
    }

    #[test]
    fn test_backoff_delay_schedule() {
        assert_eq!(backoff_delay(0), Duration::from_secs(0));
        assert_eq!(backoff_delay(1), Duration::from_secs(10));
        assert_eq!(backoff_delay(3), Duration::from_secs(120));
        assert_eq!(backoff_delay(99), Duration::from_secs(600));
    }

    #[test]
    fn test_first_poll_is_always_ready() {
        let now = Utc::now();
        assert!(is_ready_for_poll(&payment(0, Some(1), now), now));
        assert!(is_ready_for_poll(&payment(2, None, now), now));
    }

    #[test]
    fn test_poll_waits_for_backoff() {
        let now = Utc::now();
        assert!(!is_ready_for_poll(&payment(2, Some(20), now), now));
        assert!(is_ready_for_poll(&payment(2, Some(31), now), now));
        assert!(!is_ready_for_poll(&payment(5, Some(599), now), now));
    }

    #[test]
    fn test_config_defaults() {
        let config = PaymentSweeperConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.poll_batch_size, 100);
    }
}
