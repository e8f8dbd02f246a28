use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::services::reconciliation::{ReconciliationMonitor, ReconciliationStateStore};

/// Periodically compares every user's ledger balance with the points projection.
pub struct ReconciliationWorker {
    monitor: Arc<ReconciliationMonitor>,
    states: Arc<dyn ReconciliationStateStore>,
}

impl ReconciliationWorker {
    pub fn new(monitor: Arc<ReconciliationMonitor>, states: Arc<dyn ReconciliationStateStore>) -> Self {
        Self { monitor, states }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = self.monitor.config().interval;
        info!(
            interval_secs = interval.as_secs(),
            tolerance = self.monitor.config().tolerance,
            rebuild_projection = self.monitor.config().rebuild_projection_on_mismatch,
            "reconciliation worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("reconciliation worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.monitor.sweep(self.states.as_ref()).await {
                        warn!(error = %e, "reconciliation sweep failed");
                    }
                }
            }
        }

        info!("reconciliation worker stopped");
    }
}
