//! Background workers. Each one runs until the shared shutdown channel flips.

pub mod payment_timeout_sweeper;
pub mod reconciliation_worker;
pub mod webhook_retry;

pub use payment_timeout_sweeper::{PaymentSweeperConfig, PaymentTimeoutSweeper};
pub use reconciliation_worker::ReconciliationWorker;
pub use webhook_retry::WebhookRetryWorker;
