//! Services module for business logic and integrations

pub mod notification;
pub mod payment_method_resolver;
pub mod payment_orchestrator;
pub mod reconciliation;
pub mod reward_ingestion;
pub mod webhook_processor;

pub use payment_method_resolver::{PaymentMethodDescriptor, PaymentMethodResolver, UserContext};
pub use payment_orchestrator::{
    InitiatePaymentRequest, OrchestratorConfig, OrchestratorError, OutcomeAction,
    OutcomeDisposition, PaymentOrchestrator,
};
pub use reconciliation::{ReconciliationMonitor, SyncReport};
pub use reward_ingestion::{RewardEvent, RewardIngestionService};
pub use webhook_processor::{WebhookProcessor, WebhookProcessorError};
