//! Wiring: stores, services and the state shared by handlers and workers.

use std::sync::Arc;
use tracing::info;

use crate::api::AppState;
use crate::config::AppConfig;
use crate::health::HealthChecker;
use crate::ledger::{InMemoryLedgerStore, InMemoryProjectionStore, LedgerStore, ProjectionStore};
use crate::payments::error::GatewayResult;
use crate::payments::registry::GatewayRegistry;
use crate::payments::store::{InMemoryPaymentStore, PaymentStore};
use crate::services::notification::NotificationService;
use crate::services::payment_method_resolver::PaymentMethodResolver;
use crate::services::payment_orchestrator::PaymentOrchestrator;
use crate::services::reconciliation::{
    InMemoryReconciliationStateStore, ReconciliationMonitor, ReconciliationStateStore,
};
use crate::services::reward_ingestion::RewardIngestionService;
use crate::services::webhook_processor::{InMemoryWebhookEventLog, WebhookEventLog, WebhookProcessor};
use crate::verification::challenge::issuer_for;
use crate::verification::{InMemoryVerificationStore, VerificationService, VerificationStore};

/// Every persistence seam the services depend on.
#[derive(Clone)]
pub struct Stores {
    pub ledger: Arc<dyn LedgerStore>,
    pub projection: Arc<dyn ProjectionStore>,
    pub payments: Arc<dyn PaymentStore>,
    pub verifications: Arc<dyn VerificationStore>,
    pub webhook_events: Arc<dyn WebhookEventLog>,
    pub reconciliation_states: Arc<dyn ReconciliationStateStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            ledger: Arc::new(InMemoryLedgerStore::new()),
            projection: Arc::new(InMemoryProjectionStore::new()),
            payments: Arc::new(InMemoryPaymentStore::new()),
            verifications: Arc::new(InMemoryVerificationStore::new()),
            webhook_events: Arc::new(InMemoryWebhookEventLog::new()),
            reconciliation_states: Arc::new(InMemoryReconciliationStateStore::new()),
        }
    }

    /// Postgres for everything that must survive a restart.
    #[cfg(feature = "database")]
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        use crate::database::{
            ledger_repository::PgLedgerStore, payment_repository::PgPaymentStore,
            projection_repository::PgProjectionStore,
            verification_repository::PgVerificationStore, webhook_repository::WebhookRepository,
        };

        Self {
            ledger: Arc::new(PgLedgerStore::new(pool.clone())),
            projection: Arc::new(PgProjectionStore::new(pool.clone())),
            payments: Arc::new(PgPaymentStore::new(pool.clone())),
            verifications: Arc::new(PgVerificationStore::new(pool.clone())),
            webhook_events: Arc::new(WebhookRepository::new(pool)),
            reconciliation_states: Arc::new(InMemoryReconciliationStateStore::new()),
        }
    }

    pub fn with_reconciliation_states(mut self, states: Arc<dyn ReconciliationStateStore>) -> Self {
        self.reconciliation_states = states;
        self
    }
}

/// Build the gateway registry from configuration, then every service.
pub fn build_state(config: &AppConfig, stores: Stores) -> GatewayResult<AppState> {
    let registry = Arc::new(GatewayRegistry::build(&config.gateways, stores.ledger.clone())?);
    Ok(build_state_with_registry(config, stores, registry))
}

/// Same as [`build_state`] with a caller-supplied registry.
pub fn build_state_with_registry(
    config: &AppConfig,
    stores: Stores,
    registry: Arc<GatewayRegistry>,
) -> AppState {
    let notifier = Arc::new(NotificationService::new());

    let ingestion = Arc::new(RewardIngestionService::new(
        stores.ledger.clone(),
        stores.projection.clone(),
        config.ingestion.clone(),
    ));
    let reconciliation = Arc::new(ReconciliationMonitor::new(
        stores.ledger.clone(),
        stores.projection.clone(),
        config.reconciliation.clone(),
    ));
    let resolver = Arc::new(PaymentMethodResolver::new(
        registry.clone(),
        config.resolver.clone(),
    ));
    let verification = Arc::new(VerificationService::new(
        stores.verifications.clone(),
        issuer_for(config.environment),
        notifier.clone(),
        config.verification.clone(),
        config.risk.clone(),
    ));
    let orchestrator = Arc::new(PaymentOrchestrator::new(
        stores.payments.clone(),
        registry.clone(),
        resolver.clone(),
        verification.clone(),
        ingestion.clone(),
        stores.ledger.clone(),
        notifier,
        config.orchestrator.clone(),
    ));
    let webhooks = Arc::new(WebhookProcessor::new(
        stores.webhook_events.clone(),
        registry.clone(),
        orchestrator.clone(),
    ));

    info!(
        environment = %config.environment,
        rails = ?registry.list_rails(),
        "Application services initialized"
    );

    AppState {
        ledger: stores.ledger.clone(),
        ingestion,
        reconciliation,
        reconciliation_states: stores.reconciliation_states,
        resolver,
        orchestrator,
        verification,
        webhooks,
        registry,
        health: HealthChecker::new(stores.ledger),
    }
}
