//! HTTP surface. Handlers are thin: they extract, call one service
//! operation and serialize the result; errors leave through [`AppError`].
//!
//! [`AppError`]: crate::error::AppError

pub mod health;
pub mod payment_methods;
pub mod payments;
pub mod rewards;
pub mod verifications;
pub mod wallet;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};

use crate::health::HealthChecker;
use crate::ledger::LedgerStore;
use crate::middleware::logging::{request_logging_middleware, UuidRequestId};
use crate::payments::registry::GatewayRegistry;
use crate::services::payment_method_resolver::PaymentMethodResolver;
use crate::services::payment_orchestrator::PaymentOrchestrator;
use crate::services::reconciliation::{ReconciliationMonitor, ReconciliationStateStore};
use crate::services::reward_ingestion::RewardIngestionService;
use crate::services::webhook_processor::WebhookProcessor;
use crate::verification::VerificationService;

/// Shared by every handler and background worker.
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn LedgerStore>,
    pub ingestion: Arc<RewardIngestionService>,
    pub reconciliation: Arc<ReconciliationMonitor>,
    pub reconciliation_states: Arc<dyn ReconciliationStateStore>,
    pub resolver: Arc<PaymentMethodResolver>,
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub verification: Arc<VerificationService>,
    pub webhooks: Arc<WebhookProcessor>,
    pub registry: Arc<GatewayRegistry>,
    pub health: HealthChecker,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health))
        .route("/health/ready", get(health::readiness))
        .route("/health/live", get(health::liveness))
        .route("/api/v1/wallet/{user_id}/balance", get(wallet::get_balance))
        .route(
            "/api/v1/wallet/{user_id}/transactions",
            get(wallet::get_transactions),
        )
        .route("/api/v1/wallet/{user_id}/sync", get(wallet::check_sync))
        .route("/api/v1/rewards", post(rewards::ingest_reward))
        .route(
            "/api/v1/payment-methods",
            get(payment_methods::list_payment_methods),
        )
        .route("/api/v1/payments", post(payments::initiate_payment))
        .route("/api/v1/payments/{payment_id}", get(payments::get_payment))
        .route(
            "/api/v1/payments/{payment_id}/cancel",
            post(payments::cancel_payment),
        )
        .route(
            "/api/v1/verifications",
            post(verifications::start_verification),
        )
        .route(
            "/api/v1/verifications/{verification_id}/confirm",
            post(verifications::confirm_verification),
        )
        .route(
            "/api/v1/verifications/{verification_id}/review",
            post(verifications::review_verification),
        )
        .route(
            "/api/v1/instruments/{instrument_id}/verifications",
            get(verifications::instrument_history),
        )
        .route("/api/v1/webhooks/{rail}", post(webhooks::handle_webhook))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}
