use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use rezpay_backend::api;
use rezpay_backend::app::{build_state, Stores};
use rezpay_backend::config::AppConfig;
use rezpay_backend::logging::init_tracing;
use rezpay_backend::workers::{
    PaymentSweeperConfig, PaymentTimeoutSweeper, ReconciliationWorker, WebhookRetryWorker,
};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("failed to load configuration")?;
    init_tracing(&config.logging);
    config.validate().context("invalid configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        "Starting RezPay backend service"
    );

    #[allow(unused_mut)]
    let mut stores = Stores::in_memory();

    #[cfg(feature = "database")]
    let db_pool = match &config.database {
        Some(db_config) => {
            info!("Initializing database connection pool...");
            let pool = rezpay_backend::database::init_pool_from_config(db_config)
                .await
                .map_err(|e| {
                    error!("Failed to initialize database pool: {}", e);
                    e
                })?;
            info!(
                max_connections = pool.options().get_max_connections(),
                "Database connection pool initialized"
            );
            stores = Stores::postgres(pool.clone());
            Some(pool)
        }
        None => {
            warn!("DATABASE_URL not set, running with in-memory stores");
            None
        }
    };

    #[cfg(feature = "cache")]
    let cache_pool = match &config.cache {
        Some(cache_config) => {
            info!("Initializing cache connection pool...");
            match rezpay_backend::cache::init_cache_pool_from_config(cache_config).await {
                Ok(pool) => {
                    stores = stores.with_reconciliation_states(std::sync::Arc::new(
                        rezpay_backend::cache::RedisReconciliationStateStore::new(
                            pool.clone(),
                            Duration::from_secs(cache_config.default_ttl),
                        ),
                    ));
                    info!("Cache connection pool initialized");
                    Some(pool)
                }
                Err(e) => {
                    // Reconciliation history falls back to memory.
                    warn!(error = %e, "Failed to initialize cache pool, continuing without Redis");
                    None
                }
            }
        }
        None => None,
    };

    #[allow(unused_mut)]
    let mut state = build_state(&config, stores).context("failed to build gateway registry")?;

    #[cfg(feature = "database")]
    if let Some(pool) = db_pool {
        state.health = state.health.with_database(pool);
    }
    #[cfg(feature = "cache")]
    if let Some(pool) = cache_pool {
        state.health = state.health.with_cache(pool);
    }

    // Background workers share one shutdown channel.
    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let mut worker_handles: Vec<JoinHandle<()>> = Vec::new();

    let sweeper_config = PaymentSweeperConfig::from_env(config.orchestrator.sweep_interval_secs);
    worker_handles.push(tokio::spawn(
        PaymentTimeoutSweeper::new(state.orchestrator.clone(), sweeper_config)
            .run(worker_shutdown_rx.clone()),
    ));

    worker_handles.push(tokio::spawn(
        ReconciliationWorker::new(state.reconciliation.clone(), state.reconciliation_states.clone())
            .run(worker_shutdown_rx.clone()),
    ));

    let webhook_retry_interval = std::env::var("WEBHOOK_RETRY_INTERVAL_SECONDS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(60);
    worker_handles.push(tokio::spawn(
        WebhookRetryWorker::new(state.webhooks.clone(), webhook_retry_interval)
            .run(worker_shutdown_rx),
    ));

    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid HOST/PORT")?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!(address = %addr, "Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await
        .context("server error")?;

    let _ = worker_shutdown_tx.send(true);
    for handle in worker_handles {
        if tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .is_err()
        {
            error!("Timed out waiting for worker shutdown");
        }
    }

    info!("Server shutdown complete");

    Ok(())
}
