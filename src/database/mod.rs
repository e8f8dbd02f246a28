//! Postgres persistence. Store traits live next to their domains; this module
//! holds the pool plumbing and the `sqlx` implementations.

pub mod error;

#[cfg(feature = "database")]
pub mod ledger_repository;
#[cfg(feature = "database")]
pub mod payment_repository;
#[cfg(feature = "database")]
pub mod projection_repository;
#[cfg(feature = "database")]
pub mod verification_repository;
#[cfg(feature = "database")]
pub mod webhook_repository;

#[cfg(feature = "database")]
pub use pool::*;

#[cfg(feature = "database")]
mod pool {
    use sqlx::postgres::PgPoolOptions;
    use sqlx::PgPool;
    use std::time::Duration;
    use tracing::{error as log_error, info, warn};

    use super::error::DatabaseError;
    use crate::config::DatabaseConfig;

    const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
    const MAX_CONNECTION_LIFETIME: Duration = Duration::from_secs(1800);

    /// Sizing and timeouts for the ledger and payment pool.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct PoolConfig {
        pub max_connections: u32,
        pub min_connections: u32,
        pub acquire_timeout: Duration,
        pub idle_timeout: Duration,
        pub max_lifetime: Duration,
    }

    impl From<&DatabaseConfig> for PoolConfig {
        fn from(config: &DatabaseConfig) -> Self {
            Self {
                max_connections: config.max_connections,
                min_connections: config.min_connections,
                acquire_timeout: Duration::from_secs(config.connection_timeout),
                idle_timeout: config
                    .idle_timeout
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_IDLE_TIMEOUT),
                max_lifetime: MAX_CONNECTION_LIFETIME,
            }
        }
    }

    /// Open the pool and make sure one connection can be checked out.
    pub async fn connect(database_url: &str, config: &PoolConfig) -> Result<PgPool, DatabaseError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            acquire_timeout_secs = config.acquire_timeout.as_secs(),
            "Opening Postgres pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| {
                log_error!(error = %e, "Failed to open Postgres pool");
                DatabaseError::from_sqlx(e)
            })?;

        pool.acquire().await.map_err(|e| {
            log_error!(error = %e, "Postgres pool opened but no connection could be acquired");
            DatabaseError::from_sqlx(e)
        })?;

        info!(size = pool.size(), "Postgres pool ready");
        Ok(pool)
    }

    /// Open the pool described by `config`, applying migrations when enabled.
    pub async fn init_pool_from_config(config: &DatabaseConfig) -> Result<PgPool, DatabaseError> {
        let pool = connect(&config.url, &PoolConfig::from(config)).await?;
        if config.run_migrations {
            run_migrations(&pool).await?;
        }
        Ok(pool)
    }

    /// Apply the SQL files under `migrations/`.
    pub async fn run_migrations(pool: &PgPool) -> Result<(), DatabaseError> {
        info!("Running ledger and payment migrations");
        sqlx::migrate!("./migrations").run(pool).await.map_err(|e| {
            log_error!(error = %e, "Migration failed");
            DatabaseError::unknown(e.to_string())
        })?;
        info!("Migrations applied");
        Ok(())
    }

    pub async fn health_check(pool: &PgPool) -> Result<(), DatabaseError> {
        sqlx::query("SELECT 1").fetch_one(pool).await.map_err(|e| {
            warn!(error = %e, idle = pool.num_idle(), size = pool.size(), "Postgres health check failed");
            DatabaseError::from_sqlx(e)
        })?;
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn database_config(idle_timeout: Option<u64>) -> DatabaseConfig {
            DatabaseConfig {
                url: "postgres://localhost/rezpay".to_string(),
                max_connections: 12,
                min_connections: 3,
                connection_timeout: 5,
                idle_timeout,
                run_migrations: false,
            }
        }

        #[test]
        fn test_pool_config_follows_database_config() {
            let pool = PoolConfig::from(&database_config(Some(120)));
            assert_eq!(pool.max_connections, 12);
            assert_eq!(pool.min_connections, 3);
            assert_eq!(pool.acquire_timeout, Duration::from_secs(5));
            assert_eq!(pool.idle_timeout, Duration::from_secs(120));
            assert_eq!(pool.max_lifetime, MAX_CONNECTION_LIFETIME);
        }

        #[test]
        fn test_pool_idle_timeout_defaults_when_unset() {
            let pool = PoolConfig::from(&database_config(None));
            assert_eq!(pool.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        }
    }
}
