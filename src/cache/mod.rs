//! Redis connection pool and the state persisted in it.
//!
//! Redis only ever holds derived data (reconciliation history); losing it
//! never affects balances.

pub mod error;
pub mod keys;
pub mod reconciliation_state;

pub use error::{CacheError, CacheResult};
pub use reconciliation_state::RedisReconciliationStateStore;

use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::CacheConfig;

/// Redis connection pool type alias
pub type RedisPool = Pool<RedisConnectionManager>;

/// Pool sizing and timeouts derived from [`CacheConfig`].
#[derive(Debug, Clone)]
pub struct RedisPoolSettings {
    pub max_connections: u32,
    pub min_idle: u32,
    pub connection_timeout: Duration,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
}

impl RedisPoolSettings {
    pub fn from_config(config: &CacheConfig) -> Self {
        let max_connections = config.max_connections.max(1);
        Self {
            max_connections,
            min_idle: max_connections.min(5),
            connection_timeout: Duration::from_secs(5),
            max_lifetime: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Build the pool. A failed initial PING is logged, not fatal.
pub async fn init_cache_pool_from_config(config: &CacheConfig) -> CacheResult<RedisPool> {
    let settings = RedisPoolSettings::from_config(config);
    info!(
        max_connections = settings.max_connections,
        min_idle = settings.min_idle,
        "Initializing Redis pool"
    );

    let manager = RedisConnectionManager::new(config.redis_url.as_str()).map_err(|e| {
        error!("Failed to create Redis connection manager: {}", e);
        CacheError::ConnectionError(e.to_string())
    })?;

    let pool = Pool::builder()
        .max_size(settings.max_connections)
        .min_idle(settings.min_idle)
        .connection_timeout(settings.connection_timeout)
        .max_lifetime(settings.max_lifetime)
        .idle_timeout(settings.idle_timeout)
        .test_on_check_out(false)
        .build(manager)
        .await
        .map_err(|e| {
            error!("Failed to build Redis connection pool: {}", e);
            CacheError::ConnectionError(e.to_string())
        })?;

    if let Err(e) = ping(&pool).await {
        warn!("Initial Redis connection test failed, but continuing: {}", e);
    }

    Ok(pool)
}

async fn ping(pool: &RedisPool) -> CacheResult<()> {
    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
    Ok(())
}

/// Health check for Redis connection pool
pub async fn health_check(pool: &RedisPool) -> CacheResult<()> {
    ping(pool).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_settings_cap_idle_connections() {
        let config = CacheConfig {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            default_ttl: 60,
            max_connections: 3,
        };
        let settings = RedisPoolSettings::from_config(&config);
        assert_eq!(settings.max_connections, 3);
        assert_eq!(settings.min_idle, 3);

        let settings = RedisPoolSettings::from_config(&CacheConfig {
            max_connections: 20,
            ..config
        });
        assert_eq!(settings.min_idle, 5);
    }
}
