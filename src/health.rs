//! Health check module
//! Provides health status for the application and its dependencies

use serde::Serialize;
use std::collections::HashMap;
#[cfg(any(feature = "database", feature = "cache"))]
use std::time::{Duration, Instant};
#[cfg(any(feature = "database", feature = "cache"))]
use tokio::time::timeout;
#[cfg(any(feature = "database", feature = "cache"))]
use tracing::{error, info};

use crate::ledger::LedgerStore;
use std::sync::Arc;

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum ComponentState {
    Up,
    Down,
    Warning,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn warning(response_time_ms: Option<u128>, details: Option<String>) -> Self {
        Self {
            status: ComponentState::Warning,
            response_time_ms,
            details,
        }
    }
}

/// Health checker for the application. Postgres and Redis are only checked
/// when configured; the in-memory ledger is always reachable.
#[derive(Clone)]
pub struct HealthChecker {
    ledger: Arc<dyn LedgerStore>,
    #[cfg(feature = "database")]
    db_pool: Option<sqlx::PgPool>,
    #[cfg(feature = "cache")]
    cache: Option<crate::cache::RedisPool>,
}

impl HealthChecker {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self {
            ledger,
            #[cfg(feature = "database")]
            db_pool: None,
            #[cfg(feature = "cache")]
            cache: None,
        }
    }

    #[cfg(feature = "database")]
    pub fn with_database(mut self, pool: sqlx::PgPool) -> Self {
        self.db_pool = Some(pool);
        self
    }

    #[cfg(feature = "cache")]
    pub fn with_cache(mut self, pool: crate::cache::RedisPool) -> Self {
        self.cache = Some(pool);
        self
    }

    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();
        #[allow(unused_mut)]
        let mut overall_healthy = true;

        // Ledger reads go through whichever store is configured.
        let started = std::time::Instant::now();
        match self.ledger.user_ids().await {
            Ok(_) => {
                health_status.checks.insert(
                    "ledger".to_string(),
                    ComponentHealth::up(Some(started.elapsed().as_millis())),
                );
            }
            Err(e) => {
                overall_healthy = false;
                health_status
                    .checks
                    .insert("ledger".to_string(), ComponentHealth::down(Some(e.to_string())));
            }
        }

        #[cfg(feature = "database")]
        if let Some(pool) = &self.db_pool {
            match timeout(Duration::from_secs(5), check_database_health(pool)).await {
                Ok(Ok(response_time)) => {
                    health_status.checks.insert(
                        "database".to_string(),
                        ComponentHealth::up(Some(response_time)),
                    );
                    info!("Database health check: OK ({}ms)", response_time);
                }
                Ok(Err(e)) => {
                    overall_healthy = false;
                    health_status.checks.insert(
                        "database".to_string(),
                        ComponentHealth::down(Some(e.to_string())),
                    );
                    error!("Database health check failed: {}", e);
                }
                Err(_) => {
                    overall_healthy = false;
                    health_status.checks.insert(
                        "database".to_string(),
                        ComponentHealth::down(Some("Timeout".to_string())),
                    );
                    error!("Database health check timed out");
                }
            }
        }

        // Redis only holds reconciliation history, so losing it degrades.
        #[cfg(feature = "cache")]
        if let Some(pool) = &self.cache {
            match timeout(Duration::from_secs(5), check_cache_health(pool)).await {
                Ok(Ok(response_time)) => {
                    health_status.checks.insert(
                        "cache".to_string(),
                        ComponentHealth::up(Some(response_time)),
                    );
                    info!("Cache health check: OK ({}ms)", response_time);
                }
                Ok(Err(e)) => {
                    health_status.checks.insert(
                        "cache".to_string(),
                        ComponentHealth::warning(None, Some(e.to_string())),
                    );
                    error!("Cache health check failed: {}", e);
                }
                Err(_) => {
                    health_status.checks.insert(
                        "cache".to_string(),
                        ComponentHealth::warning(None, Some("Timeout".to_string())),
                    );
                    error!("Cache health check timed out");
                }
            }
        }

        let degraded = health_status
            .checks
            .values()
            .any(|c| c.status == ComponentState::Warning);
        health_status.status = if !overall_healthy {
            HealthState::Unhealthy
        } else if degraded {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        health_status
    }
}

#[cfg(feature = "database")]
pub async fn check_database_health(
    pool: &sqlx::PgPool,
) -> Result<u128, Box<dyn std::error::Error + Send + Sync>> {
    let start = Instant::now();
    crate::database::health_check(pool).await?;
    Ok(start.elapsed().as_millis())
}

#[cfg(feature = "cache")]
pub async fn check_cache_health(
    pool: &crate::cache::RedisPool,
) -> Result<u128, Box<dyn std::error::Error + Send + Sync>> {
    let start = Instant::now();
    crate::cache::health_check(pool).await?;
    Ok(start.elapsed().as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedgerStore;

    #[tokio::test]
    async fn test_health_status_creation() {
        let health_status = HealthStatus::new();
        assert!(matches!(health_status.status, HealthState::Healthy));
        assert!(health_status.checks.is_empty());
        assert!(health_status.timestamp <= chrono::Utc::now());
    }

    #[test]
    fn test_component_health_states() {
        let up_health = ComponentHealth::up(Some(100));
        assert!(matches!(up_health.status, ComponentState::Up));
        assert_eq!(up_health.response_time_ms, Some(100));

        let down_health = ComponentHealth::down(Some("Test error".to_string()));
        assert!(matches!(down_health.status, ComponentState::Down));
        assert_eq!(down_health.details, Some("Test error".to_string()));

        let warning_health = ComponentHealth::warning(Some(500), Some("Slow response".to_string()));
        assert!(matches!(warning_health.status, ComponentState::Warning));
        assert_eq!(warning_health.details, Some("Slow response".to_string()));
    }

    #[tokio::test]
    async fn test_in_memory_ledger_is_healthy() {
        let checker = HealthChecker::new(Arc::new(InMemoryLedgerStore::new()));
        let status = checker.check_health().await;
        assert!(status.is_healthy());
        assert!(status.checks.contains_key("ledger"));
    }
}
