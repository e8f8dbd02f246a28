use axum::{extract::State, http::StatusCode, Json};
use tracing::{error, info};

use super::AppState;
use crate::health::{HealthState, HealthStatus};

pub async fn root() -> &'static str {
    "Welcome to RezPay Backend API"
}

/// Degraded still answers 200; only an unhealthy component fails the check.
pub async fn health(
    State(state): State<AppState>,
) -> Result<Json<HealthStatus>, (StatusCode, String)> {
    let health_status = state.health.check_health().await;

    if health_status.status == HealthState::Unhealthy {
        error!("Health check failed - service unhealthy");
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "Service Unavailable".to_string(),
        ))
    } else {
        Ok(Json(health_status))
    }
}

pub async fn readiness(
    state: State<AppState>,
) -> Result<Json<HealthStatus>, (StatusCode, String)> {
    let result = health(state).await;
    if result.is_err() {
        error!("Readiness check failed");
    }
    result
}

pub async fn liveness() -> &'static str {
    info!("Liveness probe requested");
    "OK"
}
