use axum::{extract::State, http::HeaderMap, http::StatusCode, Json};
use tracing::info;

use super::AppState;
use crate::error::AppError;
use crate::ledger::LedgerTransaction;
use crate::middleware::error::with_request_id;
use crate::services::reward_ingestion::RewardEvent;

/// POST /api/v1/rewards
///
/// Replaying an event returns the transaction recorded the first time.
pub async fn ingest_reward(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(event): Json<RewardEvent>,
) -> Result<(StatusCode, Json<LedgerTransaction>), AppError> {
    info!(
        user_id = %event.user_id,
        amount = event.amount,
        source = ?event.source,
        "Reward event received"
    );

    let tx = state
        .ingestion
        .ingest(event)
        .await
        .map_err(|e| with_request_id(e, &headers))?;

    Ok((StatusCode::CREATED, Json(tx)))
}
