use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use tracing::info;

use super::AppState;
use crate::error::AppError;
use crate::middleware::error::with_request_id;
use crate::services::payment_orchestrator::VerificationProgress;
use crate::verification::service::StartVerificationRequest;
use crate::verification::types::{
    ReviewDecision, VerificationEvidence, VerificationLevel, VerificationRecord,
};

#[derive(Debug, Serialize)]
pub struct InstrumentVerifications {
    pub instrument_id: String,
    pub trust_level: VerificationLevel,
    pub verifications: Vec<VerificationRecord>,
}

/// POST /api/v1/verifications
pub async fn start_verification(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<StartVerificationRequest>,
) -> Result<(StatusCode, Json<VerificationRecord>), AppError> {
    info!(
        instrument_id = %request.instrument_id,
        verification_type = %request.verification_type,
        "Verification requested"
    );
    let record = state
        .verification
        .start_verification(request, Utc::now())
        .await
        .map_err(|e| with_request_id(e, &headers))?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// POST /api/v1/verifications/{verification_id}/confirm
pub async fn confirm_verification(
    State(state): State<AppState>,
    Path(verification_id): Path<String>,
    headers: HeaderMap,
    Json(evidence): Json<VerificationEvidence>,
) -> Result<Json<VerificationProgress>, AppError> {
    let progress = state
        .orchestrator
        .confirm_verification(&verification_id, evidence)
        .await
        .map_err(|e| with_request_id(e, &headers))?;
    Ok(Json(progress))
}

/// POST /api/v1/verifications/{verification_id}/review
pub async fn review_verification(
    State(state): State<AppState>,
    Path(verification_id): Path<String>,
    headers: HeaderMap,
    Json(decision): Json<ReviewDecision>,
) -> Result<Json<VerificationProgress>, AppError> {
    let progress = state
        .orchestrator
        .resolve_verification(&verification_id, decision)
        .await
        .map_err(|e| with_request_id(e, &headers))?;
    Ok(Json(progress))
}

/// GET /api/v1/instruments/{instrument_id}/verifications
pub async fn instrument_history(
    State(state): State<AppState>,
    Path(instrument_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<InstrumentVerifications>, AppError> {
    let verifications = state
        .verification
        .history(&instrument_id)
        .await
        .map_err(|e| with_request_id(e, &headers))?;
    let trust_level = state
        .verification
        .trust_level(&instrument_id)
        .await
        .map_err(|e| with_request_id(e, &headers))?;

    Ok(Json(InstrumentVerifications {
        instrument_id,
        trust_level,
        verifications,
    }))
}
