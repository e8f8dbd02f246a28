use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use tracing::info;

use super::AppState;
use crate::error::AppError;
use crate::middleware::error::with_request_id;
use crate::payments::types::PaymentRecord;
use crate::services::payment_orchestrator::{CancellationResult, InitiatePaymentRequest};

#[derive(Debug, Default, Deserialize)]
pub struct CancelPaymentRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /api/v1/payments
///
/// An `Idempotency-Key` header is used when the body carries none.
pub async fn initiate_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut request): Json<InitiatePaymentRequest>,
) -> Result<(StatusCode, Json<PaymentRecord>), AppError> {
    if request.idempotency_key.is_none() {
        request.idempotency_key = headers
            .get("idempotency-key")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
    }

    info!(
        order_id = %request.order_id,
        user_id = %request.user_id,
        amount = request.amount,
        method = %request.method,
        "Payment initiation requested"
    );

    let payment = state
        .orchestrator
        .initiate_payment(request)
        .await
        .map_err(|e| with_request_id(e, &headers))?;

    Ok((StatusCode::CREATED, Json(payment)))
}

/// GET /api/v1/payments/{payment_id}
pub async fn get_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PaymentRecord>, AppError> {
    let payment = state
        .orchestrator
        .get_payment(&payment_id)
        .await
        .map_err(|e| with_request_id(e, &headers))?;
    Ok(Json(payment))
}

/// POST /api/v1/payments/{payment_id}/cancel
pub async fn cancel_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CancellationResult>, AppError> {
    // The body is optional; an empty one cancels without a reason.
    let reason = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<CancelPaymentRequest>(&body)
            .map_err(|e| with_request_id(AppError::validation("body", e.to_string()), &headers))?
            .reason
    };
    let result = state
        .orchestrator
        .cancel_payment(&payment_id, reason)
        .await
        .map_err(|e| with_request_id(e, &headers))?;

    info!(
        payment_id = %payment_id,
        state = %result.payment.state,
        forwarded = result.gateway_ack.is_some(),
        "Payment cancellation handled"
    );
    Ok(Json(result))
}
