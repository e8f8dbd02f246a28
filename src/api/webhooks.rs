use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::{error, info, warn};

use super::AppState;
use crate::middleware::error::with_request_id;
use crate::services::webhook_processor::WebhookProcessorError;

/// Header carrying the hex HMAC-SHA256 of the raw body.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// POST /api/v1/webhooks/{rail}
///
/// Failures after the event is logged are answered 200 so the gateway stops
/// redelivering; the retry worker picks them up.
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(rail): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    info!(rail = %rail, bytes = body.len(), "Received webhook");

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    if signature.is_none() {
        warn!(rail = %rail, "Missing webhook signature");
    }

    match state.webhooks.process_webhook(&rail, signature, &body).await {
        Ok(disposition) => {
            info!(
                rail = %rail,
                payment_id = %disposition.payment.id,
                action = ?disposition.action,
                "Webhook processed successfully"
            );
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "status": "ok",
                    "payment_id": disposition.payment.id,
                    "action": disposition.action,
                })),
            )
                .into_response()
        }
        Err(WebhookProcessorError::AlreadyProcessed) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "already_processed"})),
        )
            .into_response(),
        Err(
            e @ (WebhookProcessorError::InvalidSignature
            | WebhookProcessorError::UnknownRail(_)
            | WebhookProcessorError::Malformed(_)),
        ) => with_request_id(e, &headers).into_response(),
        Err(WebhookProcessorError::Database(e)) => with_request_id(e, &headers).into_response(),
        Err(e) => {
            error!(rail = %rail, error = %e, "Webhook processing failed");
            (
                StatusCode::OK,
                Json(serde_json::json!({"status": "retry_scheduled"})),
            )
                .into_response()
        }
    }
}
