use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::database::error::DatabaseError;
use crate::error::{AppError, AppErrorKind, ValidationError};
use crate::payments::registry::GatewayRegistry;
use crate::payments::types::GatewayRail;
use crate::services::payment_orchestrator::{
    OrchestratorError, OutcomeDisposition, PaymentOrchestrator,
};

/// Deliveries of one event before `retry_pending` gives up on it.
pub const MAX_WEBHOOK_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum WebhookProcessorError {
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Already processed")]
    AlreadyProcessed,
    #[error("Unknown rail: {0}")]
    UnknownRail(String),
    #[error("Malformed callback: {0}")]
    Malformed(String),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Processing(#[from] OrchestratorError),
}

impl From<WebhookProcessorError> for AppError {
    fn from(err: WebhookProcessorError) -> Self {
        match err {
            WebhookProcessorError::InvalidSignature => AppError::new(AppErrorKind::Validation(
                ValidationError::InvalidSignature {
                    reason: "callback signature did not verify".to_string(),
                },
            )),
            WebhookProcessorError::AlreadyProcessed => {
                AppError::validation("event_id", "event already processed")
            }
            WebhookProcessorError::UnknownRail(rail) => {
                AppError::validation("rail", format!("unknown or disabled rail: {}", rail))
            }
            WebhookProcessorError::Malformed(reason) => AppError::validation("payload", reason),
            WebhookProcessorError::Database(inner) => inner.into(),
            WebhookProcessorError::Processing(inner) => inner.into(),
        }
    }
}

// ============================================================================
// Event log
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Pending,
    Completed,
    Failed,
}

impl WebhookEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventStatus::Pending => "pending",
            WebhookEventStatus::Completed => "completed",
            WebhookEventStatus::Failed => "failed",
        }
    }
}

impl FromStr for WebhookEventStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WebhookEventStatus::Pending),
            "completed" => Ok(WebhookEventStatus::Completed),
            "failed" => Ok(WebhookEventStatus::Failed),
            other => Err(DatabaseError::unknown(format!(
                "unknown webhook status {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    pub rail: GatewayRail,
    pub event_id: String,
    pub reference: String,
    pub status: WebhookEventStatus,
    pub payload: JsonValue,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Delivery log keyed by `(rail, event_id)`.
#[async_trait]
pub trait WebhookEventLog: Send + Sync {
    /// Record a delivery. A known event keeps its status and gains an attempt.
    async fn log_event(
        &self,
        rail: GatewayRail,
        event_id: &str,
        reference: &str,
        payload: JsonValue,
    ) -> Result<WebhookEventRecord, DatabaseError>;

    async fn mark_processed(&self, rail: GatewayRail, event_id: &str) -> Result<(), DatabaseError>;

    async fn record_failure(
        &self,
        rail: GatewayRail,
        event_id: &str,
        error: &str,
    ) -> Result<(), DatabaseError>;

    /// Failed events still under the attempt limit, oldest first.
    async fn pending_retries(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<WebhookEventRecord>, DatabaseError>;
}

#[derive(Default)]
pub struct InMemoryWebhookEventLog {
    events: RwLock<HashMap<(GatewayRail, String), WebhookEventRecord>>,
}

impl InMemoryWebhookEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookEventLog for InMemoryWebhookEventLog {
    async fn log_event(
        &self,
        rail: GatewayRail,
        event_id: &str,
        reference: &str,
        payload: JsonValue,
    ) -> Result<WebhookEventRecord, DatabaseError> {
        let mut events = self.events.write().await;
        let record = events
            .entry((rail, event_id.to_string()))
            .and_modify(|e| e.attempts += 1)
            .or_insert_with(|| WebhookEventRecord {
                rail,
                event_id: event_id.to_string(),
                reference: reference.to_string(),
                status: WebhookEventStatus::Pending,
                payload,
                attempts: 1,
                last_error: None,
                received_at: Utc::now(),
                processed_at: None,
            });
        Ok(record.clone())
    }

    async fn mark_processed(&self, rail: GatewayRail, event_id: &str) -> Result<(), DatabaseError> {
        let mut events = self.events.write().await;
        let record = events
            .get_mut(&(rail, event_id.to_string()))
            .ok_or_else(|| DatabaseError::not_found("WebhookEvent", event_id))?;
        record.status = WebhookEventStatus::Completed;
        record.processed_at = Some(Utc::now());
        record.last_error = None;
        Ok(())
    }

    async fn record_failure(
        &self,
        rail: GatewayRail,
        event_id: &str,
        error: &str,
    ) -> Result<(), DatabaseError> {
        let mut events = self.events.write().await;
        let record = events
            .get_mut(&(rail, event_id.to_string()))
            .ok_or_else(|| DatabaseError::not_found("WebhookEvent", event_id))?;
        record.status = WebhookEventStatus::Failed;
        record.last_error = Some(error.to_string());
        Ok(())
    }

    async fn pending_retries(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<WebhookEventRecord>, DatabaseError> {
        let mut failed: Vec<WebhookEventRecord> = self
            .events
            .read()
            .await
            .values()
            .filter(|e| e.status == WebhookEventStatus::Failed && e.attempts < max_attempts)
            .cloned()
            .collect();
        failed.sort_by_key(|e| e.received_at);
        failed.truncate(limit);
        Ok(failed)
    }
}

// ============================================================================
// Processor
// ============================================================================

pub struct WebhookProcessor {
    event_log: Arc<dyn WebhookEventLog>,
    registry: Arc<GatewayRegistry>,
    orchestrator: Arc<PaymentOrchestrator>,
}

impl WebhookProcessor {
    pub fn new(
        event_log: Arc<dyn WebhookEventLog>,
        registry: Arc<GatewayRegistry>,
        orchestrator: Arc<PaymentOrchestrator>,
    ) -> Self {
        Self {
            event_log,
            registry,
            orchestrator,
        }
    }

    /// Verify, deduplicate and apply one gateway callback.
    pub async fn process_webhook(
        &self,
        rail_name: &str,
        signature: Option<&str>,
        payload: &[u8],
    ) -> Result<OutcomeDisposition, WebhookProcessorError> {
        let rail = GatewayRail::from_str(rail_name)
            .map_err(|_| WebhookProcessorError::UnknownRail(rail_name.to_string()))?;
        let adapter = self
            .registry
            .adapter_for_rail(rail)
            .map_err(|_| WebhookProcessorError::UnknownRail(rail_name.to_string()))?;

        match adapter.verify_callback(payload, signature) {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                error!(rail = %rail, "Invalid webhook signature");
                return Err(WebhookProcessorError::InvalidSignature);
            }
        }

        let callback = adapter
            .parse_callback(payload)
            .map_err(|e| WebhookProcessorError::Malformed(e.to_string()))?;

        let logged = self
            .event_log
            .log_event(
                rail,
                &callback.event_id,
                &callback.reference,
                callback.payload.clone(),
            )
            .await?;

        if logged.status == WebhookEventStatus::Completed {
            info!(rail = %rail, event_id = %callback.event_id, "Webhook already processed");
            return Err(WebhookProcessorError::AlreadyProcessed);
        }

        let event_id = callback.event_id.clone();
        match self.orchestrator.handle_gateway_callback(callback).await {
            Ok(disposition) => {
                self.event_log.mark_processed(rail, &event_id).await?;
                info!(
                    rail = %rail,
                    event_id = %event_id,
                    payment_id = %disposition.payment.id,
                    action = ?disposition.action,
                    "Webhook processed successfully"
                );
                Ok(disposition)
            }
            Err(e) => {
                warn!(rail = %rail, event_id = %event_id, error = %e, "Webhook processing failed");
                self.event_log
                    .record_failure(rail, &event_id, &e.to_string())
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Re-apply failed deliveries from their stored payloads.
    pub async fn retry_pending(&self) -> Result<usize, WebhookProcessorError> {
        let pending = self
            .event_log
            .pending_retries(MAX_WEBHOOK_ATTEMPTS, 50)
            .await?;

        let mut processed = 0;
        for event in pending {
            let Ok(adapter) = self.registry.adapter_for_rail(event.rail) else {
                continue;
            };
            let payload = serde_json::to_vec(&event.payload).unwrap_or_default();
            let callback = match adapter.parse_callback(&payload) {
                Ok(callback) => callback,
                Err(e) => {
                    warn!(event_id = %event.event_id, error = %e, "Stored webhook no longer parses");
                    continue;
                }
            };

            // Counts the retry against the attempt limit.
            self.event_log
                .log_event(event.rail, &event.event_id, &event.reference, event.payload.clone())
                .await?;

            match self.orchestrator.handle_gateway_callback(callback).await {
                Ok(_) => {
                    self.event_log.mark_processed(event.rail, &event.event_id).await?;
                    processed += 1;
                }
                Err(e) => {
                    self.event_log
                        .record_failure(event.rail, &event.event_id, &e.to_string())
                        .await?;
                }
            }
        }

        Ok(processed)
    }
}
