use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;

use crate::database::error::DatabaseError;
use crate::payments::types::GatewayRail;
use crate::services::webhook_processor::{WebhookEventLog, WebhookEventRecord, WebhookEventStatus};

#[derive(Debug, Clone, FromRow)]
struct WebhookEventRow {
    rail: String,
    event_id: String,
    reference: String,
    status: String,
    payload: JsonValue,
    attempts: i32,
    last_error: Option<String>,
    received_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<WebhookEventRow> for WebhookEventRecord {
    type Error = DatabaseError;

    fn try_from(row: WebhookEventRow) -> Result<Self, Self::Error> {
        Ok(WebhookEventRecord {
            rail: GatewayRail::from_str(&row.rail)
                .map_err(|e| DatabaseError::unknown(e.to_string()))?,
            event_id: row.event_id,
            reference: row.reference,
            status: WebhookEventStatus::from_str(&row.status)?,
            payload: row.payload,
            attempts: row.attempts.max(0) as u32,
            last_error: row.last_error,
            received_at: row.received_at,
            processed_at: row.processed_at,
        })
    }
}

const COLUMNS: &str =
    "rail, event_id, reference, status, payload, attempts, last_error, received_at, processed_at";

pub struct WebhookRepository {
    pool: PgPool,
}

impl WebhookRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookEventLog for WebhookRepository {
    async fn log_event(
        &self,
        rail: GatewayRail,
        event_id: &str,
        reference: &str,
        payload: JsonValue,
    ) -> Result<WebhookEventRecord, DatabaseError> {
        let sql = format!(
            "INSERT INTO webhook_events (rail, event_id, reference, status, payload, attempts)
             VALUES ($1, $2, $3, 'pending', $4, 1)
             ON CONFLICT (rail, event_id) DO UPDATE
             SET attempts = webhook_events.attempts + 1
             RETURNING {}",
            COLUMNS
        );
        sqlx::query_as::<_, WebhookEventRow>(&sql)
            .bind(rail.as_str())
            .bind(event_id)
            .bind(reference)
            .bind(payload)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .try_into()
    }

    async fn mark_processed(&self, rail: GatewayRail, event_id: &str) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE webhook_events
             SET status = 'completed', processed_at = NOW(), last_error = NULL
             WHERE rail = $1 AND event_id = $2",
        )
        .bind(rail.as_str())
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::not_found("WebhookEvent", event_id));
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        rail: GatewayRail,
        event_id: &str,
        error: &str,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE webhook_events SET status = 'failed', last_error = $3
             WHERE rail = $1 AND event_id = $2",
        )
        .bind(rail.as_str())
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::not_found("WebhookEvent", event_id));
        }
        Ok(())
    }

    async fn pending_retries(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<WebhookEventRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM webhook_events
             WHERE status = 'failed' AND attempts < $1
             ORDER BY received_at ASC LIMIT $2",
            COLUMNS
        );
        sqlx::query_as::<_, WebhookEventRow>(&sql)
            .bind(max_attempts as i32)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .into_iter()
            .map(WebhookEventRecord::try_from)
            .collect()
    }
}
