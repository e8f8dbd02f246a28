use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;

use crate::database::error::DatabaseError;
use crate::payments::store::PaymentStore;
use crate::payments::types::{PaymentRecord, PaymentState};

/// Payment records stored as JSONB, with the columns the store queries on
/// kept alongside for indexing.
pub struct PgPaymentStore {
    pool: PgPool,
}

impl PgPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_many(
        &self,
        sql: &str,
        bind: Option<&str>,
        limit: Option<i64>,
        now: Option<DateTime<Utc>>,
    ) -> Result<Vec<PaymentRecord>, DatabaseError> {
        let mut query = sqlx::query_scalar::<_, JsonValue>(sql);
        if let Some(value) = bind {
            query = query.bind(value.to_string());
        }
        if let Some(now) = now {
            query = query.bind(now);
        }
        if let Some(limit) = limit {
            query = query.bind(limit);
        }
        query
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .into_iter()
            .map(decode)
            .collect()
    }

    async fn fetch_one(&self, sql: &str, value: &str) -> Result<Option<PaymentRecord>, DatabaseError> {
        sqlx::query_scalar::<_, JsonValue>(sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(decode)
            .transpose()
    }
}

fn decode(value: JsonValue) -> Result<PaymentRecord, DatabaseError> {
    serde_json::from_value(value)
        .map_err(|e| DatabaseError::unknown(format!("corrupt payment record: {}", e)))
}

fn encode(record: &PaymentRecord) -> Result<JsonValue, DatabaseError> {
    serde_json::to_value(record)
        .map_err(|e| DatabaseError::unknown(format!("cannot encode payment record: {}", e)))
}

const TERMINAL_STATES: &str = "('settled', 'failed', 'cancelled')";

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn insert(&self, record: &PaymentRecord) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO payment_records
             (id, order_id, user_id, state, gateway_reference, idempotency_key, verification_id,
              deadline_at, last_polled_at, ledger_sync_pending, created_at, updated_at, record)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(&record.id)
        .bind(&record.order_id)
        .bind(&record.user_id)
        .bind(record.state.as_str())
        .bind(&record.gateway_reference)
        .bind(&record.idempotency_key)
        .bind(&record.verification_id)
        .bind(record.deadline_at)
        .bind(record.last_polled_at)
        .bind(record.ledger_sync_pending)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(encode(record)?)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn get(&self, payment_id: &str) -> Result<Option<PaymentRecord>, DatabaseError> {
        self.fetch_one("SELECT record FROM payment_records WHERE id = $1", payment_id)
            .await
    }

    async fn find_by_gateway_reference(
        &self,
        reference: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        self.fetch_one(
            "SELECT record FROM payment_records WHERE gateway_reference = $1",
            reference,
        )
        .await
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        self.fetch_one(
            "SELECT record FROM payment_records WHERE idempotency_key = $1
             ORDER BY created_at DESC LIMIT 1",
            key,
        )
        .await
    }

    async fn find_by_verification(
        &self,
        verification_id: &str,
    ) -> Result<Vec<PaymentRecord>, DatabaseError> {
        self.fetch_many(
            "SELECT record FROM payment_records WHERE verification_id = $1 ORDER BY created_at ASC",
            Some(verification_id),
            None,
            None,
        )
        .await
    }

    async fn compare_and_swap(
        &self,
        expected: PaymentState,
        record: &PaymentRecord,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE payment_records
             SET state = $3, gateway_reference = $4, verification_id = $5, deadline_at = $6,
                 last_polled_at = $7, ledger_sync_pending = $8, updated_at = $9, record = $10
             WHERE id = $1 AND state = $2",
        )
        .bind(&record.id)
        .bind(expected.as_str())
        .bind(record.state.as_str())
        .bind(&record.gateway_reference)
        .bind(&record.verification_id)
        .bind(record.deadline_at)
        .bind(record.last_polled_at)
        .bind(record.ledger_sync_pending)
        .bind(record.updated_at)
        .bind(encode(record)?)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentRecord>, DatabaseError> {
        let sql = format!(
            "SELECT record FROM payment_records
             WHERE state NOT IN {} AND deadline_at IS NOT NULL AND deadline_at <= $1
             ORDER BY deadline_at ASC LIMIT $2",
            TERMINAL_STATES
        );
        self.fetch_many(&sql, None, Some(limit as i64), Some(now)).await
    }

    async fn list_awaiting_confirmation(
        &self,
        limit: usize,
    ) -> Result<Vec<PaymentRecord>, DatabaseError> {
        self.fetch_many(
            "SELECT record FROM payment_records
             WHERE state = 'awaiting_gateway_confirmation'
             ORDER BY last_polled_at ASC NULLS FIRST LIMIT $1",
            None,
            Some(limit as i64),
            None,
        )
        .await
    }

    async fn list_ledger_sync_pending(
        &self,
        limit: usize,
    ) -> Result<Vec<PaymentRecord>, DatabaseError> {
        self.fetch_many(
            "SELECT record FROM payment_records
             WHERE ledger_sync_pending
             ORDER BY updated_at ASC LIMIT $1",
            None,
            Some(limit as i64),
            None,
        )
        .await
    }
}
