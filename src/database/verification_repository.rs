use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};

use crate::database::error::DatabaseError;
use crate::verification::types::{ChallengeSecret, VerificationRecord, VerificationStatus};
use crate::verification::VerificationStore;

#[derive(Debug, FromRow)]
struct VerificationRow {
    record: JsonValue,
    challenge: Option<JsonValue>,
}

impl TryFrom<VerificationRow> for VerificationRecord {
    type Error = DatabaseError;

    fn try_from(row: VerificationRow) -> Result<Self, Self::Error> {
        let mut record: VerificationRecord = serde_json::from_value(row.record)
            .map_err(|e| DatabaseError::unknown(format!("corrupt verification record: {}", e)))?;
        // The secret is never part of the serialized record.
        record.challenge = row
            .challenge
            .map(serde_json::from_value::<ChallengeSecret>)
            .transpose()
            .map_err(|e| DatabaseError::unknown(format!("corrupt challenge secret: {}", e)))?;
        Ok(record)
    }
}

fn encode(record: &VerificationRecord) -> Result<(JsonValue, Option<JsonValue>), DatabaseError> {
    let body = serde_json::to_value(record)
        .map_err(|e| DatabaseError::unknown(format!("cannot encode verification: {}", e)))?;
    let challenge = record
        .challenge
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| DatabaseError::unknown(format!("cannot encode challenge: {}", e)))?;
    Ok((body, challenge))
}

pub struct PgVerificationStore {
    pool: PgPool,
}

impl PgVerificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VerificationStore for PgVerificationStore {
    async fn insert(&self, record: &VerificationRecord) -> Result<(), DatabaseError> {
        let (body, challenge) = encode(record)?;
        sqlx::query(
            "INSERT INTO verification_records
             (id, instrument_id, status, payment_id, expires_at, created_at, updated_at, record, challenge)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&record.id)
        .bind(&record.instrument_id)
        .bind(record.status.as_str())
        .bind(&record.payment_id)
        .bind(record.expires_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(body)
        .bind(challenge)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn get(&self, verification_id: &str) -> Result<Option<VerificationRecord>, DatabaseError> {
        sqlx::query_as::<_, VerificationRow>(
            "SELECT record, challenge FROM verification_records WHERE id = $1",
        )
        .bind(verification_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(VerificationRecord::try_from)
        .transpose()
    }

    async fn compare_and_swap(
        &self,
        expected: VerificationStatus,
        record: &VerificationRecord,
    ) -> Result<bool, DatabaseError> {
        let (body, challenge) = encode(record)?;
        let result = sqlx::query(
            "UPDATE verification_records
             SET status = $3, expires_at = $4, updated_at = $5, record = $6, challenge = $7
             WHERE id = $1 AND status = $2",
        )
        .bind(&record.id)
        .bind(expected.as_str())
        .bind(record.status.as_str())
        .bind(record.expires_at)
        .bind(record.updated_at)
        .bind(body)
        .bind(challenge)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn history(&self, instrument_id: &str) -> Result<Vec<VerificationRecord>, DatabaseError> {
        sqlx::query_as::<_, VerificationRow>(
            "SELECT record, challenge FROM verification_records
             WHERE instrument_id = $1 ORDER BY created_at ASC",
        )
        .bind(instrument_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .into_iter()
        .map(VerificationRecord::try_from)
        .collect()
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<VerificationRecord>, DatabaseError> {
        sqlx::query_as::<_, VerificationRow>(
            "SELECT record, challenge FROM verification_records
             WHERE status NOT IN ('verified', 'failed', 'expired')
               AND expires_at IS NOT NULL AND expires_at <= $1
             ORDER BY expires_at ASC LIMIT $2",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .into_iter()
        .map(VerificationRecord::try_from)
        .collect()
    }
}
