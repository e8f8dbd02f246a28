use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::types::{VerificationRecord, VerificationStatus};
use crate::database::error::DatabaseError;

#[async_trait]
pub trait VerificationStore: Send + Sync {
    async fn insert(&self, record: &VerificationRecord) -> Result<(), DatabaseError>;

    async fn get(&self, verification_id: &str) -> Result<Option<VerificationRecord>, DatabaseError>;

    /// Write `record` only if the stored status is still `expected`.
    async fn compare_and_swap(
        &self,
        expected: VerificationStatus,
        record: &VerificationRecord,
    ) -> Result<bool, DatabaseError>;

    /// All records for an instrument, oldest first.
    async fn history(&self, instrument_id: &str) -> Result<Vec<VerificationRecord>, DatabaseError>;

    /// Non-terminal records whose `expires_at` is at or before `now`.
    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<VerificationRecord>, DatabaseError>;
}

#[derive(Default)]
pub struct InMemoryVerificationStore {
    records: RwLock<HashMap<String, VerificationRecord>>,
}

impl InMemoryVerificationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VerificationStore for InMemoryVerificationStore {
    async fn insert(&self, record: &VerificationRecord) -> Result<(), DatabaseError> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, verification_id: &str) -> Result<Option<VerificationRecord>, DatabaseError> {
        Ok(self.records.read().await.get(verification_id).cloned())
    }

    async fn compare_and_swap(
        &self,
        expected: VerificationStatus,
        record: &VerificationRecord,
    ) -> Result<bool, DatabaseError> {
        let mut records = self.records.write().await;
        let current = records
            .get_mut(&record.id)
            .ok_or_else(|| DatabaseError::not_found("Verification", record.id.clone()))?;
        if current.status != expected {
            return Ok(false);
        }
        *current = record.clone();
        Ok(true)
    }

    async fn history(&self, instrument_id: &str) -> Result<Vec<VerificationRecord>, DatabaseError> {
        let mut history: Vec<VerificationRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.instrument_id == instrument_id)
            .cloned()
            .collect();
        history.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(history)
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<VerificationRecord>, DatabaseError> {
        let mut expired: Vec<VerificationRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.is_expired_at(now))
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }
}
