use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, warn};

use super::error::CacheError;
use super::keys::reconciliation::StateKey;
use super::RedisPool;
use crate::services::reconciliation::{
    ReconciliationError, ReconciliationResult, ReconciliationState, ReconciliationStateStore,
};

impl From<CacheError> for ReconciliationError {
    fn from(err: CacheError) -> Self {
        ReconciliationError::State(err.to_string())
    }
}

/// Reconciliation history in Redis, one JSON value per user.
#[derive(Clone)]
pub struct RedisReconciliationStateStore {
    pool: RedisPool,
    ttl: Duration,
}

impl RedisReconciliationStateStore {
    pub fn new(pool: RedisPool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }
}

#[async_trait]
impl ReconciliationStateStore for RedisReconciliationStateStore {
    async fn load(&self, user_id: &str) -> ReconciliationResult<ReconciliationState> {
        let key = StateKey::new(user_id).to_string();
        let mut conn = self.pool.get().await.map_err(CacheError::from)?;
        let raw: Option<String> = conn.get(&key).await.map_err(CacheError::from)?;

        match raw {
            Some(json) => match serde_json::from_str(&json) {
                Ok(state) => Ok(state),
                Err(e) => {
                    // Unreadable history is dropped rather than blocking the check.
                    warn!(key = %key, error = %e, "Discarding unreadable reconciliation state");
                    Ok(ReconciliationState::default())
                }
            },
            None => Ok(ReconciliationState::default()),
        }
    }

    async fn save(&self, user_id: &str, state: &ReconciliationState) -> ReconciliationResult<()> {
        let key = StateKey::new(user_id).to_string();
        let json = serde_json::to_string(state).map_err(CacheError::from)?;
        let mut conn = self.pool.get().await.map_err(CacheError::from)?;
        let _: () = conn
            .set_ex(&key, json, self.ttl.as_secs().max(1))
            .await
            .map_err(CacheError::from)?;
        debug!(key = %key, "Reconciliation state saved");
        Ok(())
    }
}
