use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::payments::types::{PaymentRecord, PaymentState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn insert(&self, record: &PaymentRecord) -> Result<(), DatabaseError>;

    async fn get(&self, payment_id: &str) -> Result<Option<PaymentRecord>, DatabaseError>;

    async fn find_by_gateway_reference(
        &self,
        reference: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError>;

    /// Most recent payment created under `key`.
    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError>;

    async fn find_by_verification(
        &self,
        verification_id: &str,
    ) -> Result<Vec<PaymentRecord>, DatabaseError>;

    /// Write `record` only if the stored state is still `expected`.
    /// Returns `false` when another writer got there first.
    async fn compare_and_swap(
        &self,
        expected: PaymentState,
        record: &PaymentRecord,
    ) -> Result<bool, DatabaseError>;

    /// Non-terminal payments whose deadline is at or before `now`.
    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentRecord>, DatabaseError>;

    /// Payments waiting on a gateway, oldest poll first.
    async fn list_awaiting_confirmation(
        &self,
        limit: usize,
    ) -> Result<Vec<PaymentRecord>, DatabaseError>;

    /// Terminal payments whose settlement ledger entry still needs resolving.
    async fn list_ledger_sync_pending(
        &self,
        limit: usize,
    ) -> Result<Vec<PaymentRecord>, DatabaseError>;
}

#[derive(Default)]
pub struct InMemoryPaymentStore {
    records: RwLock<HashMap<String, PaymentRecord>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn insert(&self, record: &PaymentRecord) -> Result<(), DatabaseError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                constraint: "payment_records_pkey".to_string(),
            }));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, payment_id: &str) -> Result<Option<PaymentRecord>, DatabaseError> {
        Ok(self.records.read().await.get(payment_id).cloned())
    }

    async fn find_by_gateway_reference(
        &self,
        reference: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.gateway_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.idempotency_key.as_deref() == Some(key))
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn find_by_verification(
        &self,
        verification_id: &str,
    ) -> Result<Vec<PaymentRecord>, DatabaseError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.verification_id.as_deref() == Some(verification_id))
            .cloned()
            .collect())
    }

    async fn compare_and_swap(
        &self,
        expected: PaymentState,
        record: &PaymentRecord,
    ) -> Result<bool, DatabaseError> {
        let mut records = self.records.write().await;
        let current = records
            .get_mut(&record.id)
            .ok_or_else(|| DatabaseError::not_found("Payment", record.id.clone()))?;
        if current.state != expected {
            return Ok(false);
        }
        *current = record.clone();
        Ok(true)
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentRecord>, DatabaseError> {
        let records = self.records.read().await;
        let mut expired: Vec<PaymentRecord> = records
            .values()
            .filter(|r| !r.state.is_terminal())
            .filter(|r| r.deadline_at.map(|d| d <= now).unwrap_or(false))
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.deadline_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn list_awaiting_confirmation(
        &self,
        limit: usize,
    ) -> Result<Vec<PaymentRecord>, DatabaseError> {
        let records = self.records.read().await;
        let mut waiting: Vec<PaymentRecord> = records
            .values()
            .filter(|r| r.state == PaymentState::AwaitingGatewayConfirmation)
            .cloned()
            .collect();
        waiting.sort_by_key(|r| r.last_polled_at.unwrap_or(r.created_at));
        waiting.truncate(limit);
        Ok(waiting)
    }

    async fn list_ledger_sync_pending(
        &self,
        limit: usize,
    ) -> Result<Vec<PaymentRecord>, DatabaseError> {
        let records = self.records.read().await;
        let mut pending: Vec<PaymentRecord> = records
            .values()
            .filter(|r| r.ledger_sync_pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.updated_at);
        pending.truncate(limit);
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::PaymentMethodType;
    use chrono::Duration;

    #[tokio::test]
    async fn test_compare_and_swap_rejects_stale_writer() {
        let store = InMemoryPaymentStore::new();
        let record = PaymentRecord::new("o1", "u1", "m1", 100, "INR", PaymentMethodType::Upi);
        store.insert(&record).await.unwrap();

        let mut first = record.clone();
        first.state = PaymentState::Initiated;
        let mut second = record.clone();
        second.state = PaymentState::Cancelled;

        assert!(store.compare_and_swap(PaymentState::Created, &first).await.unwrap());
        assert!(!store.compare_and_swap(PaymentState::Created, &second).await.unwrap());
        assert_eq!(
            store.get(&record.id).await.unwrap().unwrap().state,
            PaymentState::Initiated
        );
    }

    #[tokio::test]
    async fn test_list_expired_skips_terminal_and_future() {
        let store = InMemoryPaymentStore::new();
        let now = Utc::now();

        let mut overdue = PaymentRecord::new("o1", "u1", "m1", 100, "INR", PaymentMethodType::Upi);
        overdue.state = PaymentState::AwaitingGatewayConfirmation;
        overdue.deadline_at = Some(now - Duration::minutes(1));

        let mut future = PaymentRecord::new("o2", "u1", "m1", 100, "INR", PaymentMethodType::Upi);
        future.state = PaymentState::AwaitingGatewayConfirmation;
        future.deadline_at = Some(now + Duration::minutes(10));

        let mut settled = PaymentRecord::new("o3", "u1", "m1", 100, "INR", PaymentMethodType::Upi);
        settled.state = PaymentState::Settled;
        settled.deadline_at = Some(now - Duration::minutes(5));

        for r in [&overdue, &future, &settled] {
            store.insert(r).await.unwrap();
        }

        let expired = store.list_expired(now, 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, overdue.id);
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_rejected() {
        let store = InMemoryPaymentStore::new();
        let record = PaymentRecord::new("o1", "u1", "m1", 100, "INR", PaymentMethodType::Card);
        store.insert(&record).await.unwrap();
        assert!(store.insert(&record).await.is_err());
    }

    #[tokio::test]
    async fn test_list_ledger_sync_pending_only_returns_flagged() {
        let store = InMemoryPaymentStore::new();
        let mut flagged = PaymentRecord::new("o1", "u1", "m1", 100, "INR", PaymentMethodType::Upi);
        flagged.state = PaymentState::Failed;
        flagged.ledger_sync_pending = true;
        let plain = PaymentRecord::new("o2", "u1", "m1", 100, "INR", PaymentMethodType::Upi);
        store.insert(&flagged).await.unwrap();
        store.insert(&plain).await.unwrap();

        let pending = store.list_ledger_sync_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, flagged.id);
    }
}
