//! In-process ledger used in sandbox mode and tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::error::{LedgerError, LedgerResult};
use super::store::{check_replay, plan_resolution, LedgerStore, Resolution};
use super::types::{
    ApplyOutcome, Balance, LedgerSnapshot, LedgerTransaction, NewTransaction, TransactionStatus,
};

struct Account {
    balance: Balance,
    log: Vec<LedgerTransaction>,
    positions: HashMap<String, usize>,
}

impl Account {
    fn new(user_id: &str) -> Self {
        Self {
            balance: Balance::empty(user_id),
            log: Vec::new(),
            positions: HashMap::new(),
        }
    }
}

/// Ledger held in memory with one async mutex per user.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    accounts: RwLock<HashMap<String, Arc<Mutex<Account>>>>,
    /// Transaction id to owning user id.
    index: RwLock<HashMap<String, String>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn account(&self, user_id: &str) -> Arc<Mutex<Account>> {
        if let Some(account) = self.accounts.read().await.get(user_id) {
            return account.clone();
        }
        let mut accounts = self.accounts.write().await;
        accounts
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Account::new(user_id))))
            .clone()
    }

    async fn owner_of(&self, tx_id: &str) -> Option<String> {
        self.index.read().await.get(tx_id).cloned()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn apply(&self, tx: NewTransaction) -> LedgerResult<ApplyOutcome> {
        tx.validate()?;

        let account = self.account(&tx.user_id).await;
        let mut account = account.lock().await;

        if let Some(owner) = self.owner_of(&tx.id).await {
            if owner != tx.user_id {
                return Err(LedgerError::IdempotencyConflict {
                    transaction_id: tx.id,
                });
            }
            let existing = account
                .positions
                .get(&tx.id)
                .map(|pos| account.log[*pos].clone())
                .ok_or_else(|| LedgerError::TransactionNotFound {
                    transaction_id: tx.id.clone(),
                })?;
            check_replay(&existing, &tx)?;
            debug!(transaction_id = %tx.id, user_id = %tx.user_id, "Duplicate ledger apply ignored");
            return Ok(ApplyOutcome {
                transaction: existing,
                balance: account.balance.clone(),
                duplicate: true,
            });
        }

        let mut balance = account.balance.clone();
        balance.apply_new(tx.direction, tx.amount, tx.status)?;

        let sequence = account.log.len() as i64 + 1;
        let record = tx.into_record(sequence, Utc::now());
        {
            let mut index = self.index.write().await;
            if index.contains_key(&record.id) {
                return Err(LedgerError::IdempotencyConflict {
                    transaction_id: record.id,
                });
            }
            index.insert(record.id.clone(), record.user_id.clone());
        }

        let position = account.log.len();
        account.balance = balance;
        account.positions.insert(record.id.clone(), position);
        account.log.push(record.clone());

        info!(
            transaction_id = %record.id,
            user_id = %record.user_id,
            direction = %record.direction,
            amount = record.amount,
            status = %record.status,
            available = account.balance.available,
            "Ledger transaction applied"
        );

        Ok(ApplyOutcome {
            transaction: record,
            balance: account.balance.clone(),
            duplicate: false,
        })
    }

    async fn get_balance(&self, user_id: &str) -> LedgerResult<Balance> {
        let account = self.accounts.read().await.get(user_id).cloned();
        match account {
            Some(account) => Ok(account.lock().await.balance.clone()),
            None => Ok(Balance::empty(user_id)),
        }
    }

    async fn resolve(&self, tx_id: &str, target: TransactionStatus) -> LedgerResult<ApplyOutcome> {
        let owner = self
            .owner_of(tx_id)
            .await
            .ok_or_else(|| LedgerError::TransactionNotFound {
                transaction_id: tx_id.to_string(),
            })?;

        let account = self.account(&owner).await;
        let mut account = account.lock().await;
        let pos = *account
            .positions
            .get(tx_id)
            .ok_or_else(|| LedgerError::TransactionNotFound {
                transaction_id: tx_id.to_string(),
            })?;
        let current = account.log[pos].clone();

        if plan_resolution(&current, target)? == Resolution::AlreadyResolved {
            return Ok(ApplyOutcome {
                transaction: current,
                balance: account.balance.clone(),
                duplicate: true,
            });
        }

        let mut balance = account.balance.clone();
        balance.resolve_pending(current.direction, current.amount, target)?;
        account.balance = balance;

        let record = &mut account.log[pos];
        record.status = target;
        if target == TransactionStatus::Completed {
            record.completed_at = Some(Utc::now());
        }
        let record = record.clone();

        info!(
            transaction_id = %record.id,
            user_id = %record.user_id,
            status = %record.status,
            "Pending ledger transaction resolved"
        );

        Ok(ApplyOutcome {
            transaction: record,
            balance: account.balance.clone(),
            duplicate: false,
        })
    }

    async fn find_transaction(&self, tx_id: &str) -> LedgerResult<Option<LedgerTransaction>> {
        let Some(owner) = self.owner_of(tx_id).await else {
            return Ok(None);
        };
        let account = self.account(&owner).await;
        let account = account.lock().await;
        Ok(account
            .positions
            .get(tx_id)
            .map(|pos| account.log[*pos].clone()))
    }

    async fn transaction_log(&self, user_id: &str) -> LedgerResult<Vec<LedgerTransaction>> {
        let account = self.accounts.read().await.get(user_id).cloned();
        match account {
            Some(account) => Ok(account.lock().await.log.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn user_ids(&self) -> LedgerResult<Vec<String>> {
        let mut ids: Vec<String> = self.accounts.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn snapshot(&self, user_id: &str) -> LedgerResult<LedgerSnapshot> {
        let account = self.accounts.read().await.get(user_id).cloned();
        match account {
            Some(account) => {
                let account = account.lock().await;
                Ok(LedgerSnapshot {
                    balance: account.balance.clone(),
                    log: account.log.clone(),
                })
            }
            None => Ok(LedgerSnapshot {
                balance: Balance::empty(user_id),
                log: Vec::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::types::TransactionSource;

    #[tokio::test]
    async fn test_apply_is_idempotent_by_id() {
        let store = InMemoryLedgerStore::new();
        let tx = NewTransaction::credit("tx-1", "u1", 50, TransactionSource::DailyLogin);

        let first = store.apply(tx.clone()).await.unwrap();
        let second = store.apply(tx).await.unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.balance, second.balance);
        assert_eq!(store.get_balance("u1").await.unwrap().available, 50);
        assert_eq!(store.transaction_log("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reused_id_with_other_payload_conflicts() {
        let store = InMemoryLedgerStore::new();
        store
            .apply(NewTransaction::credit("tx-1", "u1", 50, TransactionSource::Bonus))
            .await
            .unwrap();

        let err = store
            .apply(NewTransaction::credit("tx-1", "u1", 75, TransactionSource::Bonus))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::IdempotencyConflict { .. }));

        let err = store
            .apply(NewTransaction::credit("tx-1", "u2", 50, TransactionSource::Bonus))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::IdempotencyConflict { .. }));
        assert_eq!(store.get_balance("u2").await.unwrap().available, 0);
    }

    #[tokio::test]
    async fn test_rejected_debit_leaves_no_trace() {
        let store = InMemoryLedgerStore::new();
        store
            .apply(NewTransaction::credit("c1", "u1", 30, TransactionSource::Review))
            .await
            .unwrap();

        let err = store
            .apply(NewTransaction::debit("d1", "u1", 50, TransactionSource::Purchase))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert!(store.find_transaction("d1").await.unwrap().is_none());
        assert_eq!(store.get_balance("u1").await.unwrap().available, 30);
    }

    #[tokio::test]
    async fn test_settle_and_cancel_are_idempotent_but_exclusive() {
        let store = InMemoryLedgerStore::new();
        store
            .apply(NewTransaction::credit("p1", "u1", 20, TransactionSource::Purchase).pending())
            .await
            .unwrap();

        let settled = store.settle("p1").await.unwrap();
        assert_eq!(settled.balance.available, 20);
        assert_eq!(settled.transaction.status, TransactionStatus::Completed);

        let again = store.settle("p1").await.unwrap();
        assert!(again.duplicate);
        assert_eq!(again.balance.available, 20);

        let err = store.cancel("p1").await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_resolving_unknown_transaction_fails() {
        let store = InMemoryLedgerStore::new();
        let err = store.settle("missing").await.unwrap_err();
        assert!(matches!(err, LedgerError::TransactionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_debits_never_overdraw() {
        let store = Arc::new(InMemoryLedgerStore::new());
        store
            .apply(NewTransaction::credit("seed", "u1", 100, TransactionSource::Bonus))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..25 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .apply(NewTransaction::debit(
                        format!("d{}", i),
                        "u1",
                        10,
                        TransactionSource::Purchase,
                    ))
                    .await
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                accepted += 1;
            }
        }

        let balance = store.get_balance("u1").await.unwrap();
        assert_eq!(accepted, 10);
        assert_eq!(balance.available, 0);
        assert!(balance.is_conserved());
        assert_eq!(store.replay_balance("u1").await.unwrap(), balance);
    }

    #[tokio::test]
    async fn test_log_sequence_follows_acceptance_order() {
        let store = InMemoryLedgerStore::new();
        for i in 0..3 {
            store
                .apply(NewTransaction::credit(
                    format!("tx-{}", i),
                    "u1",
                    1,
                    TransactionSource::SocialShare,
                ))
                .await
                .unwrap();
        }
        let sequences: Vec<i64> = store
            .transaction_log("u1")
            .await
            .unwrap()
            .iter()
            .map(|tx| tx.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }
}
