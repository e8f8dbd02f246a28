use async_trait::async_trait;

use super::error::LedgerResult;
use super::types::{
    ApplyOutcome, Balance, LedgerSnapshot, LedgerTransaction, NewTransaction, TransactionStatus,
};

/// System of record for balances and the append-only transaction log.
///
/// Implementations must serialize mutations per user: the balance update and
/// the log append for one transaction happen together or not at all, and two
/// concurrent debits for the same user can never both pass the balance check.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Apply a transaction exactly once per `tx.id`.
    ///
    /// Re-applying a known id returns the stored transaction and the current
    /// balance with `duplicate = true`.
    async fn apply(&self, tx: NewTransaction) -> LedgerResult<ApplyOutcome>;

    async fn get_balance(&self, user_id: &str) -> LedgerResult<Balance>;

    /// Move a pending transaction to `target`. Idempotent when the transaction
    /// already sits in `target`.
    async fn resolve(&self, tx_id: &str, target: TransactionStatus) -> LedgerResult<ApplyOutcome>;

    async fn find_transaction(&self, tx_id: &str) -> LedgerResult<Option<LedgerTransaction>>;

    /// Full log for one user, ordered by sequence.
    async fn transaction_log(&self, user_id: &str) -> LedgerResult<Vec<LedgerTransaction>>;

    async fn user_ids(&self) -> LedgerResult<Vec<String>>;

    /// Balance and log read together, with no mutation for the user between them.
    async fn snapshot(&self, user_id: &str) -> LedgerResult<LedgerSnapshot>;

    async fn settle(&self, tx_id: &str) -> LedgerResult<ApplyOutcome> {
        self.resolve(tx_id, TransactionStatus::Completed).await
    }

    async fn cancel(&self, tx_id: &str) -> LedgerResult<ApplyOutcome> {
        self.resolve(tx_id, TransactionStatus::Cancelled).await
    }

    async fn expire(&self, tx_id: &str) -> LedgerResult<ApplyOutcome> {
        self.resolve(tx_id, TransactionStatus::Expired).await
    }

    /// Balance recomputed from the log alone.
    async fn replay_balance(&self, user_id: &str) -> LedgerResult<Balance> {
        let log = self.transaction_log(user_id).await?;
        Ok(Balance::replay(user_id, &log))
    }
}

/// What resolving a transaction to a target status amounts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Already in the target status; nothing to do.
    AlreadyResolved,
    /// Pending and allowed to move.
    Transition,
}

/// Decide whether `tx` may move to `target`, logging rejected transitions.
pub fn plan_resolution(tx: &LedgerTransaction, target: TransactionStatus) -> LedgerResult<Resolution> {
    if tx.status == target && target.is_terminal() {
        return Ok(Resolution::AlreadyResolved);
    }
    if !tx.status.can_transition_to(target) {
        tracing::error!(
            transaction_id = %tx.id,
            user_id = %tx.user_id,
            from_status = %tx.status,
            to_status = %target,
            "Rejected invalid ledger transition"
        );
        return Err(super::error::LedgerError::InvalidTransition {
            transaction_id: tx.id.clone(),
            from: tx.status,
            to: target,
        });
    }
    Ok(Resolution::Transition)
}

/// Decide whether re-submitting `candidate` under an existing id is a replay.
pub fn check_replay(existing: &LedgerTransaction, candidate: &NewTransaction) -> LedgerResult<()> {
    if existing.same_effect(candidate) {
        Ok(())
    } else {
        tracing::warn!(
            transaction_id = %existing.id,
            stored_user = %existing.user_id,
            submitted_user = %candidate.user_id,
            "Idempotency key reused with a different payload"
        );
        Err(super::error::LedgerError::IdempotencyConflict {
            transaction_id: existing.id.clone(),
        })
    }
}
