//! Balance arithmetic shared by every ledger store.
//!
//! Effects by transaction shape:
//!
//! | direction | status    | available | pending | earned | spent |
//! |-----------|-----------|-----------|---------|--------|-------|
//! | credit    | completed | +a        |         | +a     |       |
//! | credit    | pending   |           | +a      | +a     |       |
//! | debit     | completed | -a        |         |        | +a    |
//! | debit     | pending   | -a        | +a      |        |       |
//!
//! A pending debit is a hold: it leaves `available` immediately and is only
//! counted as spent once settled. Cancelling or expiring a pending
//! transaction undoes its row entirely.

use super::error::{LedgerError, LedgerResult};
use super::types::{Balance, Direction, LedgerTransaction, MinorUnits, TransactionStatus};

impl Balance {
    pub fn empty(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            available: 0,
            pending: 0,
            lifetime_earned: 0,
            lifetime_spent: 0,
        }
    }

    pub fn is_conserved(&self) -> bool {
        self.available.checked_add(self.pending)
            == self.lifetime_earned.checked_sub(self.lifetime_spent)
    }

    /// Apply the effect of a newly accepted transaction.
    ///
    /// Debits (held or completed) are rejected when they would take
    /// `available` below zero, credits when a total would leave the `i64`
    /// range. On error the balance is left untouched.
    pub fn apply_new(
        &mut self,
        direction: Direction,
        amount: MinorUnits,
        status: TransactionStatus,
    ) -> LedgerResult<()> {
        let mut next = self.clone();
        match (direction, status) {
            (Direction::Credit, TransactionStatus::Completed) => {
                next.available = self.checked(self.available.checked_add(amount))?;
                next.lifetime_earned = self.checked(self.lifetime_earned.checked_add(amount))?;
            }
            (Direction::Credit, TransactionStatus::Pending) => {
                next.pending = self.checked(self.pending.checked_add(amount))?;
                next.lifetime_earned = self.checked(self.lifetime_earned.checked_add(amount))?;
            }
            (Direction::Debit, TransactionStatus::Completed) => {
                self.ensure_available(amount)?;
                next.available = self.checked(self.available.checked_sub(amount))?;
                next.lifetime_spent = self.checked(self.lifetime_spent.checked_add(amount))?;
            }
            (Direction::Debit, TransactionStatus::Pending) => {
                self.ensure_available(amount)?;
                next.available = self.checked(self.available.checked_sub(amount))?;
                next.pending = self.checked(self.pending.checked_add(amount))?;
            }
            (_, other) => {
                return Err(LedgerError::Validation(format!(
                    "cannot apply a transaction in status {}",
                    other
                )))
            }
        }
        *self = next;
        Ok(())
    }

    /// Move a pending transaction's effect to its terminal status.
    pub fn resolve_pending(
        &mut self,
        direction: Direction,
        amount: MinorUnits,
        target: TransactionStatus,
    ) -> LedgerResult<()> {
        let mut next = self.clone();
        match (direction, target) {
            (Direction::Credit, TransactionStatus::Completed) => {
                next.pending = self.checked(self.pending.checked_sub(amount))?;
                next.available = self.checked(self.available.checked_add(amount))?;
            }
            (Direction::Credit, TransactionStatus::Cancelled | TransactionStatus::Expired) => {
                next.pending = self.checked(self.pending.checked_sub(amount))?;
                next.lifetime_earned = self.checked(self.lifetime_earned.checked_sub(amount))?;
            }
            (Direction::Debit, TransactionStatus::Completed) => {
                next.pending = self.checked(self.pending.checked_sub(amount))?;
                next.lifetime_spent = self.checked(self.lifetime_spent.checked_add(amount))?;
            }
            (Direction::Debit, TransactionStatus::Cancelled | TransactionStatus::Expired) => {
                next.pending = self.checked(self.pending.checked_sub(amount))?;
                next.available = self.checked(self.available.checked_add(amount))?;
            }
            (_, TransactionStatus::Pending) => {
                return Err(LedgerError::Validation(
                    "a pending transaction cannot be resolved to pending".to_string(),
                ))
            }
        }
        *self = next;
        Ok(())
    }

    /// Rebuild a balance purely from the transaction log.
    ///
    /// Only each record's current status matters, so the result is independent
    /// of the order in which pending records were later resolved.
    pub fn replay<'a, I>(user_id: &str, log: I) -> Self
    where
        I: IntoIterator<Item = &'a LedgerTransaction>,
    {
        let mut balance = Balance::empty(user_id);
        for tx in log {
            if tx.user_id != user_id {
                continue;
            }
            // Saturates instead of wrapping; a log that overflows cannot
            // match the stored balance and shows up as drift.
            match (tx.direction, tx.status) {
                (Direction::Credit, TransactionStatus::Completed) => {
                    balance.available = balance.available.saturating_add(tx.amount);
                    balance.lifetime_earned = balance.lifetime_earned.saturating_add(tx.amount);
                }
                (Direction::Credit, TransactionStatus::Pending) => {
                    balance.pending = balance.pending.saturating_add(tx.amount);
                    balance.lifetime_earned = balance.lifetime_earned.saturating_add(tx.amount);
                }
                (Direction::Debit, TransactionStatus::Completed) => {
                    balance.available = balance.available.saturating_sub(tx.amount);
                    balance.lifetime_spent = balance.lifetime_spent.saturating_add(tx.amount);
                }
                (Direction::Debit, TransactionStatus::Pending) => {
                    balance.available = balance.available.saturating_sub(tx.amount);
                    balance.pending = balance.pending.saturating_add(tx.amount);
                }
                (_, TransactionStatus::Cancelled | TransactionStatus::Expired) => {}
            }
        }
        balance
    }

    fn checked(&self, value: Option<MinorUnits>) -> LedgerResult<MinorUnits> {
        value.ok_or_else(|| {
            LedgerError::Validation(format!(
                "amount would overflow the balance of {}",
                self.user_id
            ))
        })
    }

    fn ensure_available(&self, amount: MinorUnits) -> LedgerResult<()> {
        if self.available < amount {
            return Err(LedgerError::InsufficientBalance {
                user_id: self.user_id.clone(),
                available: self.available,
                required: amount,
            });
        }
        Ok(())
    }
}
