use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::str::FromStr;
use tracing::{debug, info};

use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::ledger::store::{check_replay, plan_resolution, Resolution};
use crate::ledger::{
    ApplyOutcome, Balance, Direction, LedgerError, LedgerResult, LedgerSnapshot, LedgerStore,
    LedgerTransaction, NewTransaction, TransactionSource, TransactionStatus,
};

#[derive(Debug, Clone, FromRow)]
struct BalanceRow {
    user_id: String,
    available: i64,
    pending: i64,
    lifetime_earned: i64,
    lifetime_spent: i64,
}

impl From<BalanceRow> for Balance {
    fn from(row: BalanceRow) -> Self {
        Balance {
            user_id: row.user_id,
            available: row.available,
            pending: row.pending,
            lifetime_earned: row.lifetime_earned,
            lifetime_spent: row.lifetime_spent,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct TransactionRow {
    id: String,
    user_id: String,
    sequence: i64,
    direction: String,
    amount: i64,
    source: String,
    status: String,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    metadata: JsonValue,
}

impl TryFrom<TransactionRow> for LedgerTransaction {
    type Error = LedgerError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(LedgerTransaction {
            id: row.id,
            user_id: row.user_id,
            sequence: row.sequence,
            direction: Direction::from_str(&row.direction)?,
            amount: row.amount,
            source: TransactionSource::from_str(&row.source)?,
            status: TransactionStatus::from_str(&row.status)?,
            created_at: row.created_at,
            completed_at: row.completed_at,
            metadata: row.metadata,
        })
    }
}

const TRANSACTION_COLUMNS: &str =
    "id, user_id, sequence, direction, amount, source, status, created_at, completed_at, metadata";

fn db_err(e: sqlx::Error) -> LedgerError {
    DatabaseError::from_sqlx(e).into()
}

/// Postgres ledger. Every mutation locks the user's balance row with
/// `SELECT ... FOR UPDATE` so the balance check and the log append commit
/// together.
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_balance(
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
    ) -> LedgerResult<Balance> {
        sqlx::query(
            "INSERT INTO ledger_balances (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        let row = sqlx::query_as::<_, BalanceRow>(
            "SELECT user_id, available, pending, lifetime_earned, lifetime_spent
             FROM ledger_balances WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(row.into())
    }

    async fn store_balance(
        tx: &mut Transaction<'_, Postgres>,
        balance: &Balance,
    ) -> LedgerResult<()> {
        sqlx::query(
            "UPDATE ledger_balances
             SET available = $2, pending = $3, lifetime_earned = $4, lifetime_spent = $5, updated_at = NOW()
             WHERE user_id = $1",
        )
        .bind(&balance.user_id)
        .bind(balance.available)
        .bind(balance.pending)
        .bind(balance.lifetime_earned)
        .bind(balance.lifetime_spent)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn fetch_transaction(
        tx: &mut Transaction<'_, Postgres>,
        tx_id: &str,
        for_update: bool,
    ) -> LedgerResult<Option<LedgerTransaction>> {
        let sql = format!(
            "SELECT {} FROM ledger_transactions WHERE id = $1{}",
            TRANSACTION_COLUMNS,
            if for_update { " FOR UPDATE" } else { "" }
        );
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(tx_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?
            .map(LedgerTransaction::try_from)
            .transpose()
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn apply(&self, new_tx: NewTransaction) -> LedgerResult<ApplyOutcome> {
        new_tx.validate()?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut balance = Self::lock_balance(&mut tx, &new_tx.user_id).await?;

        if let Some(existing) = Self::fetch_transaction(&mut tx, &new_tx.id, false).await? {
            if existing.user_id != new_tx.user_id {
                return Err(LedgerError::IdempotencyConflict {
                    transaction_id: new_tx.id,
                });
            }
            check_replay(&existing, &new_tx)?;
            tx.commit().await.map_err(db_err)?;
            debug!(transaction_id = %existing.id, user_id = %existing.user_id, "Duplicate ledger apply ignored");
            return Ok(ApplyOutcome {
                transaction: existing,
                balance,
                duplicate: true,
            });
        }

        balance.apply_new(new_tx.direction, new_tx.amount, new_tx.status)?;

        let sequence: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM ledger_transactions WHERE user_id = $1",
        )
        .bind(&new_tx.user_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let record = new_tx.into_record(sequence, Utc::now());
        let inserted = sqlx::query(
            "INSERT INTO ledger_transactions
             (id, user_id, sequence, direction, amount, source, status, created_at, completed_at, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(record.sequence)
        .bind(record.direction.as_str())
        .bind(record.amount)
        .bind(record.source.as_str())
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.completed_at)
        .bind(&record.metadata)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            let err = DatabaseError::from_sqlx(e);
            // Same id applied concurrently for a different user.
            if matches!(err.kind, DatabaseErrorKind::UniqueViolation { .. }) {
                return Err(LedgerError::IdempotencyConflict {
                    transaction_id: record.id,
                });
            }
            return Err(err.into());
        }

        Self::store_balance(&mut tx, &balance).await?;
        tx.commit().await.map_err(db_err)?;

        info!(
            transaction_id = %record.id,
            user_id = %record.user_id,
            direction = %record.direction,
            amount = record.amount,
            status = %record.status,
            available = balance.available,
            "Ledger transaction applied"
        );

        Ok(ApplyOutcome {
            transaction: record,
            balance,
            duplicate: false,
        })
    }

    async fn get_balance(&self, user_id: &str) -> LedgerResult<Balance> {
        let row = sqlx::query_as::<_, BalanceRow>(
            "SELECT user_id, available, pending, lifetime_earned, lifetime_spent
             FROM ledger_balances WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(Balance::from).unwrap_or_else(|| Balance::empty(user_id)))
    }

    async fn resolve(&self, tx_id: &str, target: TransactionStatus) -> LedgerResult<ApplyOutcome> {
        let owner: Option<String> =
            sqlx::query_scalar("SELECT user_id FROM ledger_transactions WHERE id = $1")
                .bind(tx_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        let owner = owner.ok_or_else(|| LedgerError::TransactionNotFound {
            transaction_id: tx_id.to_string(),
        })?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut balance = Self::lock_balance(&mut tx, &owner).await?;
        let current = Self::fetch_transaction(&mut tx, tx_id, true)
            .await?
            .ok_or_else(|| LedgerError::TransactionNotFound {
                transaction_id: tx_id.to_string(),
            })?;

        if plan_resolution(&current, target)? == Resolution::AlreadyResolved {
            tx.commit().await.map_err(db_err)?;
            return Ok(ApplyOutcome {
                transaction: current,
                balance,
                duplicate: true,
            });
        }

        balance.resolve_pending(current.direction, current.amount, target)?;

        let completed_at = if target == TransactionStatus::Completed {
            Some(Utc::now())
        } else {
            current.completed_at
        };
        sqlx::query("UPDATE ledger_transactions SET status = $2, completed_at = $3 WHERE id = $1")
            .bind(tx_id)
            .bind(target.as_str())
            .bind(completed_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        Self::store_balance(&mut tx, &balance).await?;
        tx.commit().await.map_err(db_err)?;

        let record = LedgerTransaction {
            status: target,
            completed_at,
            ..current
        };
        info!(
            transaction_id = %record.id,
            user_id = %record.user_id,
            status = %record.status,
            "Pending ledger transaction resolved"
        );

        Ok(ApplyOutcome {
            transaction: record,
            balance,
            duplicate: false,
        })
    }

    async fn find_transaction(&self, tx_id: &str) -> LedgerResult<Option<LedgerTransaction>> {
        let sql = format!("SELECT {} FROM ledger_transactions WHERE id = $1", TRANSACTION_COLUMNS);
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(tx_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(LedgerTransaction::try_from)
            .transpose()
    }

    async fn transaction_log(&self, user_id: &str) -> LedgerResult<Vec<LedgerTransaction>> {
        let sql = format!(
            "SELECT {} FROM ledger_transactions WHERE user_id = $1 ORDER BY sequence ASC",
            TRANSACTION_COLUMNS
        );
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(LedgerTransaction::try_from)
            .collect()
    }

    async fn user_ids(&self) -> LedgerResult<Vec<String>> {
        sqlx::query_scalar("SELECT user_id FROM ledger_balances ORDER BY user_id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    /// Both reads run in one repeatable-read transaction so they share a snapshot.
    async fn snapshot(&self, user_id: &str) -> LedgerResult<LedgerSnapshot> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let balance = sqlx::query_as::<_, BalanceRow>(
            "SELECT user_id, available, pending, lifetime_earned, lifetime_spent
             FROM ledger_balances WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .map(Balance::from)
        .unwrap_or_else(|| Balance::empty(user_id));

        let sql = format!(
            "SELECT {} FROM ledger_transactions WHERE user_id = $1 ORDER BY sequence ASC",
            TRANSACTION_COLUMNS
        );
        let log = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(user_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(LedgerTransaction::try_from)
            .collect::<LedgerResult<Vec<_>>>()?;

        tx.commit().await.map_err(db_err)?;
        Ok(LedgerSnapshot { balance, log })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_conversion_rejects_unknown_status() {
        let row = TransactionRow {
            id: "tx-1".to_string(),
            user_id: "u1".to_string(),
            sequence: 1,
            direction: "credit".to_string(),
            amount: 10,
            source: "review".to_string(),
            status: "reversed".to_string(),
            created_at: Utc::now(),
            completed_at: None,
            metadata: serde_json::json!({}),
        };
        assert!(matches!(
            LedgerTransaction::try_from(row.clone()),
            Err(LedgerError::Validation(_))
        ));

        let ok = TransactionRow {
            status: "pending".to_string(),
            ..row
        };
        let tx = LedgerTransaction::try_from(ok).unwrap();
        assert_eq!(tx.source, TransactionSource::Review);
        assert_eq!(tx.status, TransactionStatus::Pending);
    }
}
