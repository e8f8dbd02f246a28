use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::info;

use crate::database::error::DatabaseError;
use crate::ledger::projection::resolution_key;
use crate::ledger::{LedgerError, LedgerResult, LedgerTransaction, MinorUnits, PointsProjection, ProjectionStore};

#[derive(Debug, Clone, FromRow)]
struct ProjectionRow {
    user_id: String,
    total: i64,
    events_observed: i64,
    updated_at: Option<DateTime<Utc>>,
}

impl From<ProjectionRow> for PointsProjection {
    fn from(row: ProjectionRow) -> Self {
        PointsProjection {
            user_id: row.user_id,
            total: row.total,
            events_observed: row.events_observed.max(0) as u64,
            updated_at: row.updated_at,
        }
    }
}

fn db_err(e: sqlx::Error) -> LedgerError {
    DatabaseError::from_sqlx(e).into()
}

/// Projection totals plus the event keys already counted into them.
pub struct PgProjectionStore {
    pool: PgPool,
}

impl PgProjectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProjectionStore for PgProjectionStore {
    async fn record(&self, user_id: &str, event_key: &str, delta: MinorUnits) -> LedgerResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let inserted = sqlx::query(
            "INSERT INTO points_projection_events (user_id, event_key, delta)
             VALUES ($1, $2, $3)
             ON CONFLICT (user_id, event_key) DO NOTHING",
        )
        .bind(user_id)
        .bind(event_key)
        .bind(delta)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if inserted.rows_affected() == 0 {
            tx.commit().await.map_err(db_err)?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO points_projections (user_id, total, events_observed, updated_at)
             VALUES ($1, $2, 1, NOW())
             ON CONFLICT (user_id) DO UPDATE
             SET total = points_projections.total + EXCLUDED.total,
                 events_observed = points_projections.events_observed + 1,
                 updated_at = NOW()",
        )
        .bind(user_id)
        .bind(delta)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn get(&self, user_id: &str) -> LedgerResult<PointsProjection> {
        let row = sqlx::query_as::<_, ProjectionRow>(
            "SELECT user_id, total, events_observed, updated_at FROM points_projections WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row
            .map(PointsProjection::from)
            .unwrap_or_else(|| PointsProjection::empty(user_id)))
    }

    async fn rebuild(&self, user_id: &str, log: &[LedgerTransaction]) -> LedgerResult<PointsProjection> {
        let projection = PointsProjection::from_log(user_id, log);
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("DELETE FROM points_projection_events WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        for entry in log.iter().filter(|entry| entry.user_id == user_id) {
            let mut keys = vec![entry.id.clone()];
            if entry.status.is_terminal() {
                keys.push(resolution_key(&entry.id, entry.status));
            }
            for key in keys {
                sqlx::query(
                    "INSERT INTO points_projection_events (user_id, event_key, delta)
                     VALUES ($1, $2, 0)
                     ON CONFLICT (user_id, event_key) DO NOTHING",
                )
                .bind(user_id)
                .bind(&key)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }

        sqlx::query(
            "INSERT INTO points_projections (user_id, total, events_observed, updated_at)
             VALUES ($1, $2, $3, NOW())
             ON CONFLICT (user_id) DO UPDATE
             SET total = EXCLUDED.total, events_observed = EXCLUDED.events_observed, updated_at = NOW()",
        )
        .bind(user_id)
        .bind(projection.total)
        .bind(projection.events_observed as i64)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        info!(user_id = %user_id, total = projection.total, "Points projection rebuilt from ledger log");
        Ok(projection)
    }
}
