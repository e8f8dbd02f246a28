use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::AppState;
use crate::error::AppError;
use crate::ledger::{Balance, LedgerTransaction, TransactionStatus};
use crate::middleware::error::with_request_id;
use crate::services::reconciliation::{ReconciliationState, SyncReport};

#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    /// Newest entries first, at most this many.
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub status: Option<TransactionStatus>,
}

#[derive(Debug, Serialize)]
pub struct TransactionsResponse {
    pub user_id: String,
    pub transactions: Vec<LedgerTransaction>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub report: SyncReport,
    pub state: ReconciliationState,
}

/// GET /api/v1/wallet/{user_id}/balance
pub async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Balance>, AppError> {
    info!(user_id = %user_id, "Balance request");
    let balance = state
        .ledger
        .get_balance(&user_id)
        .await
        .map_err(|e| with_request_id(e, &headers))?;
    Ok(Json(balance))
}

/// GET /api/v1/wallet/{user_id}/transactions
pub async fn get_transactions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<TransactionsQuery>,
    headers: HeaderMap,
) -> Result<Json<TransactionsResponse>, AppError> {
    let log = state
        .ledger
        .transaction_log(&user_id)
        .await
        .map_err(|e| with_request_id(e, &headers))?;

    let total = log.len();
    let mut transactions: Vec<LedgerTransaction> = log
        .into_iter()
        .rev()
        .filter(|tx| params.status.map_or(true, |s| tx.status == s))
        .collect();
    if let Some(limit) = params.limit {
        transactions.truncate(limit);
    }

    Ok(Json(TransactionsResponse {
        user_id,
        transactions,
        total,
    }))
}

/// GET /api/v1/wallet/{user_id}/sync
///
/// Runs one reconciliation check on demand and stores the updated history.
pub async fn check_sync(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SyncResponse>, AppError> {
    let previous = state
        .reconciliation_states
        .load(&user_id)
        .await
        .map_err(|e| with_request_id(e, &headers))?;
    let (report, next) = state
        .reconciliation
        .check_sync(&user_id, previous)
        .await
        .map_err(|e| with_request_id(e, &headers))?;
    state
        .reconciliation_states
        .save(&user_id, &next)
        .await
        .map_err(|e| with_request_id(e, &headers))?;

    info!(
        user_id = %user_id,
        in_sync = report.in_sync,
        difference = report.difference,
        "On-demand sync check"
    );
    Ok(Json(SyncResponse {
        report,
        state: next,
    }))
}
