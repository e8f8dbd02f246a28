use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::AppError;
use crate::middleware::error::with_request_id;
use crate::payments::types::PaymentMethodType;
use crate::services::payment_method_resolver::{PaymentMethodDescriptor, UserContext};

#[derive(Debug, Deserialize)]
pub struct PaymentMethodsQuery {
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub preferred_method: Option<PaymentMethodType>,
    #[serde(default)]
    pub last_used_method: Option<PaymentMethodType>,
}

#[derive(Debug, Serialize)]
pub struct PaymentMethodsResponse {
    pub methods: Vec<PaymentMethodDescriptor>,
    pub recommended: Option<PaymentMethodType>,
}

/// GET /api/v1/payment-methods?amount=..&currency=..
pub async fn list_payment_methods(
    State(state): State<AppState>,
    Query(params): Query<PaymentMethodsQuery>,
    headers: HeaderMap,
) -> Result<Json<PaymentMethodsResponse>, AppError> {
    let ctx = UserContext {
        user_id: params.user_id,
        preferred_method: params.preferred_method,
        last_used_method: params.last_used_method,
    };

    let methods = state
        .resolver
        .resolve(params.amount, &params.currency, &ctx)
        .map_err(|e| with_request_id(e, &headers))?;
    let recommended = state.resolver.recommend(&methods, &ctx).map(|m| m.method_type);

    Ok(Json(PaymentMethodsResponse {
        methods,
        recommended,
    }))
}
