use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use tracing::debug;

use super::models::*;
use crate::error::AppResult;
use crate::service::CreditLedger;

#[derive(Clone)]
pub struct AppState {
    pub ledger: CreditLedger,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let router = state.ledger.router();

    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
        configured_prefixes: router.configured_prefixes().len(),
        cached_pools: router.cached_prefixes(),
    })
}

/// GET /health/merchants/:merchant_id - round-trips a query through the merchant's pool
pub async fn merchant_health(
    State(state): State<AppState>,
    Path(merchant_id): Path<String>,
) -> AppResult<Json<MerchantHealthResponse>> {
    let router = state.ledger.router();
    let prefix = router.prefix_for(&merchant_id)?;
    let pool = router.get_or_create(&prefix)?;

    sqlx::query("SELECT 1").execute(&pool).await?;
    debug!("Merchant database {} reachable", prefix);

    Ok(Json(MerchantHealthResponse {
        status: "healthy".to_string(),
        prefix,
        timestamp: Utc::now(),
    }))
}
