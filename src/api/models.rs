use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub configured_prefixes: usize,
    pub cached_pools: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct MerchantHealthResponse {
    pub status: String,
    pub prefix: String,
    pub timestamp: DateTime<Utc>,
}
