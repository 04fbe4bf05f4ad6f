use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgConnection;

use super::models::*;
use crate::error::{AppError, AppResult, InvalidReason};
use crate::ledger::MAX_ACCESS_PERIOD_DAYS;

/// Product lookups the settlement flow depends on.
///
/// Implementations read from the same connection as the surrounding settlement so that a
/// product and the lot issued for it are seen consistently.
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn get_product_by_code(
        &self,
        conn: &mut PgConnection,
        product_code: &str,
    ) -> AppResult<Option<Product>>;

    async fn is_active(
        &self,
        conn: &mut PgConnection,
        product_code: &str,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        Ok(self
            .get_product_by_code(conn, product_code)
            .await?
            .map_or(false, |product| product.is_active_at(at)))
    }

    async fn resolved_price(
        &self,
        conn: &mut PgConnection,
        product_code: &str,
        country: &str,
    ) -> AppResult<Option<ResolvedPrice>> {
        Ok(self
            .get_product_by_code(conn, product_code)
            .await?
            .and_then(|product| product.resolve_price(country)))
    }
}

/// Catalog backed by the merchant's `products` table
#[derive(Debug, Clone, Copy, Default)]
pub struct PgProductCatalog;

impl PgProductCatalog {
    pub fn new() -> Self {
        Self
    }

    /// Insert or replace a product definition
    pub async fn upsert_product(&self, conn: &mut PgConnection, product: &Product) -> AppResult<()> {
        if product.product_code.trim().is_empty() {
            return Err(AppError::invalid("product_code", InvalidReason::Empty));
        }
        if product.credits <= 0 {
            return Err(AppError::invalid("credits", InvalidReason::NonPositive));
        }
        let access_period_days = stored_access_period(product.access_period_days)?;

        sqlx::query(
            r#"
            INSERT INTO products (product_code, title, credits, access_period_days, prices, effective_at, archived_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (product_code) DO UPDATE
            SET title = EXCLUDED.title,
                credits = EXCLUDED.credits,
                access_period_days = EXCLUDED.access_period_days,
                prices = EXCLUDED.prices,
                effective_at = EXCLUDED.effective_at,
                archived_at = EXCLUDED.archived_at
            "#,
        )
        .bind(&product.product_code)
        .bind(&product.title)
        .bind(product.credits)
        .bind(access_period_days)
        .bind(Json(&product.prices))
        .bind(product.effective_at)
        .bind(product.archived_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ProductCatalog for PgProductCatalog {
    async fn get_product_by_code(
        &self,
        conn: &mut PgConnection,
        product_code: &str,
    ) -> AppResult<Option<Product>> {
        let row = sqlx::query_as::<_, ProductRow>(
            r#"
            SELECT product_code, title, credits, access_period_days, prices, effective_at, archived_at
            FROM products
            WHERE product_code = $1
            "#,
        )
        .bind(product_code)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(row.map(Product::from))
    }
}

/// Access period as stored in `products.access_period_days`
fn stored_access_period(days: i64) -> AppResult<i32> {
    if days <= 0 {
        return Err(AppError::invalid("access_period_days", InvalidReason::NonPositive));
    }
    if days > MAX_ACCESS_PERIOD_DAYS {
        return Err(AppError::invalid("access_period_days", InvalidReason::OutOfRange));
    }
    i32::try_from(days).map_err(|_| AppError::invalid("access_period_days", InvalidReason::OutOfRange))
}
