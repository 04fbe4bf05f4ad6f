use chrono::{DateTime, Datelike, Utc};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::models::*;
use crate::error::{violated_constraint, AppError, AppResult, InvalidReason, ServiceUnavailableReason};
use crate::ledger::{Lot, LotRef};

const RECEIPT_COLUMNS: &str = "receipt_id, receipt_number, user_id, lot_id, lot_created_month, external_ref, \
     purchase_snapshot, merchant_snapshot, issued_at";

/// `PREFIX-YEAR-NNNN`; the counter widens past four digits rather than wrapping
pub fn format_receipt_number(prefix: &str, year: i32, sequence: i64) -> String {
    format!("{}-{}-{:04}", prefix, year, sequence)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiptRepository;

impl ReceiptRepository {
    pub fn new() -> Self {
        Self
    }

    // ========== MERCHANT CONFIG ==========

    pub async fn get_merchant_config(
        &self,
        tx: &mut Transaction<'_, Postgres>,
    ) -> AppResult<Option<MerchantConfig>> {
        let config = sqlx::query_as::<_, MerchantConfig>(
            r#"
            SELECT legal_name, tax_id, receipt_series_prefix, billing_address, contact_email
            FROM merchant_config
            WHERE id
            "#,
        )
        .fetch_optional(&mut **tx)
        .await?;

        Ok(config)
    }

    pub async fn require_merchant_config(
        &self,
        tx: &mut Transaction<'_, Postgres>,
    ) -> AppResult<MerchantConfig> {
        self.get_merchant_config(tx)
            .await?
            .ok_or_else(|| AppError::invalid("merchant_config", InvalidReason::NotConfigured))
    }

    pub async fn upsert_merchant_config(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        config: &MerchantConfig,
    ) -> AppResult<()> {
        if config.legal_name.trim().is_empty() {
            return Err(AppError::invalid("legal_name", InvalidReason::Empty));
        }
        if config.receipt_series_prefix.trim().is_empty() {
            return Err(AppError::invalid("receipt_series_prefix", InvalidReason::Empty));
        }

        sqlx::query(
            r#"
            INSERT INTO merchant_config (id, legal_name, tax_id, receipt_series_prefix, billing_address, contact_email)
            VALUES (TRUE, $1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET legal_name = EXCLUDED.legal_name,
                tax_id = EXCLUDED.tax_id,
                receipt_series_prefix = EXCLUDED.receipt_series_prefix,
                billing_address = EXCLUDED.billing_address,
                contact_email = EXCLUDED.contact_email,
                updated_at = NOW()
            "#,
        )
        .bind(&config.legal_name)
        .bind(&config.tax_id)
        .bind(config.receipt_series_prefix.trim())
        .bind(&config.billing_address)
        .bind(&config.contact_email)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    // ========== SEQUENCES ==========

    /// Next number in the `(prefix, year)` series. The row lock taken by the upsert holds
    /// until commit, so concurrent settlements queue here instead of sharing a number.
    pub async fn next_sequence(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        prefix: &str,
        year: i32,
    ) -> AppResult<i64> {
        let value: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO receipt_sequences (prefix, year, last_value)
            VALUES ($1, $2, 1)
            ON CONFLICT (prefix, year) DO UPDATE
            SET last_value = receipt_sequences.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(prefix)
        .bind(year)
        .fetch_one(&mut **tx)
        .await?;

        Ok(value)
    }

    // ========== RECEIPTS ==========

    pub async fn find_by_external_ref(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        external_ref: &str,
    ) -> AppResult<Option<Receipt>> {
        let receipt = sqlx::query_as::<_, Receipt>(&format!(
            "SELECT {} FROM receipts WHERE external_ref = $1",
            RECEIPT_COLUMNS
        ))
        .bind(external_ref)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(receipt)
    }

    pub async fn find_by_lot(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        target: LotRef,
    ) -> AppResult<Option<Receipt>> {
        let receipt = sqlx::query_as::<_, Receipt>(&format!(
            "SELECT {} FROM receipts WHERE lot_id = $1 AND lot_created_month = $2",
            RECEIPT_COLUMNS
        ))
        .bind(target.lot_id)
        .bind(target.lot_month.date())
        .fetch_optional(&mut **tx)
        .await?;

        Ok(receipt)
    }

    /// Number and write the receipt for a freshly issued purchase lot
    pub async fn issue(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        lot: &Lot,
        external_ref: &str,
        purchase: PurchaseSnapshot,
        merchant: MerchantConfig,
        issued_at: DateTime<Utc>,
    ) -> AppResult<Receipt> {
        let year = issued_at.year();
        let sequence = self
            .next_sequence(tx, &merchant.receipt_series_prefix, year)
            .await?;
        let receipt_number = format_receipt_number(&merchant.receipt_series_prefix, year, sequence);

        let result = sqlx::query_as::<_, Receipt>(&format!(
            r#"
            INSERT INTO receipts (
                receipt_id, receipt_number, user_id, lot_id, lot_created_month, external_ref,
                purchase_snapshot, merchant_snapshot, issued_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            RECEIPT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&receipt_number)
        .bind(&lot.user_id)
        .bind(lot.lot_id)
        .bind(lot.lot_month)
        .bind(external_ref)
        .bind(Json(purchase))
        .bind(Json(merchant))
        .bind(issued_at)
        .fetch_one(&mut **tx)
        .await;

        match result {
            Ok(receipt) => Ok(receipt),
            Err(e) if violated_constraint(&e) == Some("receipts_external_ref_key") => {
                Err(AppError::ServiceUnavailable {
                    service: "settlement".to_string(),
                    reason: ServiceUnavailableReason::ConcurrentUpdate,
                    retry_after_seconds: Some(1),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_number_format() {
        assert_eq!(format_receipt_number("ACME", 2025, 1), "ACME-2025-0001");
        assert_eq!(format_receipt_number("ACME", 2025, 42), "ACME-2025-0042");
        assert_eq!(format_receipt_number("ACME", 2025, 12345), "ACME-2025-12345");
    }
}
