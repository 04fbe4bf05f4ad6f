use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::catalog::Product;
use crate::error::{AppError, AppResult, InvalidReason};
use crate::ledger::Lot;

/// Price the buyer was shown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingSnapshot {
    pub currency: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxBreakdown {
    pub net_amount: Decimal,
    pub tax_amount: Decimal,
    pub tax_rate: Decimal,
}

/// A completed payment to turn into credits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct SettlementRequest {
    #[validate(custom = "not_blank")]
    pub user_id: String,
    #[validate(custom = "not_blank")]
    pub product_code: String,
    /// Idempotency key, typically the payment provider's charge id
    #[validate(custom = "not_blank")]
    pub external_ref: String,
    #[validate(custom = "country_code")]
    pub country: String,
    pub order_placed_at: DateTime<Utc>,
    pub pricing: PricingSnapshot,
    pub tax_breakdown: Option<TaxBreakdown>,
}

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

/// Judged on the trimmed value, the same form rate lookups use.
fn country_code(value: &str) -> Result<(), ValidationError> {
    let code = value.trim();
    if code.is_empty() {
        return Err(ValidationError::new("blank"));
    }
    if code.len() > 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ValidationError::new("range"));
    }
    Ok(())
}

impl SettlementRequest {
    /// Field checks plus normalisation of codes that compare case-insensitively
    pub fn normalized(&self) -> AppResult<Self> {
        self.validate()?;

        if self.pricing.currency.trim().len() != 3 {
            return Err(AppError::invalid("pricing.currency", InvalidReason::OutOfRange));
        }
        if self.pricing.amount <= Decimal::ZERO {
            return Err(AppError::invalid("pricing.amount", InvalidReason::NonPositive));
        }
        if let Some(tax) = &self.tax_breakdown {
            if tax.net_amount < Decimal::ZERO || tax.tax_amount < Decimal::ZERO || tax.tax_rate < Decimal::ZERO {
                return Err(AppError::invalid("tax_breakdown", InvalidReason::Negative));
            }
        }

        let mut normalized = self.clone();
        normalized.user_id = self.user_id.trim().to_string();
        normalized.product_code = self.product_code.trim().to_string();
        normalized.external_ref = self.external_ref.trim().to_string();
        normalized.country = self.country.trim().to_uppercase();
        normalized.pricing.currency = self.pricing.currency.trim().to_uppercase();
        Ok(normalized)
    }
}

/// What was bought, frozen into the receipt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseSnapshot {
    pub user_id: String,
    pub product_code: String,
    pub product_title: String,
    pub credits: i64,
    pub access_period_days: i64,
    pub country: String,
    pub order_placed_at: DateTime<Utc>,
    pub pricing: PricingSnapshot,
    pub tax_breakdown: Option<TaxBreakdown>,
}

impl PurchaseSnapshot {
    pub fn capture(request: &SettlementRequest, product: &Product) -> Self {
        Self {
            user_id: request.user_id.clone(),
            product_code: product.product_code.clone(),
            product_title: product.title.clone(),
            credits: product.credits,
            access_period_days: product.access_period_days,
            country: request.country.clone(),
            order_placed_at: request.order_placed_at,
            pricing: request.pricing.clone(),
            tax_breakdown: request.tax_breakdown.clone(),
        }
    }

    /// Fields in which a replayed request disagrees with the settled one
    pub fn mismatches(&self, request: &SettlementRequest) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.user_id != request.user_id {
            fields.push("user_id");
        }
        if self.product_code != request.product_code {
            fields.push("product_code");
        }
        if self.pricing.currency != request.pricing.currency {
            fields.push("pricing.currency");
        }
        if self.pricing.amount != request.pricing.amount {
            fields.push("pricing.amount");
        }
        if self.tax_breakdown != request.tax_breakdown {
            fields.push("tax_breakdown");
        }
        fields
    }
}

/// Seller details printed on receipts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct MerchantConfig {
    pub legal_name: String,
    pub tax_id: Option<String>,
    pub receipt_series_prefix: String,
    pub billing_address: Option<String>,
    pub contact_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Receipt {
    pub receipt_id: Uuid,
    pub receipt_number: String,
    pub user_id: String,
    pub lot_id: Uuid,
    pub lot_created_month: NaiveDate,
    pub external_ref: String,
    pub purchase_snapshot: Json<PurchaseSnapshot>,
    pub merchant_snapshot: Json<MerchantConfig>,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementOutcome {
    pub lot: Lot,
    pub receipt: Receipt,
    /// True when an earlier settlement with the same reference was returned
    pub replayed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    pub(crate) fn request() -> SettlementRequest {
        SettlementRequest {
            user_id: "user-1".to_string(),
            product_code: "CREDITS_1000".to_string(),
            external_ref: "ch_3PXyz".to_string(),
            country: "us".to_string(),
            order_placed_at: Utc::now(),
            pricing: PricingSnapshot {
                currency: "usd".to_string(),
                amount: dec!(9.99),
            },
            tax_breakdown: None,
        }
    }

    fn snapshot(request: &SettlementRequest) -> PurchaseSnapshot {
        PurchaseSnapshot {
            user_id: request.user_id.clone(),
            product_code: request.product_code.clone(),
            product_title: "1000 credits".to_string(),
            credits: 1000,
            access_period_days: 30,
            country: request.country.clone(),
            order_placed_at: request.order_placed_at,
            pricing: request.pricing.clone(),
            tax_breakdown: None,
        }
    }

    #[test]
    fn test_normalization() {
        let normalized = request().normalized().unwrap();
        assert_eq!(normalized.country, "US");
        assert_eq!(normalized.pricing.currency, "USD");
    }

    #[test]
    fn test_blank_identifiers_rejected() {
        let mut blank_ref = request();
        blank_ref.external_ref = "   ".to_string();
        assert!(matches!(
            blank_ref.normalized(),
            Err(AppError::InvalidRequest { ref field, reason: InvalidReason::Empty, .. }) if field == "external_ref"
        ));

        let mut no_user = request();
        no_user.user_id = String::new();
        assert!(no_user.normalized().is_err());
    }

    #[test]
    fn test_country_checked_after_trimming() {
        let mut blank = request();
        blank.country = "  ".to_string();
        assert!(matches!(
            blank.normalized(),
            Err(AppError::InvalidRequest { ref field, reason: InvalidReason::Empty, .. }) if field == "country"
        ));

        let mut wildcard = request();
        wildcard.country = "*".to_string();
        assert!(matches!(
            wildcard.normalized(),
            Err(AppError::InvalidRequest { ref field, reason: InvalidReason::OutOfRange, .. }) if field == "country"
        ));

        let mut too_long = request();
        too_long.country = "USAX".to_string();
        assert!(too_long.normalized().is_err());

        let mut padded = request();
        padded.country = " de ".to_string();
        assert_eq!(padded.normalized().unwrap().country, "DE");
    }

    #[test]
    fn test_non_positive_price_rejected() {
        let mut free = request();
        free.pricing.amount = dec!(0);
        assert!(matches!(
            free.normalized(),
            Err(AppError::InvalidRequest { reason: InvalidReason::NonPositive, .. })
        ));
    }

    #[test]
    fn test_identical_replay_has_no_mismatch() {
        let request = request().normalized().unwrap();
        assert!(snapshot(&request).mismatches(&request).is_empty());

        // Equal amounts at different scales are the same price.
        let mut rescaled = request.clone();
        rescaled.pricing.amount = dec!(9.990);
        assert!(snapshot(&request).mismatches(&rescaled).is_empty());
    }

    #[test]
    fn test_replay_mismatch_lists_fields() {
        let request = request().normalized().unwrap();
        let stored = snapshot(&request);

        let mut changed = request.clone();
        changed.pricing.amount = dec!(19.99);
        changed.product_code = "CREDITS_5000".to_string();
        assert_eq!(stored.mismatches(&changed), vec!["product_code", "pricing.amount"]);

        let mut taxed = request;
        taxed.tax_breakdown = Some(TaxBreakdown {
            net_amount: dec!(8.26),
            tax_amount: dec!(1.73),
            tax_rate: dec!(0.21),
        });
        assert_eq!(stored.mismatches(&taxed), vec!["tax_breakdown"]);
    }
}
