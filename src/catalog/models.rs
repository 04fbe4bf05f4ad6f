use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

use crate::ledger::CreditGrant;

/// Country code matching any country without its own price row
pub const ANY_COUNTRY: &str = "*";

/// One row of a product's price list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryPrice {
    pub country: String,
    pub currency: String,
    pub amount: Decimal,
    #[serde(default)]
    pub tax_rate: Decimal,
}

/// Price a buyer in a given country pays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPrice {
    pub currency: String,
    pub amount: Decimal,
    pub tax_rate: Decimal,
}

#[derive(Debug, Clone, FromRow)]
pub(super) struct ProductRow {
    pub product_code: String,
    pub title: String,
    pub credits: i64,
    pub access_period_days: i32,
    pub prices: Json<Vec<CountryPrice>>,
    pub effective_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

/// A purchasable credit package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub product_code: String,
    pub title: String,
    pub credits: i64,
    pub access_period_days: i64,
    pub prices: Vec<CountryPrice>,
    pub effective_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Self {
            product_code: row.product_code,
            title: row.title,
            credits: row.credits,
            access_period_days: i64::from(row.access_period_days),
            prices: row.prices.0,
            effective_at: row.effective_at,
            archived_at: row.archived_at,
        }
    }
}

impl Product {
    /// Sellable at `at`: already effective and not yet archived
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.effective_at <= at && self.archived_at.map_or(true, |archived| at < archived)
    }

    /// Exact country row first, then the wildcard row
    pub fn resolve_price(&self, country: &str) -> Option<ResolvedPrice> {
        let country = country.trim();
        let exact = self
            .prices
            .iter()
            .find(|p| p.country.eq_ignore_ascii_case(country));
        let chosen = exact.or_else(|| self.prices.iter().find(|p| p.country == ANY_COUNTRY))?;

        Some(ResolvedPrice {
            currency: chosen.currency.to_uppercase(),
            amount: chosen.amount,
            tax_rate: chosen.tax_rate,
        })
    }

    pub fn grant(&self) -> CreditGrant {
        CreditGrant {
            product_code: self.product_code.clone(),
            credits: self.credits,
            access_period_days: self.access_period_days,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn product() -> Product {
        Product {
            product_code: "CREDITS_1000".to_string(),
            title: "1000 credits".to_string(),
            credits: 1000,
            access_period_days: 30,
            prices: vec![
                CountryPrice {
                    country: "US".to_string(),
                    currency: "usd".to_string(),
                    amount: dec!(9.99),
                    tax_rate: dec!(0),
                },
                CountryPrice {
                    country: ANY_COUNTRY.to_string(),
                    currency: "EUR".to_string(),
                    amount: dec!(10.49),
                    tax_rate: dec!(0.21),
                },
            ],
            effective_at: Utc::now() - Duration::days(10),
            archived_at: None,
        }
    }

    #[test]
    fn test_exact_country_wins() {
        let price = product().resolve_price("us").unwrap();
        assert_eq!(price.currency, "USD");
        assert_eq!(price.amount, dec!(9.99));
    }

    #[test]
    fn test_wildcard_fallback() {
        let price = product().resolve_price("NL").unwrap();
        assert_eq!(price.currency, "EUR");
        assert_eq!(price.tax_rate, dec!(0.21));

        let mut us_only = product();
        us_only.prices.truncate(1);
        assert!(us_only.resolve_price("NL").is_none());
    }

    #[test]
    fn test_activity_window() {
        let now = Utc::now();
        let mut product = product();
        assert!(product.is_active_at(now));
        assert!(!product.is_active_at(now - Duration::days(11)));

        product.archived_at = Some(now - Duration::days(1));
        assert!(!product.is_active_at(now));
        assert!(product.is_active_at(now - Duration::days(2)));
    }

    #[test]
    fn test_prices_decode_from_string_amounts() {
        let prices: Vec<CountryPrice> = serde_json::from_str(
            r#"[{"country": "US", "currency": "USD", "amount": "9.99", "tax_rate": "0"}]"#,
        )
        .unwrap();
        assert_eq!(prices[0].amount, dec!(9.99));
    }
}
