use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use std::fmt;
use uuid::Uuid;

use crate::error::{AppError, AppResult, InvalidReason};

/// Why credits moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "entry_reason", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EntryReason {
    Purchase,
    Welcome,
    Promo,
    Adjustment,
    Debit,
    Expiry,
    Refund,
    Chargeback,
}

impl EntryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryReason::Purchase => "purchase",
            EntryReason::Welcome => "welcome",
            EntryReason::Promo => "promo",
            EntryReason::Adjustment => "adjustment",
            EntryReason::Debit => "debit",
            EntryReason::Expiry => "expiry",
            EntryReason::Refund => "refund",
            EntryReason::Chargeback => "chargeback",
        }
    }

    /// Reasons that open a new lot
    pub fn is_issuing(&self) -> bool {
        matches!(
            self,
            EntryReason::Purchase | EntryReason::Welcome | EntryReason::Promo | EntryReason::Adjustment
        )
    }
}

impl fmt::Display for EntryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decimal places kept by `NUMERIC(20, 6)` resource columns
pub const RESOURCE_SCALE: u32 = 6;

/// Measured usage must be non-negative and fit the stored precision exactly
pub fn check_resource_amount(resource_amount: Decimal) -> AppResult<()> {
    if resource_amount.is_sign_negative() && !resource_amount.is_zero() {
        return Err(AppError::invalid("resource_amount", InvalidReason::Negative));
    }
    if resource_amount.normalize().scale() > RESOURCE_SCALE {
        return Err(AppError::invalid("resource_amount", InvalidReason::OutOfRange));
    }
    Ok(())
}

/// Calendar month used as the ledger partition key, stored as its first day
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionMonth(NaiveDate);

impl PartitionMonth {
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self::from_date(at.date_naive())
    }

    pub fn from_date(date: NaiveDate) -> Self {
        // Day 1 exists in every month, so with_day(1) cannot fail.
        PartitionMonth(date.with_day(1).unwrap_or(date))
    }

    /// Accepts `YYYY-MM` or `YYYY-MM-01`
    pub fn parse(value: &str) -> AppResult<Self> {
        let malformed = || AppError::invalid("month", InvalidReason::MalformedPartitionMonth);
        let value = value.trim();

        let date = match value.len() {
            7 => NaiveDate::parse_from_str(&format!("{}-01", value), "%Y-%m-%d"),
            10 => NaiveDate::parse_from_str(value, "%Y-%m-%d"),
            _ => return Err(malformed()),
        }
        .map_err(|_| malformed())?;

        if date.day() != 1 {
            return Err(malformed());
        }
        Ok(PartitionMonth(date))
    }

    /// Reject a stored value that is not a month start
    pub fn from_stored(date: NaiveDate) -> AppResult<Self> {
        if date.day() != 1 {
            return Err(AppError::corruption("ledger_store"));
        }
        Ok(PartitionMonth(date))
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    pub fn next(&self) -> Self {
        let (year, month) = if self.0.month() == 12 {
            (self.0.year() + 1, 1)
        } else {
            (self.0.year(), self.0.month() + 1)
        };
        PartitionMonth(NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(self.0))
    }

    /// Name of the physical partition holding this month
    pub fn partition_table(&self) -> String {
        format!("ledger_entries_y{:04}m{:02}", self.0.year(), self.0.month())
    }
}

impl fmt::Display for PartitionMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.0.year(), self.0.month())
    }
}

/// Address of a lot: its opening entry id plus the month it was issued in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LotRef {
    pub lot_id: Uuid,
    pub lot_month: PartitionMonth,
}

/// Issuance context carried only by lot-opening entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issuance {
    pub product_code: String,
    pub expires_at: DateTime<Utc>,
}

/// Usage details attached to an entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryContext {
    pub operation_type: String,
    pub resource_amount: Option<Decimal>,
    pub resource_unit: Option<String>,
    pub workflow_id: Option<String>,
}

/// An entry about to be appended
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewLedgerEntry {
    pub entry_id: Uuid,
    pub user_id: String,
    pub lot_id: Uuid,
    pub lot_month: PartitionMonth,
    pub amount: i64,
    pub reason: EntryReason,
    pub operation_type: String,
    pub resource_amount: Option<Decimal>,
    pub resource_unit: Option<String>,
    pub workflow_id: Option<String>,
    pub product_code: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl NewLedgerEntry {
    /// Entry that opens a new lot; the lot takes the entry's own id and month
    pub fn lot_opening(
        user_id: &str,
        amount: i64,
        reason: EntryReason,
        issuance: Issuance,
        context: EntryContext,
        created_at: DateTime<Utc>,
    ) -> Self {
        let entry_id = Uuid::new_v4();
        Self {
            entry_id,
            user_id: user_id.to_string(),
            lot_id: entry_id,
            lot_month: PartitionMonth::from_datetime(created_at),
            amount,
            reason,
            operation_type: context.operation_type,
            resource_amount: context.resource_amount,
            resource_unit: context.resource_unit,
            workflow_id: context.workflow_id,
            product_code: Some(issuance.product_code),
            expires_at: Some(issuance.expires_at),
            created_at,
        }
    }

    /// Entry taking `magnitude` credits out of `target`
    pub fn consuming(
        user_id: &str,
        magnitude: i64,
        reason: EntryReason,
        target: LotRef,
        context: EntryContext,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            lot_id: target.lot_id,
            lot_month: target.lot_month,
            amount: -magnitude,
            reason,
            operation_type: context.operation_type,
            resource_amount: context.resource_amount,
            resource_unit: context.resource_unit,
            workflow_id: context.workflow_id,
            product_code: None,
            expires_at: None,
            created_at,
        }
    }

    pub fn created_month(&self) -> PartitionMonth {
        PartitionMonth::from_datetime(self.created_at)
    }

    pub fn is_lot_opening(&self) -> bool {
        self.amount > 0 && (self.product_code.is_some() || self.expires_at.is_some())
    }

    pub fn target(&self) -> LotRef {
        LotRef {
            lot_id: self.lot_id,
            lot_month: self.lot_month,
        }
    }

    /// Shape checks that need no storage
    pub fn validate(&self) -> AppResult<()> {
        if self.user_id.trim().is_empty() {
            return Err(AppError::invalid("user_id", InvalidReason::Empty));
        }
        if self.operation_type.trim().is_empty() {
            return Err(AppError::invalid("operation_type", InvalidReason::Empty));
        }
        if self.amount == 0 {
            return Err(AppError::invalid("amount", InvalidReason::NonPositive));
        }
        if self.lot_id.is_nil() {
            return Err(AppError::invalid("lot_id", InvalidReason::Empty));
        }
        if let Some(resource_amount) = self.resource_amount {
            check_resource_amount(resource_amount)?;
        }
        if let Some(workflow_id) = &self.workflow_id {
            if workflow_id.trim().is_empty() {
                return Err(AppError::invalid("workflow_id", InvalidReason::Empty));
            }
        }

        if self.amount > 0 {
            // Credits only enter through lot-opening entries.
            let (Some(product_code), Some(expires_at)) = (&self.product_code, self.expires_at) else {
                return Err(AppError::invalid("product_code", InvalidReason::ShapeViolation));
            };
            if product_code.trim().is_empty() {
                return Err(AppError::invalid("product_code", InvalidReason::Empty));
            }
            if self.lot_id != self.entry_id || self.lot_month != self.created_month() {
                return Err(AppError::invalid("lot_id", InvalidReason::ShapeViolation));
            }
            if expires_at <= self.created_at {
                return Err(AppError::invalid("expires_at", InvalidReason::OutOfRange));
            }
            if !self.reason.is_issuing() {
                return Err(AppError::invalid("reason", InvalidReason::UnsupportedReason));
            }
        } else {
            if self.product_code.is_some() || self.expires_at.is_some() {
                return Err(AppError::invalid("product_code", InvalidReason::ShapeViolation));
            }
            if self.reason.is_issuing() {
                return Err(AppError::invalid("reason", InvalidReason::UnsupportedReason));
            }
            if self.lot_id == self.entry_id {
                return Err(AppError::invalid("lot_id", InvalidReason::ShapeViolation));
            }
            if self.lot_month > self.created_month() {
                return Err(AppError::invalid("lot_month", InvalidReason::OutOfRange));
            }
        }

        Ok(())
    }
}

/// A persisted ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    pub user_id: String,
    pub lot_id: Uuid,
    pub lot_month: NaiveDate,
    pub amount: i64,
    pub reason: EntryReason,
    pub operation_type: String,
    #[serde(with = "rust_decimal::serde::str_option")]
    pub resource_amount: Option<Decimal>,
    pub resource_unit: Option<String>,
    pub workflow_id: Option<String>,
    pub product_code: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub created_month: NaiveDate,
}

impl LedgerEntry {
    /// Re-check entry shape and sign rules on data read back from storage
    pub fn check_stored_shape(&self) -> AppResult<()> {
        let carries_issuance = self.product_code.is_some() || self.expires_at.is_some();
        let shape_ok = if self.amount > 0 {
            carries_issuance && self.lot_id == self.entry_id && self.lot_month == self.created_month
        } else {
            self.amount < 0 && !carries_issuance
        };

        if !shape_ok {
            return Err(AppError::corruption("ledger_store"));
        }
        Ok(())
    }
}

/// A credit grant, derived from its opening entry plus everything referencing it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Lot {
    pub lot_id: Uuid,
    pub lot_month: NaiveDate,
    pub user_id: String,
    pub initial_amount: i64,
    pub current_balance: i64,
    pub product_code: String,
    pub reason: EntryReason,
    pub workflow_id: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_expired: bool,
}

impl Lot {
    pub fn lot_ref(&self) -> AppResult<LotRef> {
        Ok(LotRef {
            lot_id: self.lot_id,
            lot_month: PartitionMonth::from_stored(self.lot_month)?,
        })
    }

    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.expires_at > at && self.current_balance > 0
    }

    /// A lot can only shrink from its initial amount and never below zero
    pub fn check_invariants(&self) -> AppResult<()> {
        if self.initial_amount <= 0
            || self.current_balance < 0
            || self.current_balance > self.initial_amount
        {
            return Err(AppError::corruption("ledger_store"));
        }
        PartitionMonth::from_stored(self.lot_month)?;
        Ok(())
    }
}

/// Filters for a user's ledger history
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryOptions {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reasons: Vec<EntryReason>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl HistoryOptions {
    pub const DEFAULT_LIMIT: i64 = 50;
    pub const MAX_LIMIT: i64 = 500;

    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }

    pub fn validate(&self) -> AppResult<()> {
        if let Some(offset) = self.offset {
            if offset < 0 {
                return Err(AppError::invalid("offset", InvalidReason::Negative));
            }
        }
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from >= to {
                return Err(AppError::invalid("from", InvalidReason::OutOfRange));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub entries: Vec<LedgerEntry>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
}

/// Aggregate view of a user's credits
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSummary {
    pub user_id: String,
    pub month: Option<PartitionMonth>,
    pub total_credits: i64,
    pub total_debits: i64,
    pub balance: i64,
    pub entry_count: i64,
    pub total_lots: i64,
    pub active_lots: i64,
    pub expired_lots: i64,
    pub depleted_lots: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn opening(amount: i64, created_at: DateTime<Utc>) -> NewLedgerEntry {
        NewLedgerEntry::lot_opening(
            "user-1",
            amount,
            EntryReason::Purchase,
            Issuance {
                product_code: "CREDITS_1000".to_string(),
                expires_at: created_at + Duration::days(30),
            },
            EntryContext {
                operation_type: "purchase".to_string(),
                ..Default::default()
            },
            created_at,
        )
    }

    #[test]
    fn test_partition_month_parsing() {
        let month = PartitionMonth::parse("2025-03").unwrap();
        assert_eq!(month.to_string(), "2025-03");
        assert_eq!(PartitionMonth::parse("2025-03-01").unwrap(), month);

        for bad in ["2025-3", "2025-13", "2025-03-15", "march", ""] {
            assert!(
                matches!(
                    PartitionMonth::parse(bad),
                    Err(AppError::InvalidRequest {
                        reason: InvalidReason::MalformedPartitionMonth,
                        ..
                    })
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_partition_month_rollover() {
        let december = PartitionMonth::from_datetime(at(2024, 12, 31));
        assert_eq!(december.to_string(), "2024-12");
        assert_eq!(december.next().to_string(), "2025-01");
        assert_eq!(december.partition_table(), "ledger_entries_y2024m12");
    }

    #[test]
    fn test_lot_opening_identity() {
        let entry = opening(1000, at(2025, 3, 10));
        assert_eq!(entry.lot_id, entry.entry_id);
        assert_eq!(entry.lot_month, entry.created_month());
        assert!(entry.is_lot_opening());
        entry.validate().unwrap();
    }

    #[test]
    fn test_positive_entry_with_foreign_lot_is_rejected() {
        let mut entry = opening(1000, at(2025, 3, 10));
        entry.lot_id = Uuid::new_v4();
        assert!(matches!(
            entry.validate(),
            Err(AppError::InvalidRequest { reason: InvalidReason::ShapeViolation, .. })
        ));

        let mut entry = opening(1000, at(2025, 3, 10));
        entry.lot_month = PartitionMonth::parse("2025-02").unwrap();
        assert!(entry.validate().is_err());
    }

    #[test]
    fn test_positive_entry_without_issuance_is_rejected() {
        let mut entry = opening(1000, at(2025, 3, 10));
        entry.product_code = None;
        entry.expires_at = None;
        assert!(entry.validate().is_err());
    }

    #[test]
    fn test_debit_shape() {
        let lot = opening(1000, at(2025, 3, 10));
        let debit = NewLedgerEntry::consuming(
            "user-1",
            25,
            EntryReason::Debit,
            lot.target(),
            EntryContext {
                operation_type: "transcription".to_string(),
                resource_amount: Some(Decimal::from(1000)),
                resource_unit: Some("seconds".to_string()),
                workflow_id: Some("wf-1".to_string()),
            },
            at(2025, 4, 2),
        );
        assert_eq!(debit.amount, -25);
        assert_eq!(debit.lot_id, lot.entry_id);
        debit.validate().unwrap();

        let mut carrying = debit.clone();
        carrying.product_code = Some("CREDITS_1000".to_string());
        assert!(carrying.validate().is_err());

        let mut wrong_reason = debit.clone();
        wrong_reason.reason = EntryReason::Purchase;
        assert!(wrong_reason.validate().is_err());

        let mut zero = debit;
        zero.amount = 0;
        assert!(matches!(
            zero.validate(),
            Err(AppError::InvalidRequest { reason: InvalidReason::NonPositive, .. })
        ));
    }

    #[test]
    fn test_debit_cannot_reference_future_lot() {
        let lot = opening(1000, at(2025, 5, 1));
        let debit = NewLedgerEntry::consuming(
            "user-1",
            10,
            EntryReason::Debit,
            lot.target(),
            EntryContext {
                operation_type: "transcription".to_string(),
                ..Default::default()
            },
            at(2025, 4, 30),
        );
        assert!(debit.validate().is_err());
    }

    #[test]
    fn test_negative_resource_amount_rejected() {
        let mut entry = opening(10, at(2025, 3, 10));
        entry.resource_amount = Some(Decimal::from(-1));
        assert!(matches!(
            entry.validate(),
            Err(AppError::InvalidRequest { reason: InvalidReason::Negative, .. })
        ));
    }

    #[test]
    fn test_resource_amount_beyond_stored_precision_rejected() {
        let mut entry = opening(10, at(2025, 3, 10));
        entry.resource_amount = Some(Decimal::new(1_2345678, 7));
        assert!(matches!(
            entry.validate(),
            Err(AppError::InvalidRequest { reason: InvalidReason::OutOfRange, .. })
        ));

        // Trailing zeros do not count against the precision.
        entry.resource_amount = Some(Decimal::new(1_5000000, 7));
        assert!(entry.validate().is_ok());
        assert!(check_resource_amount(Decimal::new(123_456789, 6)).is_ok());
    }

    #[test]
    fn test_stored_shape_check() {
        let stored = LedgerEntry {
            entry_id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            lot_id: Uuid::new_v4(),
            lot_month: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            amount: 100,
            reason: EntryReason::Purchase,
            operation_type: "purchase".to_string(),
            resource_amount: None,
            resource_unit: None,
            workflow_id: None,
            product_code: Some("CREDITS_100".to_string()),
            expires_at: Some(at(2025, 4, 10)),
            created_at: at(2025, 3, 10),
            created_month: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
        };
        assert!(matches!(
            stored.check_stored_shape(),
            Err(AppError::ServiceUnavailable { .. })
        ));

        let fixed = LedgerEntry {
            lot_id: stored.entry_id,
            ..stored
        };
        fixed.check_stored_shape().unwrap();
    }

    #[test]
    fn test_lot_invariants() {
        let lot = Lot {
            lot_id: Uuid::new_v4(),
            lot_month: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            user_id: "user-1".to_string(),
            initial_amount: 100,
            current_balance: 40,
            product_code: "CREDITS_100".to_string(),
            reason: EntryReason::Purchase,
            workflow_id: None,
            issued_at: at(2025, 3, 10),
            expires_at: at(2025, 4, 9),
            is_expired: false,
        };
        lot.check_invariants().unwrap();
        assert!(lot.is_active_at(at(2025, 4, 1)));
        assert!(!lot.is_active_at(at(2025, 4, 10)));

        let overdrawn = Lot { current_balance: -1, ..lot.clone() };
        assert!(overdrawn.check_invariants().is_err());

        let inflated = Lot { current_balance: 101, ..lot };
        assert!(inflated.check_invariants().is_err());
    }

    #[test]
    fn test_history_limits() {
        let options = HistoryOptions::default();
        assert_eq!(options.effective_limit(), 50);

        let options = HistoryOptions { limit: Some(10_000), ..Default::default() };
        assert_eq!(options.effective_limit(), 500);

        let options = HistoryOptions { offset: Some(-1), ..Default::default() };
        assert!(options.validate().is_err());
    }
}
