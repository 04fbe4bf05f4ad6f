//! Administrative credit grants and refunds, idempotent by external reference.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, Transaction};
use tracing::info;

use crate::error::{AppError, AppResult, InsufficientBalanceReason, InvalidReason};
use crate::ledger::repository::advisory_xact_lock;
use crate::ledger::{
    CreditGrant, DebitRequest, EntryContext, EntryReason, LedgerEntry, Lot, LotConsumptionEngine,
    LotRef, PartitionMonth,
};

const GRANT_OPERATION: &str = "admin_grant";
const REFUND_OPERATION: &str = "admin_refund";

/// Credits handed out by an operator rather than bought
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminGrant {
    pub reason: EntryReason,
    pub credits: i64,
    pub access_period_days: i64,
    /// Label recorded as the lot's product code
    pub product_code: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AdminActions {
    lots: LotConsumptionEngine,
}

impl AdminActions {
    pub fn new(lots: LotConsumptionEngine) -> Self {
        Self { lots }
    }

    /// Issue a welcome, promo or adjustment lot
    pub async fn grant_credits(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
        grant: &AdminGrant,
        external_ref: &str,
        at: DateTime<Utc>,
    ) -> AppResult<Lot> {
        if !matches!(
            grant.reason,
            EntryReason::Welcome | EntryReason::Promo | EntryReason::Adjustment
        ) {
            return Err(AppError::invalid("reason", InvalidReason::UnsupportedReason));
        }
        let external_ref = require_ref(external_ref)?;
        advisory_xact_lock(tx, &format!("admin:{}", external_ref)).await?;

        let prior = self.prior_entries(tx, external_ref, GRANT_OPERATION).await?;
        if let Some(original) = prior.first() {
            if !grant_matches(original, user_id, grant) {
                return Err(duplicate("grant_credits", external_ref, original));
            }

            let target = LotRef {
                lot_id: original.lot_id,
                lot_month: PartitionMonth::from_stored(original.lot_month)?,
            };
            return self
                .lots
                .store()
                .get_lot(tx, user_id, target, at)
                .await?
                .ok_or_else(|| AppError::corruption("ledger_store"));
        }

        let lot = self
            .lots
            .create_credit_lot(
                tx,
                user_id,
                &CreditGrant {
                    product_code: grant.product_code.clone(),
                    credits: grant.credits,
                    access_period_days: grant.access_period_days,
                },
                grant.reason,
                EntryContext {
                    operation_type: GRANT_OPERATION.to_string(),
                    workflow_id: Some(external_ref.to_string()),
                    ..Default::default()
                },
                at,
            )
            .await?;

        info!(
            "🎁 {} grant of {} credits to {} ({})",
            grant.reason, grant.credits, user_id, external_ref
        );
        Ok(lot)
    }

    /// Remove whatever is left in a lot after a refund or chargeback
    pub async fn refund_lot(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
        target: LotRef,
        reason: EntryReason,
        external_ref: &str,
        at: DateTime<Utc>,
    ) -> AppResult<LedgerEntry> {
        if !matches!(reason, EntryReason::Refund | EntryReason::Chargeback) {
            return Err(AppError::invalid("reason", InvalidReason::UnsupportedReason));
        }
        let external_ref = require_ref(external_ref)?;
        advisory_xact_lock(tx, &format!("admin:{}", external_ref)).await?;

        let prior = self.prior_entries(tx, external_ref, REFUND_OPERATION).await?;
        if let Some(original) = prior.into_iter().next() {
            let same = original.user_id == user_id
                && original.lot_id == target.lot_id
                && original.lot_month == target.lot_month.date()
                && original.reason == reason;
            if !same {
                return Err(duplicate("refund_lot", external_ref, &original));
            }
            return Ok(original);
        }

        self.lots.store().lock_user(tx, user_id).await?;
        let lot = self
            .lots
            .store()
            .get_lot(tx, user_id, target, at)
            .await?
            .ok_or_else(|| AppError::invalid("lot_id", InvalidReason::NotFound))?;

        if lot.current_balance == 0 {
            return Err(AppError::InsufficientBalance {
                user_id: user_id.to_string(),
                current_balance: 0,
                reason: InsufficientBalanceReason::NegativeBalance,
            });
        }

        let entry = self
            .lots
            .record_debit(
                tx,
                user_id,
                &DebitRequest {
                    amount: lot.current_balance,
                    reason,
                    context: EntryContext {
                        operation_type: REFUND_OPERATION.to_string(),
                        workflow_id: Some(external_ref.to_string()),
                        ..Default::default()
                    },
                },
                target,
                at,
            )
            .await?;

        info!(
            "↩️ {} of lot {} for {}: {} credits removed",
            reason, target.lot_id, user_id, lot.current_balance
        );
        Ok(entry)
    }

    async fn prior_entries(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        external_ref: &str,
        operation_type: &str,
    ) -> AppResult<Vec<LedgerEntry>> {
        let entries = self.lots.store().entries_for_workflow(tx, external_ref).await?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.operation_type == operation_type)
            .collect())
    }
}

fn require_ref(external_ref: &str) -> AppResult<&str> {
    let trimmed = external_ref.trim();
    if trimmed.is_empty() {
        return Err(AppError::invalid("external_ref", InvalidReason::Empty));
    }
    Ok(trimmed)
}

fn grant_matches(original: &LedgerEntry, user_id: &str, grant: &AdminGrant) -> bool {
    original.user_id == user_id
        && original.reason == grant.reason
        && original.amount == grant.credits
        && original.product_code.as_deref() == Some(grant.product_code.as_str())
        && original.expires_at.map(|expires_at| expires_at - original.created_at)
            == Duration::try_days(grant.access_period_days)
}

fn duplicate(action_type: &str, external_ref: &str, original: &LedgerEntry) -> AppError {
    AppError::DuplicateAdminAction {
        action_type: action_type.to_string(),
        external_ref: external_ref.to_string(),
        original_timestamp: original.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn original_grant() -> LedgerEntry {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        LedgerEntry {
            entry_id: id,
            user_id: "user-1".to_string(),
            lot_id: id,
            lot_month: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            amount: 50,
            reason: EntryReason::Welcome,
            operation_type: GRANT_OPERATION.to_string(),
            resource_amount: None,
            resource_unit: None,
            workflow_id: Some("signup-user-1".to_string()),
            product_code: Some("WELCOME".to_string()),
            expires_at: Some(created_at + Duration::days(14)),
            created_at,
            created_month: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
        }
    }

    fn grant() -> AdminGrant {
        AdminGrant {
            reason: EntryReason::Welcome,
            credits: 50,
            access_period_days: 14,
            product_code: "WELCOME".to_string(),
        }
    }

    #[test]
    fn test_identical_grant_replay_matches() {
        assert!(grant_matches(&original_grant(), "user-1", &grant()));
    }

    #[test]
    fn test_grant_replay_with_different_payload() {
        let original = original_grant();
        assert!(!grant_matches(&original, "user-2", &grant()));
        assert!(!grant_matches(&original, "user-1", &AdminGrant { credits: 500, ..grant() }));
        assert!(!grant_matches(
            &original,
            "user-1",
            &AdminGrant { reason: EntryReason::Promo, ..grant() }
        ));
        assert!(!grant_matches(
            &original,
            "user-1",
            &AdminGrant { access_period_days: 365, ..grant() }
        ));

        match duplicate("grant_credits", "signup-user-1", &original) {
            AppError::DuplicateAdminAction { action_type, original_timestamp, .. } => {
                assert_eq!(action_type, "grant_credits");
                assert_eq!(original_timestamp, original.created_at);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_blank_reference_rejected() {
        assert!(require_ref("  ").is_err());
        assert_eq!(require_ref(" ref-1 ").unwrap(), "ref-1");
    }
}
