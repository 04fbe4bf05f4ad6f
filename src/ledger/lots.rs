use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, Transaction};
use tracing::{debug, info};

use super::models::*;
use super::repository::LedgerRepository;
use crate::error::{AppError, AppResult, InsufficientBalanceReason, InvalidReason};

/// What a new lot is issued for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditGrant {
    pub product_code: String,
    pub credits: i64,
    pub access_period_days: i64,
}

/// Credits to take out of the ledger and why
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebitRequest {
    /// Magnitude, always positive
    pub amount: i64,
    pub reason: EntryReason,
    pub context: EntryContext,
}

/// One step of a FIFO consumption plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LotDraw {
    pub lot: LotRef,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpirySummary {
    pub lots_expired: u64,
    pub credits_expired: i64,
}

/// Issues lots and consumes them oldest-first
#[derive(Debug, Clone, Copy, Default)]
pub struct LotConsumptionEngine {
    store: LedgerRepository,
}

impl LotConsumptionEngine {
    pub fn new(store: LedgerRepository) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &LedgerRepository {
        &self.store
    }

    /// Open a lot for `grant.credits`, expiring `access_period_days` after `created_at`
    pub async fn create_credit_lot(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
        grant: &CreditGrant,
        reason: EntryReason,
        context: EntryContext,
        created_at: DateTime<Utc>,
    ) -> AppResult<Lot> {
        if user_id.trim().is_empty() {
            return Err(AppError::invalid("user_id", InvalidReason::Empty));
        }
        if grant.credits <= 0 {
            return Err(AppError::invalid("credits", InvalidReason::NonPositive));
        }
        if !reason.is_issuing() {
            return Err(AppError::invalid("reason", InvalidReason::UnsupportedReason));
        }

        // Postgres keeps microseconds; derive the expiry from what will be stored.
        let created_at = created_at.trunc_subsecs(6);
        let expires_at = lot_expiry(created_at, grant.access_period_days)?;
        let entry = NewLedgerEntry::lot_opening(
            user_id,
            grant.credits,
            reason,
            Issuance {
                product_code: grant.product_code.clone(),
                expires_at,
            },
            context,
            created_at,
        );

        let opening = self.store.append(tx, &entry).await?;

        info!(
            "💳 Lot {} issued to {}: {} credits ({}) until {}",
            opening.lot_id, user_id, grant.credits, reason, expires_at
        );

        let (Some(product_code), Some(stored_expiry)) = (opening.product_code, opening.expires_at)
        else {
            return Err(AppError::corruption("ledger_store"));
        };

        Ok(Lot {
            lot_id: opening.lot_id,
            lot_month: opening.lot_month,
            user_id: opening.user_id,
            initial_amount: opening.amount,
            current_balance: opening.amount,
            product_code,
            reason: opening.reason,
            workflow_id: opening.workflow_id,
            issued_at: opening.created_at,
            expires_at: stored_expiry,
            is_expired: stored_expiry <= opening.created_at,
        })
    }

    /// Take `debit.amount` credits out of one specific lot
    pub async fn record_debit(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
        debit: &DebitRequest,
        target: LotRef,
        at: DateTime<Utc>,
    ) -> AppResult<LedgerEntry> {
        validate_debit(user_id, debit)?;
        if target.lot_id.is_nil() {
            return Err(AppError::invalid("lot_id", InvalidReason::Empty));
        }

        let lot = self
            .store
            .get_lot(tx, user_id, target, at)
            .await?
            .ok_or_else(|| AppError::invalid("lot_id", InvalidReason::NotFound))?;

        if lot.current_balance < debit.amount {
            return Err(AppError::InsufficientBalance {
                user_id: user_id.to_string(),
                current_balance: lot.current_balance,
                reason: InsufficientBalanceReason::NegativeBalance,
            });
        }

        let entry = NewLedgerEntry::consuming(
            user_id,
            debit.amount,
            debit.reason,
            target,
            debit.context.clone(),
            at,
        );
        self.store.append(tx, &entry).await
    }

    /// Smallest oldest-first run of active lots covering `required_credits`. Writes nothing.
    pub async fn select_fifo_lots(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
        required_credits: i64,
        at: DateTime<Utc>,
    ) -> AppResult<Vec<Lot>> {
        if user_id.trim().is_empty() {
            return Err(AppError::invalid("user_id", InvalidReason::Empty));
        }
        if required_credits <= 0 {
            return Err(AppError::invalid("required_credits", InvalidReason::NonPositive));
        }

        let mut lots = self.store.active_lots(tx, user_id, at).await?;
        let len = fifo_prefix_len(&lots, required_credits).map_err(|available| {
            AppError::InsufficientBalance {
                user_id: user_id.to_string(),
                current_balance: available,
                reason: if lots.is_empty() {
                    InsufficientBalanceReason::NoActiveLots
                } else {
                    InsufficientBalanceReason::NegativeBalance
                },
            }
        })?;

        lots.truncate(len);
        Ok(lots)
    }

    /// Debit `debit.amount` across the user's lots oldest-first, one entry per lot touched
    pub async fn consume_fifo(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
        debit: &DebitRequest,
        at: DateTime<Utc>,
    ) -> AppResult<Vec<LedgerEntry>> {
        validate_debit(user_id, debit)?;
        self.store.lock_user(tx, user_id).await?;

        let lots = self.select_fifo_lots(tx, user_id, debit.amount, at).await?;
        let mut entries = Vec::new();
        for draw in plan_fifo_draws(&lots, debit.amount)? {
            let entry = NewLedgerEntry::consuming(
                user_id,
                draw.amount,
                debit.reason,
                draw.lot,
                debit.context.clone(),
                at,
            );
            entries.push(entry);
        }

        let written = self.store.append_batch(tx, &entries).await?;
        debug!(
            "Consumed {} credits from {} lot(s) for {}",
            debit.amount,
            written.len(),
            user_id
        );
        Ok(written)
    }

    /// Drain every lot past its expiry that still holds credit, up to `batch_size` lots
    pub async fn expire_lots(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        at: DateTime<Utc>,
        batch_size: i64,
    ) -> AppResult<ExpirySummary> {
        let stranded = self.store.stranded_lots(tx, at, batch_size).await?;
        let mut summary = ExpirySummary::default();

        for lot in stranded {
            let target = lot.lot_ref()?;
            self.store.lock_user(tx, &lot.user_id).await?;

            // Re-read under the user lock; a refund may have landed since the scan.
            let remaining = self.store.lot_balance(tx, target).await?;
            if remaining <= 0 {
                continue;
            }

            let entry = NewLedgerEntry::consuming(
                &lot.user_id,
                remaining,
                EntryReason::Expiry,
                target,
                EntryContext {
                    operation_type: "expiry".to_string(),
                    workflow_id: lot.workflow_id.clone(),
                    ..Default::default()
                },
                at,
            );
            self.store.append(tx, &entry).await?;

            summary.lots_expired += 1;
            summary.credits_expired += remaining;
        }

        if summary.lots_expired > 0 {
            info!(
                "⌛ Expired {} lot(s), {} credits",
                summary.lots_expired, summary.credits_expired
            );
        }
        Ok(summary)
    }
}

/// Longest access period a lot may be issued with
pub const MAX_ACCESS_PERIOD_DAYS: i64 = 36_500;

/// When a lot issued at `issued_at` for `access_period_days` stops being spendable
pub fn lot_expiry(issued_at: DateTime<Utc>, access_period_days: i64) -> AppResult<DateTime<Utc>> {
    if access_period_days <= 0 {
        return Err(AppError::invalid("access_period_days", InvalidReason::NonPositive));
    }
    if access_period_days > MAX_ACCESS_PERIOD_DAYS {
        return Err(AppError::invalid("access_period_days", InvalidReason::OutOfRange));
    }

    Duration::try_days(access_period_days)
        .and_then(|period| issued_at.checked_add_signed(period))
        .ok_or_else(|| AppError::invalid("access_period_days", InvalidReason::OutOfRange))
}

fn validate_debit(user_id: &str, debit: &DebitRequest) -> AppResult<()> {
    if user_id.trim().is_empty() {
        return Err(AppError::invalid("user_id", InvalidReason::Empty));
    }
    if debit.amount <= 0 {
        return Err(AppError::invalid("amount", InvalidReason::NonPositive));
    }
    if debit.reason.is_issuing() {
        return Err(AppError::invalid("reason", InvalidReason::UnsupportedReason));
    }
    if debit.context.operation_type.trim().is_empty() {
        return Err(AppError::invalid("operation_type", InvalidReason::Empty));
    }
    Ok(())
}

/// Length of the shortest prefix of `lots` whose balances reach `required`.
/// On shortfall returns the total available instead.
pub fn fifo_prefix_len(lots: &[Lot], required: i64) -> Result<usize, i64> {
    let mut covered = 0i64;
    for (index, lot) in lots.iter().enumerate() {
        covered += lot.current_balance;
        if covered >= required {
            return Ok(index + 1);
        }
    }
    Err(covered)
}

/// Split `required` across a FIFO prefix, draining each lot before moving to the next
pub fn plan_fifo_draws(lots: &[Lot], required: i64) -> AppResult<Vec<LotDraw>> {
    let mut remaining = required;
    let mut draws = Vec::with_capacity(lots.len());

    for lot in lots {
        if remaining == 0 {
            break;
        }
        let amount = remaining.min(lot.current_balance);
        if amount <= 0 {
            continue;
        }
        draws.push(LotDraw {
            lot: lot.lot_ref()?,
            amount,
        });
        remaining -= amount;
    }

    if remaining > 0 {
        return Err(AppError::corruption("ledger_store"));
    }
    Ok(draws)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use uuid::Uuid;

    fn lot(balance: i64, issued_day: u32) -> Lot {
        let issued_at = Utc.with_ymd_and_hms(2025, 3, issued_day, 9, 0, 0).unwrap();
        Lot {
            lot_id: Uuid::new_v4(),
            lot_month: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            user_id: "user-1".to_string(),
            initial_amount: balance.max(100),
            current_balance: balance,
            product_code: "CREDITS_100".to_string(),
            reason: EntryReason::Purchase,
            workflow_id: None,
            issued_at,
            expires_at: issued_at + Duration::days(30),
            is_expired: false,
        }
    }

    #[test]
    fn test_fifo_spans_two_lots_oldest_first() {
        let lots = vec![lot(75, 1), lot(50, 2)];
        assert_eq!(fifo_prefix_len(&lots, 100), Ok(2));

        let draws = plan_fifo_draws(&lots[..2], 100).unwrap();
        assert_eq!(draws.len(), 2);
        assert_eq!(draws[0].lot.lot_id, lots[0].lot_id);
        assert_eq!(draws[0].amount, 75);
        assert_eq!(draws[1].lot.lot_id, lots[1].lot_id);
        assert_eq!(draws[1].amount, 25);
    }

    #[test]
    fn test_fifo_minimal_prefix() {
        let lots = vec![lot(75, 1), lot(50, 2), lot(500, 3)];
        assert_eq!(fifo_prefix_len(&lots, 75), Ok(1));
        assert_eq!(fifo_prefix_len(&lots, 1), Ok(1));
        assert_eq!(fifo_prefix_len(&lots, 125), Ok(2));
        assert_eq!(fifo_prefix_len(&lots, 126), Ok(3));
    }

    #[test]
    fn test_fifo_shortfall_reports_available() {
        let lots = vec![lot(75, 1), lot(50, 2)];
        assert_eq!(fifo_prefix_len(&lots, 126), Err(125));
        assert_eq!(fifo_prefix_len(&[], 1), Err(0));
    }

    #[test]
    fn test_draws_never_exceed_lot_balance() {
        let lots = vec![lot(10, 1), lot(10, 2), lot(10, 3)];
        let draws = plan_fifo_draws(&lots, 25).unwrap();
        let amounts: Vec<i64> = draws.iter().map(|d| d.amount).collect();
        assert_eq!(amounts, vec![10, 10, 5]);
        assert_eq!(amounts.iter().sum::<i64>(), 25);
    }

    #[test]
    fn test_draws_on_short_prefix_is_corruption() {
        let lots = vec![lot(10, 1)];
        assert!(matches!(
            plan_fifo_draws(&lots, 11),
            Err(AppError::ServiceUnavailable { .. })
        ));
    }

    #[test]
    fn test_lot_expiry_bounds() {
        let issued_at = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        assert_eq!(
            lot_expiry(issued_at, 30).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 31, 9, 0, 0).unwrap()
        );

        for days in [0, -5] {
            assert!(matches!(
                lot_expiry(issued_at, days),
                Err(AppError::InvalidRequest { reason: InvalidReason::NonPositive, .. })
            ));
        }
        for days in [MAX_ACCESS_PERIOD_DAYS + 1, 1_000_000_000, i64::MAX] {
            assert!(matches!(
                lot_expiry(issued_at, days),
                Err(AppError::InvalidRequest { reason: InvalidReason::OutOfRange, .. })
            ));
        }
    }

    #[test]
    fn test_lot_expiry_keeps_microsecond_period() {
        let issued_at = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
            + Duration::nanoseconds(75_596_853);
        let stored = issued_at.trunc_subsecs(6);
        let expires_at = lot_expiry(stored, 30).unwrap();
        assert_eq!(expires_at.trunc_subsecs(6), expires_at);
        assert_eq!(expires_at - stored, Duration::days(30));
    }

    #[test]
    fn test_debit_validation() {
        let debit = DebitRequest {
            amount: 25,
            reason: EntryReason::Debit,
            context: EntryContext {
                operation_type: "transcription".to_string(),
                ..Default::default()
            },
        };
        validate_debit("user-1", &debit).unwrap();

        assert!(validate_debit("", &debit).is_err());
        assert!(validate_debit("user-1", &DebitRequest { amount: 0, ..debit.clone() }).is_err());
        assert!(validate_debit(
            "user-1",
            &DebitRequest {
                reason: EntryReason::Promo,
                ..debit
            }
        )
        .is_err());
    }
}
