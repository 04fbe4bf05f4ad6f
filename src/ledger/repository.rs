use super::models::*;
use crate::error::{AppError, AppResult, InvalidReason};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, Postgres, QueryBuilder, Transaction};
use tracing::{debug, info, warn};

/// Columns of a ledger entry row, in `LedgerEntry` field order
const ENTRY_COLUMNS: &str = "entry_id, user_id, lot_id, lot_month, amount, reason, operation_type, \
     resource_amount, resource_unit, workflow_id, product_code, expires_at, created_at, created_month";

/// Lot view: the opening entry joined with every entry sharing its `(lot_id, lot_month)`.
/// `$1` is always the evaluation time.
const LOT_SELECT: &str = r#"
    SELECT o.lot_id,
           o.lot_month,
           o.user_id,
           o.amount AS initial_amount,
           COALESCE(SUM(e.amount), 0)::BIGINT AS current_balance,
           o.product_code,
           o.reason,
           o.workflow_id,
           o.created_at AS issued_at,
           o.expires_at,
           (o.expires_at <= $1) AS is_expired
    FROM ledger_entries o
    JOIN ledger_entries e
      ON e.user_id = o.user_id
     AND e.lot_id = o.lot_id
     AND e.lot_month = o.lot_month
    WHERE o.amount > 0
"#;

const LOT_GROUP_BY: &str = r#"
    GROUP BY o.lot_id, o.lot_month, o.user_id, o.amount, o.product_code, o.reason,
             o.workflow_id, o.created_at, o.expires_at
"#;

#[derive(Debug, FromRow)]
struct EntryTotals {
    total_credits: i64,
    total_debits: i64,
    balance: i64,
    entry_count: i64,
}

#[derive(Debug, FromRow)]
struct LotCounts {
    total_lots: i64,
    active_lots: i64,
    expired_lots: i64,
    depleted_lots: i64,
}

/// Append-only ledger plus its read models.
///
/// Every method runs on the caller's transaction against one merchant database; the store
/// itself holds no connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerRepository;

impl LedgerRepository {
    pub fn new() -> Self {
        Self
    }

    // ========== WRITES ==========

    /// Validate and append one entry
    pub async fn append(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entry: &NewLedgerEntry,
    ) -> AppResult<LedgerEntry> {
        entry.validate()?;

        if entry.amount < 0 {
            self.require_lot_opening(tx, &entry.user_id, entry.target()).await?;
        }

        let inserted = sqlx::query_as::<_, LedgerEntry>(&format!(
            r#"
            INSERT INTO ledger_entries (
                entry_id, user_id, lot_id, lot_month, amount, reason, operation_type,
                resource_amount, resource_unit, workflow_id, product_code, expires_at,
                created_at, created_month
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {}
            "#,
            ENTRY_COLUMNS
        ))
        .bind(entry.entry_id)
        .bind(&entry.user_id)
        .bind(entry.lot_id)
        .bind(entry.lot_month.date())
        .bind(entry.amount)
        .bind(entry.reason)
        .bind(&entry.operation_type)
        .bind(entry.resource_amount)
        .bind(&entry.resource_unit)
        .bind(&entry.workflow_id)
        .bind(&entry.product_code)
        .bind(entry.expires_at)
        .bind(entry.created_at)
        .bind(entry.created_month().date())
        .fetch_one(&mut **tx)
        .await?;

        debug!(
            "Ledger entry {} appended: user={} lot={} amount={} reason={}",
            inserted.entry_id, inserted.user_id, inserted.lot_id, inserted.amount, inserted.reason
        );

        Ok(inserted)
    }

    /// Append several entries in the caller's transaction. Nothing is written unless every
    /// entry passes validation.
    pub async fn append_batch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entries: &[NewLedgerEntry],
    ) -> AppResult<Vec<LedgerEntry>> {
        for entry in entries {
            entry.validate()?;
        }

        let mut appended = Vec::with_capacity(entries.len());
        for entry in entries {
            appended.push(self.append(tx, entry).await?);
        }
        Ok(appended)
    }

    async fn require_lot_opening(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
        target: LotRef,
    ) -> AppResult<()> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM ledger_entries
                WHERE entry_id = $1 AND created_month = $2 AND user_id = $3 AND amount > 0
            )
            "#,
        )
        .bind(target.lot_id)
        .bind(target.lot_month.date())
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await?;

        if !exists {
            return Err(AppError::invalid("lot_id", InvalidReason::NotFound));
        }
        Ok(())
    }

    // ========== BALANCES ==========

    /// Sum of every entry the user owns, across all partitions
    pub async fn balance(&self, tx: &mut Transaction<'_, Postgres>, user_id: &str) -> AppResult<i64> {
        require_user(user_id)?;

        let balance: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM ledger_entries WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await?;

        if balance < 0 {
            return Err(AppError::corruption("ledger_store"));
        }
        Ok(balance)
    }

    pub async fn lot_balance(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        target: LotRef,
    ) -> AppResult<i64> {
        if target.lot_id.is_nil() {
            return Err(AppError::invalid("lot_id", InvalidReason::Empty));
        }

        let balance: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT
            FROM ledger_entries
            WHERE lot_id = $1 AND lot_month = $2
            "#,
        )
        .bind(target.lot_id)
        .bind(target.lot_month.date())
        .fetch_one(&mut **tx)
        .await?;

        if balance < 0 {
            return Err(AppError::corruption("ledger_store"));
        }
        Ok(balance)
    }

    // ========== LOTS ==========

    /// Unexpired lots with credit left, oldest issuance first
    pub async fn active_lots(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> AppResult<Vec<Lot>> {
        require_user(user_id)?;
        self.fetch_lots(
            tx,
            at,
            "AND o.user_id = $2 AND o.expires_at > $1",
            Some(user_id),
            None,
        )
        .await
    }

    /// Lots past their expiry that still hold credit, oldest issuance first
    pub async fn expired_lots(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> AppResult<Vec<Lot>> {
        require_user(user_id)?;
        self.fetch_lots(
            tx,
            at,
            "AND o.user_id = $2 AND o.expires_at <= $1",
            Some(user_id),
            None,
        )
        .await
    }

    pub async fn oldest_active_lot(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> AppResult<Option<Lot>> {
        require_user(user_id)?;
        let lots = self
            .fetch_lots(
                tx,
                at,
                "AND o.user_id = $2 AND o.expires_at > $1",
                Some(user_id),
                Some(1),
            )
            .await?;
        Ok(lots.into_iter().next())
    }

    /// Expired lots with credit left, across all users of this merchant
    pub async fn stranded_lots(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        at: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Lot>> {
        self.fetch_lots(tx, at, "AND o.expires_at <= $1", None, Some(limit))
            .await
    }

    /// A single lot, whatever its state
    pub async fn get_lot(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
        target: LotRef,
        at: DateTime<Utc>,
    ) -> AppResult<Option<Lot>> {
        let sql = format!(
            "{} AND o.user_id = $2 AND o.lot_id = $3 AND o.lot_month = $4 {}",
            LOT_SELECT, LOT_GROUP_BY
        );

        let lot = sqlx::query_as::<_, Lot>(&sql)
            .bind(at)
            .bind(user_id)
            .bind(target.lot_id)
            .bind(target.lot_month.date())
            .fetch_optional(&mut **tx)
            .await?;

        if let Some(lot) = &lot {
            lot.check_invariants()?;
        }
        Ok(lot)
    }

    async fn fetch_lots(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        at: DateTime<Utc>,
        filter: &str,
        user_id: Option<&str>,
        limit: Option<i64>,
    ) -> AppResult<Vec<Lot>> {
        let limit_clause = match (user_id, limit) {
            (Some(_), Some(_)) => "LIMIT $3",
            (None, Some(_)) => "LIMIT $2",
            _ => "",
        };
        let sql = format!(
            "{} {} {} HAVING COALESCE(SUM(e.amount), 0) > 0 ORDER BY o.created_at ASC, o.lot_id ASC {}",
            LOT_SELECT, filter, LOT_GROUP_BY, limit_clause
        );

        let mut query = sqlx::query_as::<_, Lot>(&sql).bind(at);
        if let Some(user_id) = user_id {
            query = query.bind(user_id);
        }
        if let Some(limit) = limit {
            query = query.bind(limit);
        }

        let lots = query.fetch_all(&mut **tx).await?;
        for lot in &lots {
            lot.check_invariants()?;
        }
        Ok(lots)
    }

    // ========== HISTORY & SUMMARY ==========

    /// Newest-first page of a user's entries
    pub async fn ledger_history(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
        options: &HistoryOptions,
    ) -> AppResult<HistoryPage> {
        require_user(user_id)?;
        options.validate()?;

        let limit = options.effective_limit();
        let offset = options.offset.unwrap_or(0);

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM ledger_entries WHERE ");
        push_history_filters(&mut count, user_id, options);
        let total: i64 = count.build_query_scalar().fetch_one(&mut **tx).await?;

        let mut page = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM ledger_entries WHERE ",
            ENTRY_COLUMNS
        ));
        push_history_filters(&mut page, user_id, options);
        page.push(" ORDER BY created_at DESC, entry_id DESC LIMIT ");
        page.push_bind(limit);
        page.push(" OFFSET ");
        page.push_bind(offset);

        let entries: Vec<LedgerEntry> = page.build_query_as().fetch_all(&mut **tx).await?;
        for entry in &entries {
            entry.check_stored_shape()?;
        }

        let has_more = offset + (entries.len() as i64) < total;
        Ok(HistoryPage {
            entries,
            total,
            limit,
            offset,
            has_more,
        })
    }

    /// Every entry written under a correlation id, oldest first
    pub async fn entries_for_workflow(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        workflow_id: &str,
    ) -> AppResult<Vec<LedgerEntry>> {
        let entries = sqlx::query_as::<_, LedgerEntry>(&format!(
            "SELECT {} FROM ledger_entries WHERE workflow_id = $1 ORDER BY created_at ASC, entry_id ASC",
            ENTRY_COLUMNS
        ))
        .bind(workflow_id)
        .fetch_all(&mut **tx)
        .await?;

        for entry in &entries {
            entry.check_stored_shape()?;
        }
        Ok(entries)
    }

    /// Totals and lot counts for a user, optionally for one partition month
    pub async fn user_summary(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
        month: Option<PartitionMonth>,
        at: DateTime<Utc>,
    ) -> AppResult<UserSummary> {
        require_user(user_id)?;
        let month_date: Option<NaiveDate> = month.map(|m| m.date());

        let totals = sqlx::query_as::<_, EntryTotals>(
            r#"
            SELECT COALESCE(SUM(amount) FILTER (WHERE amount > 0), 0)::BIGINT AS total_credits,
                   COALESCE(-SUM(amount) FILTER (WHERE amount < 0), 0)::BIGINT AS total_debits,
                   COALESCE(SUM(amount), 0)::BIGINT AS balance,
                   COUNT(*) AS entry_count
            FROM ledger_entries
            WHERE user_id = $1 AND ($2::DATE IS NULL OR created_month = $2)
            "#,
        )
        .bind(user_id)
        .bind(month_date)
        .fetch_one(&mut **tx)
        .await?;

        let counts = sqlx::query_as::<_, LotCounts>(
            r#"
            WITH lots AS (
                SELECT o.expires_at, COALESCE(SUM(e.amount), 0) AS balance
                FROM ledger_entries o
                JOIN ledger_entries e
                  ON e.user_id = o.user_id
                 AND e.lot_id = o.lot_id
                 AND e.lot_month = o.lot_month
                WHERE o.user_id = $1
                  AND o.amount > 0
                  AND ($2::DATE IS NULL OR o.created_month = $2)
                GROUP BY o.entry_id, o.created_month, o.expires_at
            )
            SELECT COUNT(*) AS total_lots,
                   COUNT(*) FILTER (WHERE balance > 0 AND expires_at > $3) AS active_lots,
                   COUNT(*) FILTER (WHERE expires_at <= $3) AS expired_lots,
                   COUNT(*) FILTER (WHERE balance = 0 AND expires_at > $3) AS depleted_lots
            FROM lots
            "#,
        )
        .bind(user_id)
        .bind(month_date)
        .bind(at)
        .fetch_one(&mut **tx)
        .await?;

        // Within one month a user's debits may exceed that month's credits; the
        // all-time balance may not.
        if month.is_none() && totals.balance < 0 {
            return Err(AppError::corruption("ledger_store"));
        }

        Ok(UserSummary {
            user_id: user_id.to_string(),
            month,
            total_credits: totals.total_credits,
            total_debits: totals.total_debits,
            balance: totals.balance,
            entry_count: totals.entry_count,
            total_lots: counts.total_lots,
            active_lots: counts.active_lots,
            expired_lots: counts.expired_lots,
            depleted_lots: counts.depleted_lots,
        })
    }

    // ========== PARTITIONS & LOCKS ==========

    /// Create the monthly partition if it does not exist yet. Returns true when created.
    pub async fn ensure_partition(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        month: PartitionMonth,
    ) -> AppResult<bool> {
        let table = month.partition_table();

        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(&table)
            .fetch_one(&mut **tx)
            .await?;
        if exists {
            return Ok(false);
        }

        // Postgres refuses to carve a range out of the default partition once it holds rows
        // for that range; those months stay in the default partition.
        let stranded: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM ledger_entries_default
                WHERE created_month >= $1 AND created_month < $2
            )
            "#,
        )
        .bind(month.date())
        .bind(month.next().date())
        .fetch_one(&mut **tx)
        .await?;
        if stranded {
            warn!(
                "Ledger partition {} not created: default partition already holds rows for {}",
                table, month
            );
            return Ok(false);
        }

        // The table name is built from a validated month, never from caller text.
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} PARTITION OF ledger_entries FOR VALUES FROM ('{}') TO ('{}')",
            table,
            month.date(),
            month.next().date()
        );
        sqlx::query(&ddl).execute(&mut **tx).await?;

        info!("📅 Created ledger partition {} for {}", table, month);
        Ok(true)
    }

    /// Serialise consuming writes for one user until the transaction ends
    pub async fn lock_user(&self, tx: &mut Transaction<'_, Postgres>, user_id: &str) -> AppResult<()> {
        require_user(user_id)?;
        advisory_xact_lock(tx, &format!("user:{}", user_id)).await
    }
}

/// Transaction-scoped advisory lock on an arbitrary key
pub async fn advisory_xact_lock(tx: &mut Transaction<'_, Postgres>, key: &str) -> AppResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(key)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn require_user(user_id: &str) -> AppResult<()> {
    if user_id.trim().is_empty() {
        return Err(AppError::invalid("user_id", InvalidReason::Empty));
    }
    Ok(())
}

fn push_history_filters(
    builder: &mut QueryBuilder<'_, Postgres>,
    user_id: &str,
    options: &HistoryOptions,
) {
    builder.push("user_id = ");
    builder.push_bind(user_id.to_string());

    if let Some(from) = options.from {
        builder.push(" AND created_at >= ");
        builder.push_bind(from);
    }
    if let Some(to) = options.to {
        builder.push(" AND created_at < ");
        builder.push_bind(to);
    }
    if !options.reasons.is_empty() {
        let reasons: Vec<String> = options.reasons.iter().map(|r| r.as_str().to_string()).collect();
        builder.push(" AND reason::TEXT = ANY(");
        builder.push_bind(reasons);
        builder.push(")");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_filters_sql() {
        let options = HistoryOptions {
            from: Some(Utc::now()),
            reasons: vec![EntryReason::Debit, EntryReason::Expiry],
            ..Default::default()
        };

        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM ledger_entries WHERE ");
        push_history_filters(&mut builder, "user-1", &options);

        assert_eq!(
            builder.sql(),
            "SELECT COUNT(*) FROM ledger_entries WHERE user_id = $1 AND created_at >= $2 AND reason::TEXT = ANY($3)"
        );
    }

    #[test]
    fn test_unfiltered_history_binds_only_user() {
        let mut builder = QueryBuilder::<Postgres>::new("");
        push_history_filters(&mut builder, "user-1", &HistoryOptions::default());
        assert_eq!(builder.sql(), "user_id = $1");
    }

    #[test]
    fn test_empty_user_rejected() {
        assert!(matches!(
            require_user("  "),
            Err(AppError::InvalidRequest { reason: InvalidReason::Empty, .. })
        ));
    }
}
