// Maintenance scheduler - periodic upkeep for every merchant database
//
// Each cycle, per configured routing prefix:
// - expires open operations past their deadline
// - drains lots past their expiry with `expiry` entries
// - deletes terminal operations older than the retention window
// - pre-creates the ledger partitions for the coming months

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use crate::config::MaintenanceConfig;
use crate::error::AppResult;
use crate::ledger::{ExpirySummary, PartitionMonth};
use crate::service::{with_transaction, CreditLedger};

/// Lots drained per merchant per cycle; the rest wait for the next tick
const EXPIRY_BATCH_SIZE: i64 = 500;

/// What one cycle did for one merchant database
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub prefix: String,
    pub operations_expired: u64,
    pub lots_expired: u64,
    pub credits_expired: i64,
    pub operations_deleted: u64,
    pub partitions_created: u32,
}

pub struct MaintenanceScheduler {
    config: MaintenanceConfig,
    ledger: CreditLedger,
}

impl MaintenanceScheduler {
    pub fn new(config: MaintenanceConfig, ledger: CreditLedger) -> Self {
        Self { config, ledger }
    }

    /// Start the scheduler (runs in background)
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                "⏰ Maintenance scheduler started (every {}s)",
                self.config.interval_secs
            );

            loop {
                ticker.tick().await;
                self.run_cycle(Utc::now()).await;
            }
        })
    }

    /// One pass over every configured merchant database. Failures are logged per prefix
    /// and never stop the other prefixes.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Vec<MaintenanceReport> {
        let mut reports = Vec::new();

        for prefix in self.ledger.router().configured_prefixes() {
            match self.run_for_prefix(&prefix, now).await {
                Ok(report) => reports.push(report),
                Err(e) => error!("❌ Maintenance failed for {}: {}", prefix, e),
            }
        }

        reports
    }

    pub async fn run_for_prefix(&self, prefix: &str, now: DateTime<Utc>) -> AppResult<MaintenanceReport> {
        let pool = self.ledger.router().get_or_create(prefix)?;
        let lifecycle = *self.ledger.lifecycle();
        let lots = *self.ledger.lots();

        let mut report = MaintenanceReport {
            prefix: prefix.to_string(),
            ..Default::default()
        };

        report.operations_expired = with_transaction(&pool, move |tx| {
            Box::pin(async move { lifecycle.sweep_expired(tx, now).await })
        })
        .await?;

        let expiry: ExpirySummary = with_transaction(&pool, move |tx| {
            Box::pin(async move { lots.expire_lots(tx, now, EXPIRY_BATCH_SIZE).await })
        })
        .await?;
        report.lots_expired = expiry.lots_expired;
        report.credits_expired = expiry.credits_expired;

        if let Some(cutoff) = retention_cutoff(now, self.config.retention_days) {
            report.operations_deleted = with_transaction(&pool, move |tx| {
                Box::pin(async move { lifecycle.cleanup_terminal(tx, cutoff).await })
            })
            .await?;
        }

        for month in upcoming_months(now, self.config.partition_months_ahead) {
            let store = *lots.store();
            let created = with_transaction(&pool, move |tx| {
                Box::pin(async move { store.ensure_partition(tx, month).await })
            })
            .await?;
            if created {
                report.partitions_created += 1;
            }
        }

        info!(
            "✓ Maintenance for {}: {} operation(s) expired, {} lot(s) drained, {} operation(s) deleted",
            prefix, report.operations_expired, report.lots_expired, report.operations_deleted
        );

        Ok(report)
    }
}

/// Terminal operations closed before this instant are deleted. `None` keeps them forever.
pub fn retention_cutoff(now: DateTime<Utc>, retention_days: Option<i64>) -> Option<DateTime<Utc>> {
    retention_days
        .filter(|days| *days >= 0)
        .map(|days| now - ChronoDuration::days(days))
}

/// The current month followed by `ahead` further months
pub fn upcoming_months(now: DateTime<Utc>, ahead: u32) -> Vec<PartitionMonth> {
    let mut month = PartitionMonth::from_datetime(now);
    let mut months = vec![month];
    for _ in 0..ahead {
        month = month.next();
        months.push(month);
    }
    months
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_upcoming_months_cross_year() {
        let now = Utc.with_ymd_and_hms(2024, 11, 20, 3, 0, 0).unwrap();
        let months: Vec<String> = upcoming_months(now, 2).iter().map(|m| m.to_string()).collect();
        assert_eq!(months, vec!["2024-11", "2024-12", "2025-01"]);
    }

    #[test]
    fn test_upcoming_months_current_only() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(upcoming_months(now, 0).len(), 1);
    }

    #[test]
    fn test_retention_cutoff() {
        let now = Utc.with_ymd_and_hms(2024, 3, 31, 12, 0, 0).unwrap();
        assert_eq!(
            retention_cutoff(now, Some(90)),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap())
        );
        assert_eq!(retention_cutoff(now, None), None);
        assert_eq!(retention_cutoff(now, Some(-1)), None);
    }
}
