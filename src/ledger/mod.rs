//! Append-only credit ledger: entries, lots and FIFO consumption.

pub mod lots;
pub mod models;
pub mod repository;

pub use lots::{
    lot_expiry, CreditGrant, DebitRequest, ExpirySummary, LotConsumptionEngine,
    MAX_ACCESS_PERIOD_DAYS,
};
pub use models::{
    check_resource_amount, EntryContext, EntryReason, HistoryOptions, HistoryPage, LedgerEntry,
    Lot, LotRef, NewLedgerEntry, PartitionMonth, UserSummary,
};
pub use repository::LedgerRepository;
