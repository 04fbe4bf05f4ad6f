//! Multi-tenant prepaid credit ledger.
//!
//! Credits are issued as lots, consumed oldest-first, metered through two-phase operations and
//! bought through idempotent settlements. Each merchant's data lives in its own Postgres
//! database, chosen by [`router::MerchantDatabaseRouter`].

pub mod admin;
pub mod api;
pub mod bootstrap;
pub mod catalog;
pub mod config;
pub mod error;
pub mod ledger;
pub mod maintenance;
pub mod operations;
pub mod router;
pub mod server;
pub mod service;
pub mod settlement;

pub use error::{AppError, AppResult};
pub use service::{with_transaction, CreditLedger};
