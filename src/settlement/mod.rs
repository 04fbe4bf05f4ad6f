//! Idempotent purchase settlement: one lot and one receipt per external reference.

pub mod coordinator;
pub mod models;
pub mod receipts;

pub use coordinator::SettlementCoordinator;
pub use models::{
    MerchantConfig, PricingSnapshot, PurchaseSnapshot, Receipt, SettlementOutcome,
    SettlementRequest, TaxBreakdown,
};
pub use receipts::{format_receipt_number, ReceiptRepository};
