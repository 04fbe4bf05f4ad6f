// Background upkeep for merchant databases
pub mod scheduler;

pub use scheduler::{MaintenanceReport, MaintenanceScheduler};
