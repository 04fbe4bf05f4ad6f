//! Metered operations: open at a captured rate, close with measured usage.

pub mod lifecycle;
pub mod models;
pub mod repository;

pub use lifecycle::{ClosedOperation, OperationLifecycle};
pub use models::{credits_for, Operation, OperationStatus, OperationType};
pub use repository::OperationRepository;
