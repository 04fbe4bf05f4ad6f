use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use super::models::*;
use super::repository::OperationRepository;
use crate::error::{AppError, AppResult, InvalidReason, OperationUnavailableReason};
use crate::ledger::{
    check_resource_amount, DebitRequest, EntryContext, EntryReason, LedgerEntry,
    LotConsumptionEngine,
};

/// Result of closing an operation
#[derive(Debug, Clone, Serialize)]
pub struct ClosedOperation {
    pub operation: Operation,
    /// One entry per lot drawn from; empty when nothing was consumed
    pub debits: Vec<LedgerEntry>,
}

/// Two-phase metering: open at a captured rate, close with the measured usage
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationLifecycle {
    operations: OperationRepository,
    lots: LotConsumptionEngine,
}

impl OperationLifecycle {
    pub fn new(operations: OperationRepository, lots: LotConsumptionEngine) -> Self {
        Self { operations, lots }
    }

    pub fn repository(&self) -> &OperationRepository {
        &self.operations
    }

    pub async fn open(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
        operation_type_code: &str,
        workflow_id: Option<String>,
        at: DateTime<Utc>,
    ) -> AppResult<Operation> {
        if user_id.trim().is_empty() {
            return Err(AppError::invalid("user_id", InvalidReason::Empty));
        }
        if operation_type_code.trim().is_empty() {
            return Err(AppError::invalid("operation_type", InvalidReason::Empty));
        }
        if matches!(&workflow_id, Some(id) if id.trim().is_empty()) {
            return Err(AppError::invalid("workflow_id", InvalidReason::Empty));
        }

        if self.operations.has_open_operation(tx, user_id).await? {
            return Err(AppError::OperationUnavailable {
                user_id: user_id.to_string(),
                reason: OperationUnavailableReason::AlreadyHasOpenOperation,
            });
        }

        let operation_type = self
            .operations
            .get_operation_type(tx, operation_type_code)
            .await?
            .ok_or_else(|| AppError::invalid("operation_type", InvalidReason::NotFound))?;

        if !operation_type.is_active {
            return Err(AppError::OperationUnavailable {
                user_id: user_id.to_string(),
                reason: OperationUnavailableReason::OperationTypeInactive,
            });
        }

        let new_operation = NewOperation::capture(user_id, &operation_type, workflow_id, at)?;
        let operation = self.operations.insert(tx, &new_operation).await?;

        info!(
            "▶️ Operation {} opened for {}: {} at {} credits/{}",
            operation.operation_id,
            user_id,
            operation.operation_type_code,
            operation.captured_rate,
            operation.resource_unit
        );

        Ok(operation)
    }

    /// Charge the measured usage at the captured rate and complete the operation
    pub async fn close(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        operation_id: Uuid,
        resource_amount: Decimal,
        at: DateTime<Utc>,
    ) -> AppResult<ClosedOperation> {
        check_resource_amount(resource_amount)?;

        let operation = self
            .operations
            .get_for_update(tx, operation_id)
            .await?
            .ok_or_else(|| AppError::invalid("operation_id", InvalidReason::NotFound))?;

        if let Some(reason) = operation.close_blocker(at) {
            return Err(operation.unavailable(reason));
        }

        let credits = credits_for(resource_amount, operation.captured_rate)?;

        let debits = if credits > 0 {
            let debit = DebitRequest {
                amount: credits,
                reason: EntryReason::Debit,
                context: EntryContext {
                    operation_type: operation.operation_type_code.clone(),
                    resource_amount: Some(resource_amount),
                    resource_unit: Some(operation.resource_unit.clone()),
                    workflow_id: operation.workflow_id.clone(),
                },
            };
            self.lots
                .consume_fifo(tx, &operation.user_id, &debit, at)
                .await?
        } else {
            Vec::new()
        };

        let completed = self
            .operations
            .finish(
                tx,
                &operation,
                OperationStatus::Completed,
                at,
                Some(resource_amount),
                Some(credits),
            )
            .await?;

        info!(
            "✅ Operation {} completed: {} {} → {} credits",
            completed.operation_id, resource_amount, completed.resource_unit, credits
        );

        Ok(ClosedOperation {
            operation: completed,
            debits,
        })
    }

    /// Abandon an open operation without charging anything
    pub async fn cancel(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        operation_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Operation> {
        let operation = self
            .operations
            .get_for_update(tx, operation_id)
            .await?
            .ok_or_else(|| AppError::invalid("operation_id", InvalidReason::NotFound))?;

        if operation.status != OperationStatus::Open {
            return Err(operation.unavailable(OperationUnavailableReason::OperationNotOpen));
        }

        let cancelled = self
            .operations
            .finish(tx, &operation, OperationStatus::Cancelled, at, None, None)
            .await?;

        info!("⏹️ Operation {} cancelled", cancelled.operation_id);
        Ok(cancelled)
    }

    pub async fn sweep_expired(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        before: DateTime<Utc>,
    ) -> AppResult<u64> {
        self.operations.sweep_expired(tx, before).await
    }

    pub async fn cleanup_terminal(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        older_than: DateTime<Utc>,
    ) -> AppResult<u64> {
        self.operations.delete_terminal(tx, older_than).await
    }

    pub async fn has_open_operation(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
    ) -> AppResult<bool> {
        self.operations.has_open_operation(tx, user_id).await
    }

    pub async fn get_open_operation(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
    ) -> AppResult<Option<Operation>> {
        self.operations.get_open_operation(tx, user_id).await
    }
}
