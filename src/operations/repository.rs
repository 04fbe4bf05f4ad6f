use super::models::*;
use crate::error::{violated_constraint, AppError, AppResult, OperationUnavailableReason};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

const OPERATION_COLUMNS: &str = "operation_id, user_id, operation_type_code, workflow_id, captured_rate, \
     resource_unit, status, opened_at, expires_at, closed_at, resource_amount, credits_consumed";

/// Unique partial index allowing one open operation per user
pub const ONE_OPEN_PER_USER: &str = "operations_one_open_per_user";

#[derive(Debug, Clone, Copy, Default)]
pub struct OperationRepository;

impl OperationRepository {
    pub fn new() -> Self {
        Self
    }

    // ========== OPERATION TYPES ==========

    pub async fn get_operation_type(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        code: &str,
    ) -> AppResult<Option<OperationType>> {
        let operation_type = sqlx::query_as::<_, OperationType>(
            r#"
            SELECT code, name, resource_unit, credits_per_unit, ttl_seconds, is_active
            FROM operation_types
            WHERE code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(operation_type)
    }

    /// Insert or re-rate an operation type. Open operations keep the rate they captured.
    pub async fn upsert_operation_type(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        operation_type: &OperationType,
    ) -> AppResult<OperationType> {
        operation_type.validate()?;

        let stored = sqlx::query_as::<_, OperationType>(
            r#"
            INSERT INTO operation_types (code, name, resource_unit, credits_per_unit, ttl_seconds, is_active)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (code) DO UPDATE
            SET name = EXCLUDED.name,
                resource_unit = EXCLUDED.resource_unit,
                credits_per_unit = EXCLUDED.credits_per_unit,
                ttl_seconds = EXCLUDED.ttl_seconds,
                is_active = EXCLUDED.is_active,
                updated_at = NOW()
            RETURNING code, name, resource_unit, credits_per_unit, ttl_seconds, is_active
            "#,
        )
        .bind(&operation_type.code)
        .bind(&operation_type.name)
        .bind(&operation_type.resource_unit)
        .bind(operation_type.credits_per_unit)
        .bind(operation_type.ttl_seconds)
        .bind(operation_type.is_active)
        .fetch_one(&mut **tx)
        .await?;

        Ok(stored)
    }

    // ========== OPERATIONS ==========

    pub async fn get_open_operation(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
    ) -> AppResult<Option<Operation>> {
        let operation = sqlx::query_as::<_, Operation>(&format!(
            "SELECT {} FROM operations WHERE user_id = $1 AND status = 'open'",
            OPERATION_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(operation)
    }

    pub async fn has_open_operation(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
    ) -> AppResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM operations WHERE user_id = $1 AND status = 'open')",
        )
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(exists)
    }

    /// Insert a new open operation. A concurrent open for the same user that committed
    /// first surfaces as `already_has_open_operation`.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        operation: &NewOperation,
    ) -> AppResult<Operation> {
        let result = sqlx::query_as::<_, Operation>(&format!(
            r#"
            INSERT INTO operations (
                operation_id, user_id, operation_type_code, workflow_id, captured_rate,
                resource_unit, status, opened_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'open', $7, $8)
            RETURNING {}
            "#,
            OPERATION_COLUMNS
        ))
        .bind(operation.operation_id)
        .bind(&operation.user_id)
        .bind(&operation.operation_type_code)
        .bind(&operation.workflow_id)
        .bind(operation.captured_rate)
        .bind(&operation.resource_unit)
        .bind(operation.opened_at)
        .bind(operation.expires_at)
        .fetch_one(&mut **tx)
        .await;

        match result {
            Ok(operation) => Ok(operation),
            Err(e) if violated_constraint(&e) == Some(ONE_OPEN_PER_USER) => {
                Err(AppError::OperationUnavailable {
                    user_id: operation.user_id.clone(),
                    reason: OperationUnavailableReason::AlreadyHasOpenOperation,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load and row-lock an operation for a state change
    pub async fn get_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        operation_id: Uuid,
    ) -> AppResult<Option<Operation>> {
        let operation = sqlx::query_as::<_, Operation>(&format!(
            "SELECT {} FROM operations WHERE operation_id = $1 FOR UPDATE",
            OPERATION_COLUMNS
        ))
        .bind(operation_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(operation)
    }

    /// Move an open operation to a terminal state
    pub async fn finish(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        operation: &Operation,
        to_status: OperationStatus,
        closed_at: DateTime<Utc>,
        resource_amount: Option<Decimal>,
        credits_consumed: Option<i64>,
    ) -> AppResult<Operation> {
        OperationStatus::validate_transition(operation.status, to_status)?;

        let updated = sqlx::query_as::<_, Operation>(&format!(
            r#"
            UPDATE operations
            SET status = $2, closed_at = $3, resource_amount = $4, credits_consumed = $5
            WHERE operation_id = $1 AND status = 'open'
            RETURNING {}
            "#,
            OPERATION_COLUMNS
        ))
        .bind(operation.operation_id)
        .bind(to_status)
        .bind(closed_at)
        .bind(resource_amount)
        .bind(credits_consumed)
        .fetch_optional(&mut **tx)
        .await?;

        updated.ok_or_else(|| operation.unavailable(OperationUnavailableReason::OperationNotOpen))
    }

    /// Bulk-expire open operations whose expiry is before `before`
    pub async fn sweep_expired(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        before: DateTime<Utc>,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE operations
            SET status = 'expired', closed_at = $1
            WHERE status = 'open' AND expires_at < $1
            "#,
        )
        .bind(before)
        .execute(&mut **tx)
        .await?;

        let swept = result.rows_affected();
        if swept > 0 {
            info!("⏰ Expired {} open operation(s)", swept);
        }
        Ok(swept)
    }

    /// Delete terminal operations closed before `older_than`
    pub async fn delete_terminal(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        older_than: DateTime<Utc>,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            "DELETE FROM operations WHERE status <> 'open' AND closed_at < $1",
        )
        .bind(older_than)
        .execute(&mut **tx)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!("🧹 Removed {} terminal operation(s) closed before {}", deleted, older_than);
        }
        Ok(deleted)
    }
}
