use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use uuid::Uuid;

use crate::error::{AppError, AppResult, InvalidReason, OperationUnavailableReason};
use crate::ledger::models::RESOURCE_SCALE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "operation_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Open,
    Completed,
    Expired,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Open)
    }

    /// Valid transitions:
    /// - Open → Completed, Expired, Cancelled
    /// - Terminal states → none
    pub fn validate_transition(from: OperationStatus, to: OperationStatus) -> AppResult<()> {
        if from.is_terminal() || !to.is_terminal() {
            return Err(AppError::invalid_with(
                "status",
                InvalidReason::OutOfRange,
                serde_json::json!({
                    "current": from,
                    "requested": to,
                }),
            ));
        }
        Ok(())
    }
}

/// A billable action type and its current rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct OperationType {
    pub code: String,
    pub name: String,
    pub resource_unit: String,
    pub credits_per_unit: Decimal,
    pub ttl_seconds: i64,
    pub is_active: bool,
}

/// Longest an operation may stay open before the sweep expires it
pub const MAX_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

impl OperationType {
    /// Field checks run before a rate is written
    pub fn validate(&self) -> AppResult<()> {
        if self.code.trim().is_empty() {
            return Err(AppError::invalid("code", InvalidReason::Empty));
        }
        if self.name.trim().is_empty() {
            return Err(AppError::invalid("name", InvalidReason::Empty));
        }
        if self.resource_unit.trim().is_empty() {
            return Err(AppError::invalid("resource_unit", InvalidReason::Empty));
        }
        if self.credits_per_unit <= Decimal::ZERO {
            return Err(AppError::invalid("credits_per_unit", InvalidReason::NonPositive));
        }
        if self.credits_per_unit.normalize().scale() > RESOURCE_SCALE {
            return Err(AppError::invalid("credits_per_unit", InvalidReason::OutOfRange));
        }
        if self.ttl_seconds <= 0 {
            return Err(AppError::invalid("ttl_seconds", InvalidReason::NonPositive));
        }
        if self.ttl_seconds > MAX_TTL_SECONDS {
            return Err(AppError::invalid("ttl_seconds", InvalidReason::OutOfRange));
        }
        Ok(())
    }
}

/// Deadline for an operation opened at `opened_at` with a `ttl_seconds` window
pub fn operation_expiry(opened_at: DateTime<Utc>, ttl_seconds: i64) -> AppResult<DateTime<Utc>> {
    if ttl_seconds <= 0 {
        return Err(AppError::invalid("ttl_seconds", InvalidReason::NonPositive));
    }
    if ttl_seconds > MAX_TTL_SECONDS {
        return Err(AppError::invalid("ttl_seconds", InvalidReason::OutOfRange));
    }

    Duration::try_seconds(ttl_seconds)
        .and_then(|ttl| opened_at.checked_add_signed(ttl))
        .ok_or_else(|| AppError::invalid("ttl_seconds", InvalidReason::OutOfRange))
}

/// One metered action, open until closed, cancelled or swept
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Operation {
    pub operation_id: Uuid,
    pub user_id: String,
    pub operation_type_code: String,
    pub workflow_id: Option<String>,
    pub captured_rate: Decimal,
    pub resource_unit: String,
    pub status: OperationStatus,
    pub opened_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub resource_amount: Option<Decimal>,
    pub credits_consumed: Option<i64>,
}

impl Operation {
    /// Reason `close` must refuse this operation at `at`, if any
    pub fn close_blocker(&self, at: DateTime<Utc>) -> Option<OperationUnavailableReason> {
        if self.status != OperationStatus::Open {
            Some(OperationUnavailableReason::OperationNotOpen)
        } else if at >= self.expires_at {
            Some(OperationUnavailableReason::OperationExpired)
        } else {
            None
        }
    }

    pub fn unavailable(&self, reason: OperationUnavailableReason) -> AppError {
        AppError::OperationUnavailable {
            user_id: self.user_id.clone(),
            reason,
        }
    }
}

/// Row about to be inserted by `open`
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub operation_id: Uuid,
    pub user_id: String,
    pub operation_type_code: String,
    pub workflow_id: Option<String>,
    pub captured_rate: Decimal,
    pub resource_unit: String,
    pub opened_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl NewOperation {
    /// Capture the type's current rate and TTL for a new operation
    pub fn capture(
        user_id: &str,
        operation_type: &OperationType,
        workflow_id: Option<String>,
        opened_at: DateTime<Utc>,
    ) -> AppResult<Self> {
        if operation_type.credits_per_unit <= Decimal::ZERO {
            return Err(AppError::corruption("operations"));
        }
        let expires_at = operation_expiry(opened_at, operation_type.ttl_seconds)?;

        Ok(Self {
            operation_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            operation_type_code: operation_type.code.clone(),
            workflow_id,
            captured_rate: operation_type.credits_per_unit,
            resource_unit: operation_type.resource_unit.clone(),
            opened_at,
            expires_at,
        })
    }
}

/// Credits owed for `resource_amount` units at `rate`, rounded up to a whole credit
pub fn credits_for(resource_amount: Decimal, rate: Decimal) -> AppResult<i64> {
    if resource_amount < Decimal::ZERO {
        return Err(AppError::invalid("resource_amount", InvalidReason::Negative));
    }

    resource_amount
        .checked_mul(rate)
        .map(|credits| credits.ceil())
        .and_then(|credits| credits.to_i64())
        .ok_or_else(|| AppError::invalid("resource_amount", InvalidReason::OutOfRange))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn transcription() -> OperationType {
        OperationType {
            code: "transcription".to_string(),
            name: "Audio transcription".to_string(),
            resource_unit: "seconds".to_string(),
            credits_per_unit: dec!(0.025),
            ttl_seconds: 900,
            is_active: true,
        }
    }

    #[test]
    fn test_rate_scenario() {
        assert_eq!(credits_for(dec!(1000), dec!(0.025)).unwrap(), 25);
    }

    #[test]
    fn test_partial_credit_rounds_up() {
        assert_eq!(credits_for(dec!(1), dec!(0.025)).unwrap(), 1);
        assert_eq!(credits_for(dec!(41), dec!(0.025)).unwrap(), 2);
        assert_eq!(credits_for(dec!(0), dec!(0.025)).unwrap(), 0);
    }

    #[test]
    fn test_negative_resource_amount_rejected() {
        assert!(matches!(
            credits_for(dec!(-1), dec!(0.025)),
            Err(AppError::InvalidRequest { reason: InvalidReason::Negative, .. })
        ));
    }

    #[test]
    fn test_capture_snapshots_rate_and_ttl() {
        let opened_at = Utc::now();
        let op = NewOperation::capture("user-1", &transcription(), Some("wf-1".to_string()), opened_at)
            .unwrap();
        assert_eq!(op.captured_rate, dec!(0.025));
        assert_eq!(op.resource_unit, "seconds");
        assert_eq!(op.expires_at - op.opened_at, Duration::seconds(900));
        assert!(op.expires_at > op.opened_at);
    }

    #[test]
    fn test_huge_ttl_is_rejected_not_overflowed() {
        let opened_at = Utc::now();
        let stored = OperationType {
            ttl_seconds: i64::MAX,
            ..transcription()
        };
        assert!(matches!(
            NewOperation::capture("user-1", &stored, None, opened_at),
            Err(AppError::InvalidRequest { reason: InvalidReason::OutOfRange, .. })
        ));
        assert!(operation_expiry(opened_at, MAX_TTL_SECONDS).is_ok());
        assert!(operation_expiry(opened_at, MAX_TTL_SECONDS + 1).is_err());
    }

    #[test]
    fn test_operation_type_validation() {
        transcription().validate().unwrap();

        let cases = [
            (OperationType { code: " ".to_string(), ..transcription() }, "code", InvalidReason::Empty),
            (
                OperationType { credits_per_unit: dec!(0), ..transcription() },
                "credits_per_unit",
                InvalidReason::NonPositive,
            ),
            (
                OperationType { credits_per_unit: dec!(-0.5), ..transcription() },
                "credits_per_unit",
                InvalidReason::NonPositive,
            ),
            (
                OperationType { credits_per_unit: dec!(0.0000001), ..transcription() },
                "credits_per_unit",
                InvalidReason::OutOfRange,
            ),
            (
                OperationType { ttl_seconds: 0, ..transcription() },
                "ttl_seconds",
                InvalidReason::NonPositive,
            ),
            (
                OperationType { ttl_seconds: i64::MAX, ..transcription() },
                "ttl_seconds",
                InvalidReason::OutOfRange,
            ),
        ];

        for (operation_type, expected_field, expected_reason) in cases {
            match operation_type.validate() {
                Err(AppError::InvalidRequest { field, reason, .. }) => {
                    assert_eq!(field, expected_field);
                    assert_eq!(reason, expected_reason);
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }
    }

    #[test]
    fn test_transitions() {
        use OperationStatus::*;

        for to in [Completed, Expired, Cancelled] {
            OperationStatus::validate_transition(Open, to).unwrap();
        }
        for from in [Completed, Expired, Cancelled] {
            for to in [Open, Completed, Expired, Cancelled] {
                assert!(OperationStatus::validate_transition(from, to).is_err());
            }
        }
        assert!(OperationStatus::validate_transition(Open, Open).is_err());
    }

    #[test]
    fn test_close_blocker() {
        let now = Utc::now();
        let mut op = Operation {
            operation_id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            operation_type_code: "transcription".to_string(),
            workflow_id: None,
            captured_rate: dec!(0.025),
            resource_unit: "seconds".to_string(),
            status: OperationStatus::Open,
            opened_at: now - Duration::seconds(60),
            expires_at: now + Duration::seconds(60),
            closed_at: None,
            resource_amount: None,
            credits_consumed: None,
        };
        assert_eq!(op.close_blocker(now), None);

        assert_eq!(
            op.close_blocker(now + Duration::seconds(60)),
            Some(OperationUnavailableReason::OperationExpired)
        );

        op.status = OperationStatus::Cancelled;
        assert_eq!(
            op.close_blocker(now),
            Some(OperationUnavailableReason::OperationNotOpen)
        );
    }
}
