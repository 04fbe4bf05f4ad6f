use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Top-level error type for the credit ledger
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid request: {field} ({reason})")]
    InvalidRequest {
        field: String,
        reason: InvalidReason,
        details: Option<serde_json::Value>,
    },

    #[error("Product {product_code} unavailable: {reason}")]
    ProductUnavailable {
        product_code: String,
        country: Option<String>,
        reason: ProductUnavailableReason,
    },

    #[error("Operation unavailable for user {user_id}: {reason}")]
    OperationUnavailable {
        user_id: String,
        reason: OperationUnavailableReason,
    },

    #[error("Insufficient balance for user {user_id}: {current_balance} ({reason})")]
    InsufficientBalance {
        user_id: String,
        current_balance: i64,
        reason: InsufficientBalanceReason,
    },

    #[error("Duplicate admin action {action_type} for {external_ref} (first seen {original_timestamp})")]
    DuplicateAdminAction {
        action_type: String,
        external_ref: String,
        original_timestamp: DateTime<Utc>,
    },

    #[error("Service unavailable: {service} ({reason})")]
    ServiceUnavailable {
        service: String,
        reason: ServiceUnavailableReason,
        retry_after_seconds: Option<u64>,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

macro_rules! reason_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

reason_enum!(
    /// Why a request was rejected before touching storage
    InvalidReason {
        Empty => "empty",
        NonPositive => "non_positive",
        Negative => "negative",
        TooShort => "too_short",
        OutOfRange => "out_of_range",
        MalformedPartitionMonth => "malformed_partition_month",
        ShapeViolation => "shape_violation",
        WorkflowIdMismatch => "workflow_id_mismatch",
        NotFound => "not_found",
        NotConfigured => "not_configured",
        UnsupportedReason => "unsupported_reason",
    }
);

reason_enum!(
    ProductUnavailableReason {
        NotFound => "not_found",
        Archived => "archived",
        NotAvailableInCountry => "not_available_in_country",
        PricingChanged => "pricing_changed",
    }
);

reason_enum!(
    OperationUnavailableReason {
        AlreadyHasOpenOperation => "already_has_open_operation",
        OperationTypeInactive => "operation_type_inactive",
        OperationNotOpen => "operation_not_open",
        OperationExpired => "operation_expired",
    }
);

reason_enum!(
    InsufficientBalanceReason {
        NegativeBalance => "negative_balance",
        NoActiveLots => "no_active_lots",
    }
);

reason_enum!(
    ServiceUnavailableReason {
        ConnectionFailure => "connection_failure",
        Timeout => "timeout",
        ConcurrentUpdate => "concurrent_update",
        ResourceExhausted => "resource_exhausted",
        DataCorruption => "data_corruption",
        MissingDatabaseTarget => "missing_database_target",
        QueryFailed => "query_failed",
    }
);

impl AppError {
    pub fn invalid(field: impl Into<String>, reason: InvalidReason) -> Self {
        AppError::InvalidRequest {
            field: field.into(),
            reason,
            details: None,
        }
    }

    pub fn invalid_with(
        field: impl Into<String>,
        reason: InvalidReason,
        details: serde_json::Value,
    ) -> Self {
        AppError::InvalidRequest {
            field: field.into(),
            reason,
            details: Some(details),
        }
    }

    /// Invariant violated by data already persisted
    pub fn corruption(service: impl Into<String>) -> Self {
        AppError::ServiceUnavailable {
            service: service.into(),
            reason: ServiceUnavailableReason::DataCorruption,
            retry_after_seconds: None,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::InvalidRequest { .. } => "INVALID_REQUEST",
            AppError::ProductUnavailable { .. } => "PRODUCT_UNAVAILABLE",
            AppError::OperationUnavailable { .. } => "OPERATION_UNAVAILABLE",
            AppError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            AppError::DuplicateAdminAction { .. } => "DUPLICATE_ADMIN_ACTION",
            AppError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            AppError::Config(_) => "CONFIGURATION_ERROR",
        }
    }
}

/// Map a driver error onto a service-unavailable reason and a retry hint.
pub fn classify_sqlx_error(err: &sqlx::Error) -> (ServiceUnavailableReason, Option<u64>) {
    use ServiceUnavailableReason::*;

    match err {
        sqlx::Error::PoolTimedOut => (Timeout, Some(1)),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Protocol(_) => (ConnectionFailure, Some(5)),
        sqlx::Error::RowNotFound
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. } => (DataCorruption, None),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("40001") | Some("40P01") | Some("23505") | Some("55P03") => {
                (ConcurrentUpdate, Some(1))
            }
            Some("57014") => (Timeout, Some(1)),
            Some(code) if code.starts_with("53") => (ResourceExhausted, Some(10)),
            Some(code) if code.starts_with("08") || code.starts_with("57P") => {
                (ConnectionFailure, Some(5))
            }
            _ => (QueryFailed, None),
        },
        _ => (QueryFailed, None),
    }
}

/// Name of the constraint a database error tripped, if any.
pub fn violated_constraint(err: &sqlx::Error) -> Option<&str> {
    match err {
        sqlx::Error::Database(db) => db.constraint(),
        _ => None,
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        let (reason, retry_after_seconds) = classify_sqlx_error(&error);
        warn!("Storage error classified as {}: {}", reason, error);
        AppError::ServiceUnavailable {
            service: "ledger_store".to_string(),
            reason,
            retry_after_seconds,
        }
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        AppError::Config(format!("Migration error: {}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        // Report the first offending field; field order is not stable so sort it.
        let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));

        match fields.first() {
            Some((field, errs)) => {
                let reason = errs
                    .first()
                    .map(|e| match e.code.as_ref() {
                        "range" => InvalidReason::OutOfRange,
                        _ => InvalidReason::Empty,
                    })
                    .unwrap_or(InvalidReason::Empty);
                AppError::invalid(field.to_string(), reason)
            }
            None => AppError::invalid("request", InvalidReason::ShapeViolation),
        }
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let error_code = self.error_code();
        let message = self.to_string();

        let (status, details) = match &self {
            AppError::InvalidRequest { field, reason, details } => (
                StatusCode::BAD_REQUEST,
                Some(serde_json::json!({
                    "field": field,
                    "reason": reason,
                    "details": details,
                })),
            ),
            AppError::ProductUnavailable { product_code, country, reason } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Some(serde_json::json!({
                    "product_code": product_code,
                    "country": country,
                    "reason": reason,
                })),
            ),
            AppError::OperationUnavailable { user_id, reason } => (
                StatusCode::CONFLICT,
                Some(serde_json::json!({"user_id": user_id, "reason": reason})),
            ),
            AppError::InsufficientBalance { user_id, current_balance, reason } => (
                StatusCode::PAYMENT_REQUIRED,
                Some(serde_json::json!({
                    "user_id": user_id,
                    "current_balance": current_balance,
                    "reason": reason,
                })),
            ),
            AppError::DuplicateAdminAction { action_type, external_ref, original_timestamp } => (
                StatusCode::CONFLICT,
                Some(serde_json::json!({
                    "action_type": action_type,
                    "external_ref": external_ref,
                    "original_timestamp": original_timestamp,
                })),
            ),
            AppError::ServiceUnavailable { service, reason, retry_after_seconds } => (
                StatusCode::SERVICE_UNAVAILABLE,
                Some(serde_json::json!({
                    "service": service,
                    "reason": reason,
                    "retry_after_seconds": retry_after_seconds,
                })),
            ),
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_classified() {
        let (reason, retry) = classify_sqlx_error(&sqlx::Error::PoolTimedOut);
        assert_eq!(reason, ServiceUnavailableReason::Timeout);
        assert_eq!(retry, Some(1));

        let (reason, _) = classify_sqlx_error(&sqlx::Error::PoolClosed);
        assert_eq!(reason, ServiceUnavailableReason::ConnectionFailure);

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let (reason, retry) = classify_sqlx_error(&sqlx::Error::Io(io));
        assert_eq!(reason, ServiceUnavailableReason::ConnectionFailure);
        assert_eq!(retry, Some(5));
    }

    #[test]
    fn test_decode_failures_are_corruption() {
        let (reason, retry) = classify_sqlx_error(&sqlx::Error::RowNotFound);
        assert_eq!(reason, ServiceUnavailableReason::DataCorruption);
        assert!(retry.is_none());
    }

    #[test]
    fn test_driver_errors_never_leak() {
        let err: AppError = sqlx::Error::PoolTimedOut.into();
        match err {
            AppError::ServiceUnavailable { reason, retry_after_seconds, .. } => {
                assert_eq!(reason, ServiceUnavailableReason::Timeout);
                assert_eq!(retry_after_seconds, Some(1));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(
            OperationUnavailableReason::AlreadyHasOpenOperation.as_str(),
            "already_has_open_operation"
        );
        assert_eq!(InvalidReason::WorkflowIdMismatch.to_string(), "workflow_id_mismatch");
        assert_eq!(
            serde_json::to_value(ProductUnavailableReason::NotAvailableInCountry).unwrap(),
            serde_json::json!("not_available_in_country")
        );
    }

    #[test]
    fn test_status_codes() {
        let resp = AppError::invalid("user_id", InvalidReason::Empty).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = AppError::OperationUnavailable {
            user_id: "u1".into(),
            reason: OperationUnavailableReason::AlreadyHasOpenOperation,
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = AppError::corruption("ledger_store").into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
