//! Error taxonomy for the fulfillment and settlement core

use axum::http::StatusCode;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the ledger services.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("service request {0} has already been settled")]
    AlreadySettled(Uuid),

    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: i64, available: i64 },

    #[error("daily spending limit exceeded: spent {spent_today} of {limit}, requested {requested}")]
    DailyLimitExceeded {
        spent_today: i64,
        limit: i64,
        requested: i64,
    },

    #[error("withdrawal limit exceeded: requested {requested}, limit {limit}")]
    WithdrawalLimitExceeded { requested: i64, limit: i64 },

    #[error("amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("concurrent write conflict on {entity} {id}")]
    StoreConflict { entity: &'static str, id: String },

    #[error("store unavailable after {attempts} attempts: {reason}")]
    Unavailable { attempts: u32, reason: String },

    #[error("payment gateway failure: {0}")]
    GatewayFailure(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("database error: {0}")]
    Database(String),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(entity: &'static str, id: impl ToString) -> Self {
        LedgerError::StoreConflict {
            entity,
            id: id.to_string(),
        }
    }

    /// Only write conflicts are retried by `store::with_retry`.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::StoreConflict { .. })
    }

    /// Short machine-readable code, used in activity-log entries.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidTransition { .. } => "invalid_transition",
            LedgerError::AlreadySettled(_) => "already_settled",
            LedgerError::InsufficientFunds { .. } => "insufficient_funds",
            LedgerError::DailyLimitExceeded { .. } => "daily_limit_exceeded",
            LedgerError::WithdrawalLimitExceeded { .. } => "withdrawal_limit_exceeded",
            LedgerError::InvalidAmount(_) => "invalid_amount",
            LedgerError::StoreConflict { .. } => "store_conflict",
            LedgerError::Unavailable { .. } => "unavailable",
            LedgerError::GatewayFailure(_) => "gateway_failure",
            LedgerError::NotFound { .. } => "not_found",
            LedgerError::InvalidRequest(_) => "invalid_request",
            LedgerError::Database(_) => "database",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            LedgerError::InvalidTransition { .. } | LedgerError::AlreadySettled(_) => {
                StatusCode::CONFLICT
            }
            LedgerError::InsufficientFunds { .. }
            | LedgerError::DailyLimitExceeded { .. }
            | LedgerError::WithdrawalLimitExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            LedgerError::InvalidAmount(_) | LedgerError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
            LedgerError::StoreConflict { .. } | LedgerError::Unavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            LedgerError::GatewayFailure(_) => StatusCode::BAD_GATEWAY,
            LedgerError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => LedgerError::NotFound {
                entity: "row",
                id: "unknown".to_string(),
            },
            other => LedgerError::Database(other.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for LedgerError {
    fn from(err: validator::ValidationErrors) -> Self {
        LedgerError::InvalidRequest(err.to_string())
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(LedgerError::conflict("wallet", "abc").is_retryable());
        assert!(!LedgerError::InvalidAmount(0).is_retryable());
        assert!(!LedgerError::Unavailable {
            attempts: 5,
            reason: "conflict".into()
        }
        .is_retryable());
    }

    #[test]
    fn user_correctable_errors_map_to_422() {
        let err = LedgerError::InsufficientFunds {
            requested: 6_000,
            available: 4_000,
        };
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(err.to_string().contains("6000"));
        assert_eq!(
            LedgerError::AlreadySettled(Uuid::nil()).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn transition_errors_name_both_states() {
        let err = LedgerError::InvalidTransition {
            from: "closed_auto".into(),
            to: "service_started".into(),
            reason: "finalized requests cannot be reopened".into(),
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "invalid_transition");
        assert!(err.to_string().starts_with("invalid transition from closed_auto to service_started"));
    }
}
