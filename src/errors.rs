use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;

use crate::ledger::BalanceBucket;

/// Seconds a client is told to wait after a contention failure.
pub const CONTENTION_RETRY_AFTER_SECS: u64 = 5;

/// What went wrong at the database, decided where the `sqlx::Error` is caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    Deadlock,
    SerializationFailure,
    LockTimeout,
    PoolTimeout,
    UniqueViolation,
    Other,
}

impl DbErrorKind {
    /// Map a SQLSTATE (Postgres) or vendor error number (MySQL) to a kind.
    pub fn from_code(code: &str) -> Self {
        match code {
            "40001" => DbErrorKind::SerializationFailure,
            "40P01" | "1213" => DbErrorKind::Deadlock,
            "55P03" | "1205" => DbErrorKind::LockTimeout,
            "23505" | "1062" => DbErrorKind::UniqueViolation,
            _ => DbErrorKind::Other,
        }
    }

    pub fn classify(err: &sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => db
                .code()
                .map(|code| Self::from_code(&code))
                .unwrap_or(DbErrorKind::Other),
            sqlx::Error::PoolTimedOut => DbErrorKind::PoolTimeout,
            _ => DbErrorKind::Other,
        }
    }

    /// Kinds that go away if the same work is tried again.
    pub fn is_contention(self) -> bool {
        matches!(
            self,
            DbErrorKind::Deadlock
                | DbErrorKind::SerializationFailure
                | DbErrorKind::LockTimeout
                | DbErrorKind::PoolTimeout
        )
    }
}

impl std::fmt::Display for DbErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DbErrorKind::Deadlock => "deadlock",
            DbErrorKind::SerializationFailure => "serialization failure",
            DbErrorKind::LockTimeout => "lock wait timeout",
            DbErrorKind::PoolTimeout => "connection pool timeout",
            DbErrorKind::UniqueViolation => "unique violation",
            DbErrorKind::Other => "database error",
        };
        f.write_str(name)
    }
}

/// Ledger failures, each mapping to one HTTP status.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Wallet not found for user: {0}")]
    WalletNotFound(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Tier not found: {0}")]
    TierNotFound(String),

    #[error("Payout method not found: {0}")]
    PayoutMethodNotFound(String),

    #[error("Payout request not found: {0}")]
    PayoutRequestNotFound(String),

    #[error("Insufficient {bucket} balance. Required: {required}, Available: {available}")]
    InsufficientBalance {
        bucket: BalanceBucket,
        required: Decimal,
        available: Decimal,
    },

    #[error("Insufficient platform funds. Required: {required}, Available: {available}")]
    InsufficientPlatformFunds { required: Decimal, available: Decimal },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Cannot move {entity} from {from} to {to}")]
    InvalidStateTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Duplicate record violates {}", .constraint.as_deref().unwrap_or("a unique constraint"))]
    UniqueViolation { constraint: Option<String> },

    #[error("Database busy ({0}). Please retry.")]
    Contention(DbErrorKind),

    #[error("Too many requests. Retry in {retry_after_secs} seconds.")]
    RateLimited { retry_after_secs: u64 },

    #[error("Rate limiter unavailable: {0}")]
    RateLimiterUnavailable(String),

    #[error("Database error: {0}")]
    DatabaseError(sqlx::Error),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl LedgerError {
    /// Whether repeating the failed unit of work may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Contention(_))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            LedgerError::WalletNotFound(_)
            | LedgerError::TransactionNotFound(_)
            | LedgerError::TierNotFound(_)
            | LedgerError::PayoutMethodNotFound(_)
            | LedgerError::PayoutRequestNotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::InsufficientBalance { .. }
            | LedgerError::InsufficientPlatformFunds { .. }
            | LedgerError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
            LedgerError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            LedgerError::Forbidden(_) => StatusCode::FORBIDDEN,
            LedgerError::InvalidStateTransition { .. } | LedgerError::UniqueViolation { .. } => {
                StatusCode::CONFLICT
            }
            LedgerError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            LedgerError::Contention(_) | LedgerError::RateLimiterUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            LedgerError::DatabaseError(_) | LedgerError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            LedgerError::Contention(_) | LedgerError::RateLimiterUnavailable(_) => {
                Some(CONTENTION_RETRY_AFTER_SECS)
            }
            LedgerError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        match DbErrorKind::classify(&err) {
            DbErrorKind::UniqueViolation => {
                let constraint = err
                    .as_database_error()
                    .and_then(|db| db.constraint())
                    .map(str::to_string);
                LedgerError::UniqueViolation { constraint }
            }
            kind if kind.is_contention() => LedgerError::Contention(kind),
            _ => LedgerError::DatabaseError(err),
        }
    }
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = self.retry_after();

        let error_message = match self {
            LedgerError::DatabaseError(ref e) => {
                tracing::error!("Database error: {:?}", e);
                "Database operation failed".to_string()
            }
            LedgerError::InternalError(ref e) => {
                tracing::error!("Internal error: {}", e);
                "An unexpected error occurred".to_string()
            }
            LedgerError::Contention(kind) => {
                tracing::warn!(kind = %kind, "Database contention survived retries");
                self.to_string()
            }
            _ => self.to_string(),
        };

        let body = match retry_after {
            Some(secs) => json!({
                "success": false,
                "error": error_message,
                "retry_after": secs,
            }),
            None => json!({
                "success": false,
                "error": error_message,
            }),
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
