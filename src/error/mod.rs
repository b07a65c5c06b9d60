//! Error types for the SQL gateway.
//!
//! Uses `thiserror` for ergonomic error definitions with automatic `From` conversions.
//! Every variant maps to a stable error code through `code()`, and
//! [`GatewayError::to_body`] turns any failure into the structured
//! [`ErrorBody`] that crosses the gateway boundary.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use thiserror::Error;

/// Stable error codes reported to callers.
pub mod codes {
    pub const INJECTION_DETECTED: &str = "INJECTION_DETECTED";
    pub const QUERY_TOO_LONG: &str = "QUERY_TOO_LONG";
    pub const UNBALANCED_QUOTING: &str = "UNBALANCED_QUOTING";
    pub const COMPLEXITY_EXCEEDED: &str = "COMPLEXITY_EXCEEDED";
    pub const INVALID_IDENTIFIER: &str = "INVALID_IDENTIFIER";
    pub const INVALID_SORT: &str = "INVALID_SORT";
    pub const COLUMN_NOT_ALLOWED: &str = "COLUMN_NOT_ALLOWED";
    pub const INVALID_LIMIT: &str = "INVALID_LIMIT";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const CONCURRENCY_LIMITED: &str = "CONCURRENCY_LIMITED";
    pub const EXECUTION_TIME_EXCEEDED: &str = "EXECUTION_TIME_EXCEEDED";
    pub const MEMORY_LIMIT_EXCEEDED: &str = "MEMORY_LIMIT_EXCEEDED";
    pub const RPC_UNAVAILABLE: &str = "RPC_UNAVAILABLE";
    pub const RPC_FORMAT_ERROR: &str = "RPC_FORMAT_ERROR";
    pub const POOL_ERROR: &str = "POOL_ERROR";
    pub const MAX_RETRIES_EXCEEDED: &str = "MAX_RETRIES_EXCEEDED";
    pub const CONFIG_ERROR: &str = "CONFIG_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Main error type for the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Security error: {0}")]
    Security(#[from] SecurityError),

    #[error("Limit error: {0}")]
    Limit(#[from] LimitError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl GatewayError {
    /// Returns the caller-facing error code.
    pub fn code(&self) -> Cow<'_, str> {
        match self {
            Self::Security(e) => Cow::Borrowed(e.code()),
            Self::Limit(e) => Cow::Borrowed(e.code()),
            Self::Resource(e) => Cow::Borrowed(e.code()),
            Self::Database(e) => e.code(),
            Self::Rpc(e) => e.code(),
            Self::Config(_) => Cow::Borrowed(codes::CONFIG_ERROR),
        }
    }

    /// Converts the error into the structured body returned to callers.
    ///
    /// Database and RPC errors keep their server-provided message, details
    /// and hint; everything else reports its display text.
    pub fn to_body(&self) -> ErrorBody {
        let code = self.code().into_owned();
        match self {
            Self::Database(DatabaseError::Query {
                message,
                detail,
                hint,
                ..
            }) => ErrorBody {
                message: message.clone(),
                code,
                details: detail.clone(),
                hint: hint.clone(),
                retry_after: None,
            },
            Self::Rpc(RpcError::Api {
                message,
                details,
                hint,
                ..
            }) => ErrorBody {
                message: message.clone(),
                code,
                details: details.clone(),
                hint: hint.clone(),
                retry_after: None,
            },
            Self::Limit(LimitError::RateLimited {
                limit,
                retry_after_secs,
                ..
            }) => ErrorBody {
                message: self.to_string(),
                code,
                details: Some(format!("{limit} requests per window")),
                hint: Some(format!("Retry after {retry_after_secs} seconds")),
                retry_after: Some(*retry_after_secs),
            },
            Self::Limit(LimitError::ConcurrencyLimited { active, max }) => ErrorBody {
                message: self.to_string(),
                code,
                details: Some(format!("{active} of {max} concurrent requests in flight")),
                hint: Some("Retry once an in-flight request completes".into()),
                retry_after: None,
            },
            _ => ErrorBody {
                message: self.to_string(),
                code,
                details: None,
                hint: None,
                retry_after: None,
            },
        }
    }
}

/// Query validation and sanitization errors.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("SQL injection detected: {0}")]
    InjectionDetected(String),

    #[error("Query exceeds maximum length: {length} > {max} bytes")]
    QueryTooLong { length: usize, max: usize },

    #[error("Unbalanced quoting: odd number of {0} characters")]
    UnbalancedQuoting(char),

    #[error("Query too complex: score {score} exceeds {max}")]
    ComplexityExceeded { score: u32, max: u32 },

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid sort direction: {0}")]
    InvalidSortDirection(String),

    #[error("Column not allowed for sorting: {0}")]
    ColumnNotAllowed(String),

    #[error("Invalid limit: {0}")]
    InvalidLimit(String),
}

impl SecurityError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InjectionDetected(_) => codes::INJECTION_DETECTED,
            Self::QueryTooLong { .. } => codes::QUERY_TOO_LONG,
            Self::UnbalancedQuoting(_) => codes::UNBALANCED_QUOTING,
            Self::ComplexityExceeded { .. } => codes::COMPLEXITY_EXCEEDED,
            Self::InvalidIdentifier(_) => codes::INVALID_IDENTIFIER,
            Self::InvalidSortDirection(_) => codes::INVALID_SORT,
            Self::ColumnNotAllowed(_) => codes::COLUMN_NOT_ALLOWED,
            Self::InvalidLimit(_) => codes::INVALID_LIMIT,
        }
    }
}

/// Admission control rejections.
#[derive(Debug, Error)]
pub enum LimitError {
    #[error("Rate limit exceeded: {limit} requests per window, retry after {retry_after_secs}s")]
    RateLimited {
        limit: u32,
        remaining: u32,
        retry_after_secs: u64,
    },

    #[error("Concurrent request limit exceeded: {active}/{max}")]
    ConcurrencyLimited { active: usize, max: usize },
}

impl LimitError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => codes::RATE_LIMITED,
            Self::ConcurrencyLimited { .. } => codes::CONCURRENCY_LIMITED,
        }
    }
}

/// Resource budget violations.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Execution time exceeded: {elapsed_ms}ms > {max_ms}ms")]
    ExecutionTimeExceeded { elapsed_ms: u64, max_ms: u64 },

    #[error("Memory limit exceeded: {current_mb}MB > {max_mb}MB")]
    MemoryLimitExceeded { current_mb: u64, max_mb: u64 },
}

impl ResourceError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ExecutionTimeExceeded { .. } => codes::EXECUTION_TIME_EXCEEDED,
            Self::MemoryLimitExceeded { .. } => codes::MEMORY_LIMIT_EXCEEDED,
        }
    }
}

/// Direct-connection database errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("No direct database URL configured")]
    NotConfigured,

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    /// Error reported by the server, carrying its SQLSTATE.
    #[error("{message}")]
    Query {
        code: Option<String>,
        message: String,
        detail: Option<String>,
        hint: Option<String>,
    },

    #[error("Giving up after {attempts} attempts: {last}")]
    MaxRetriesExceeded {
        attempts: u32,
        last: Box<DatabaseError>,
    },
}

/// Substrings of driver messages that identify a transient network fault.
const TRANSIENT_MARKERS: &[&str] = &[
    "reset",
    "timed out",
    "timeout",
    "refused",
    "unreachable",
    "hang up",
    "broken pipe",
    "connection closed",
    "unexpected eof",
];

/// SQLSTATE 25P02: the session is stuck in a failed transaction block.
const IN_FAILED_TRANSACTION: &str = "25P02";

/// Connection exceptions (class 08) and sessions left inside an aborted
/// transaction. The statement never ran in either case.
fn is_stale_session(code: &str) -> bool {
    code.starts_with("08") || code == IN_FAILED_TRANSACTION
}

impl DatabaseError {
    pub fn code(&self) -> Cow<'_, str> {
        match self {
            Self::Query {
                code: Some(code), ..
            } => Cow::Borrowed(code.as_str()),
            Self::MaxRetriesExceeded { .. } => Cow::Borrowed(codes::MAX_RETRIES_EXCEEDED),
            Self::Timeout(_) | Self::Connection(_) | Self::Pool(_) | Self::NotConfigured => {
                Cow::Borrowed(codes::POOL_ERROR)
            }
            Self::Query { code: None, .. } => Cow::Borrowed(codes::INTERNAL_ERROR),
        }
    }

    /// Network-level faults that are expected to resolve on their own.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout(_) => true,
            Self::Pool(message) => {
                let lower = message.to_lowercase();
                TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
            }
            Self::Query {
                code: Some(code), ..
            } => is_stale_session(code),
            _ => false,
        }
    }

    /// Faults after which the pool's connections can no longer be trusted.
    pub fn is_connection_fault(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Query {
                code: Some(code), ..
            } => is_stale_session(code),
            _ => false,
        }
    }

    /// Classifies a driver error: server errors keep their SQLSTATE,
    /// everything else is a connection fault.
    pub fn from_postgres(err: &tokio_postgres::Error) -> Self {
        if let Some(db) = err.as_db_error() {
            return Self::Query {
                code: Some(db.code().code().to_string()),
                message: db.message().to_string(),
                detail: db.detail().map(String::from),
                hint: db.hint().map(String::from),
            };
        }
        if err.is_closed() {
            return Self::Connection(format!("connection closed: {err}"));
        }
        let message = err.to_string();
        let lower = message.to_lowercase();
        if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
            || std::error::Error::source(err).is_some_and(|s| s.is::<std::io::Error>())
        {
            Self::Connection(message)
        } else {
            Self::Query {
                code: None,
                message,
                detail: None,
                hint: None,
            }
        }
    }
}

impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        match err {
            deadpool_postgres::PoolError::Backend(e) => Self::from_postgres(&e),
            deadpool_postgres::PoolError::Timeout(kind) => {
                Self::Pool(format!("pool checkout timeout ({kind:?})"))
            }
            other => Self::Pool(other.to_string()),
        }
    }
}

/// REST gateway (PostgREST) errors.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Helper function not found: {0}")]
    FunctionNotFound(String),

    /// Error body returned by the REST gateway.
    #[error("{message}")]
    Api {
        status: u16,
        code: String,
        message: String,
        details: Option<String>,
        hint: Option<String>,
    },

    #[error("RPC transport error: {0}")]
    Transport(String),

    #[error("Unexpected RPC response format: {0}")]
    Format(String),

    #[error("RPC execution unavailable: {0}")]
    Unavailable(String),
}

impl RpcError {
    pub fn code(&self) -> Cow<'_, str> {
        match self {
            Self::Api { code, .. } => Cow::Borrowed(code.as_str()),
            Self::Format(_) => Cow::Borrowed(codes::RPC_FORMAT_ERROR),
            Self::FunctionNotFound(_) | Self::Transport(_) | Self::Unavailable(_) => {
                Cow::Borrowed(codes::RPC_UNAVAILABLE)
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(Cow<'static, str>),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        field: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    #[error("Invalid database URL: {0}")]
    InvalidDatabaseUrl(String),
}

/// Structured error returned to callers in place of rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Result type alias for GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Result type alias for DatabaseError.
pub type DbResult<T> = std::result::Result<T, DatabaseError>;

/// Result type alias for RpcError.
pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Result type alias for SecurityError.
pub type SecurityResult<T> = std::result::Result<T, SecurityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_error_codes() {
        assert_eq!(
            SecurityError::InjectionDetected("x".into()).code(),
            "INJECTION_DETECTED"
        );
        assert_eq!(
            SecurityError::QueryTooLong { length: 2, max: 1 }.code(),
            "QUERY_TOO_LONG"
        );
        assert_eq!(
            SecurityError::UnbalancedQuoting('\'').code(),
            "UNBALANCED_QUOTING"
        );
        assert_eq!(
            SecurityError::InvalidIdentifier("1x".into()).code(),
            "INVALID_IDENTIFIER"
        );
    }

    #[test]
    fn test_database_code_passthrough() {
        let err: GatewayError = DatabaseError::Query {
            code: Some("23505".into()),
            message: "duplicate key value violates unique constraint".into(),
            detail: Some("Key (id)=(1) already exists.".into()),
            hint: None,
        }
        .into();
        let body = err.to_body();
        assert_eq!(body.code, "23505");
        assert_eq!(body.details.as_deref(), Some("Key (id)=(1) already exists."));
    }

    #[test]
    fn test_transient_classification() {
        assert!(DatabaseError::Connection("connection reset by peer".into()).is_transient());
        assert!(DatabaseError::Timeout(100).is_transient());
        assert!(
            DatabaseError::Query {
                code: Some("08006".into()),
                message: "connection failure".into(),
                detail: None,
                hint: None,
            }
            .is_transient()
        );
        assert!(
            !DatabaseError::Query {
                code: Some("42501".into()),
                message: "permission denied for table users".into(),
                detail: None,
                hint: None,
            }
            .is_transient()
        );
        assert!(!DatabaseError::Timeout(100).is_connection_fault());
    }

    #[test]
    fn test_aborted_transaction_session_is_rebuilt() {
        let err = DatabaseError::Query {
            code: Some("25P02".into()),
            message: "current transaction is aborted, commands ignored until end of transaction block".into(),
            detail: None,
            hint: None,
        };
        assert!(err.is_connection_fault());
        assert!(err.is_transient());

        let failed_statement = DatabaseError::Query {
            code: Some("22012".into()),
            message: "division by zero".into(),
            detail: None,
            hint: None,
        };
        assert!(!failed_statement.is_connection_fault());
        assert!(!failed_statement.is_transient());
    }

    #[test]
    fn test_rate_limited_body_carries_retry_after() {
        let err: GatewayError = LimitError::RateLimited {
            limit: 3,
            remaining: 0,
            retry_after_secs: 7,
        }
        .into();
        let body = err.to_body();
        assert_eq!(body.code, "RATE_LIMITED");
        assert_eq!(body.retry_after, Some(7));
    }

    #[test]
    fn test_error_body_serialization_skips_empty_fields() {
        let err: GatewayError = RpcError::Format("expected array".into()).into();
        let json = serde_json::to_value(err.to_body()).unwrap();
        assert_eq!(json["code"], "RPC_FORMAT_ERROR");
        assert!(json.get("hint").is_none());
    }
}
