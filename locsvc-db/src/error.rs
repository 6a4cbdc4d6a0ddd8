//! Error taxonomy for the data-access layer.
//!
//! One enum covers configuration, pool, transport and SQL failures so the
//! HTTP layer can map outcomes mechanically:
//!
//! | variant                                   | HTTP |
//! |-------------------------------------------|------|
//! | `NotFound`                                | 404  |
//! | `PoolExhausted`, `ConnectTimeout`, `PoolClosed`, `Connection` | 503 |
//! | everything else                           | 500  |
//!
//! Telemetry failures live in [`TelemetryError`]; they are logged and
//! swallowed, never returned from a database operation.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for data-access operations
pub type DbResult<T> = std::result::Result<T, DbError>;

/// Main error type for pool, executor and repository operations
#[derive(Error, Debug)]
pub enum DbError {
    /// Malformed or contradictory configuration (fatal at startup)
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// No connection became available before the acquire deadline
    #[error("pool exhausted: no connection available after {waited:?} ({max_connections} max)")]
    PoolExhausted {
        waited: Duration,
        max_connections: u32,
    },

    /// Establishing a physical connection did not finish in time
    #[error("connect timeout after {elapsed:?}")]
    ConnectTimeout { elapsed: Duration },

    /// The pool has been closed
    #[error("connection pool is closed")]
    PoolClosed,

    /// Transport-level failure; the physical connection is discarded
    #[error("connection error: {reason}")]
    Connection { reason: String },

    /// The read matched no row
    #[error("not found: {resource} '{id}'")]
    NotFound { resource: &'static str, id: String },

    /// The database rejected the statement
    #[error("execution error{}: {message}", sql_state.as_deref().map(|s| format!(" [{s}]")).unwrap_or_default())]
    Execution {
        message: String,
        sql_state: Option<String>,
    },

    /// A row did not have the expected shape
    #[error("decode error on column '{column}': {reason}")]
    Decode { column: String, reason: String },
}

impl DbError {
    /// Create a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a transport error
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Create an execution error with an optional SQLSTATE code
    pub fn execution(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Execution {
            message: message.into(),
            sql_state,
        }
    }

    /// Create a decode error
    pub fn decode(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            column: column.into(),
            reason: reason.into(),
        }
    }

    /// True for the expected "no such entity" outcome
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for service-unavailable class errors (pool and transport)
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. }
                | Self::ConnectTimeout { .. }
                | Self::PoolClosed
                | Self::Connection { .. }
        )
    }

    /// True when the physical connection can no longer be trusted
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::ConnectTimeout { .. })
    }

    /// SQLSTATE reported by the database, when there is one
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Execution { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Whether tracing should mark a span carrying this error as failed
    pub fn is_reportable(&self) -> bool {
        !self.is_not_found()
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::not_found("row", String::new()),
            sqlx::Error::Database(db_err) => Self::Execution {
                sql_state: db_err.code().map(|code| code.into_owned()),
                message: db_err.message().to_owned(),
            },
            sqlx::Error::Configuration(e) => Self::configuration(e.to_string()),
            sqlx::Error::ColumnNotFound(column) => Self::decode(column, "column not found"),
            sqlx::Error::ColumnDecode { index, source } => Self::decode(index, source.to_string()),
            sqlx::Error::Decode(e) => Self::decode("?", e.to_string()),
            sqlx::Error::PoolTimedOut => Self::ConnectTimeout {
                elapsed: Duration::ZERO,
            },
            sqlx::Error::PoolClosed => Self::PoolClosed,
            other @ (sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed) => Self::connection(other.to_string()),
            other => Self::execution(other.to_string(), None),
        }
    }
}

/// Failure to deliver an instrumentation event; never propagated
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// The collector rejected or dropped the record
    #[error("telemetry sink rejected event: {reason}")]
    Rejected { reason: String },

    /// The exporter pipeline could not be built or shut down
    #[error("telemetry pipeline error: {reason}")]
    Pipeline { reason: String },
}

impl TelemetryError {
    /// Create a rejected-event error
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Create a pipeline error
    pub fn pipeline(reason: impl Into<String>) -> Self {
        Self::Pipeline {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::not_found("location", "42");
        assert_eq!(err.to_string(), "not found: location '42'");

        let err = DbError::execution("duplicate key", Some("23505".to_string()));
        assert_eq!(err.to_string(), "execution error [23505]: duplicate key");

        let err = DbError::execution("boom", None);
        assert_eq!(err.to_string(), "execution error: boom");
    }

    #[test]
    fn test_http_mapping_predicates() {
        assert!(DbError::not_found("location", "x").is_not_found());
        assert!(!DbError::not_found("location", "x").is_reportable());

        let exhausted = DbError::PoolExhausted {
            waited: Duration::from_secs(1),
            max_connections: 10,
        };
        assert!(exhausted.is_unavailable());
        assert!(DbError::ConnectTimeout {
            elapsed: Duration::from_secs(5)
        }
        .is_unavailable());
        assert!(DbError::PoolClosed.is_unavailable());

        let exec = DbError::execution("syntax error", Some("42601".to_string()));
        assert!(!exec.is_unavailable());
        assert!(exec.is_reportable());
        assert_eq!(exec.sql_state(), Some("42601"));
    }

    #[test]
    fn test_sqlx_row_not_found_becomes_not_found() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_sqlx_io_error_is_fatal_to_connection() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: DbError = sqlx::Error::Io(io).into();
        assert!(matches!(err, DbError::Connection { .. }));
        assert!(err.is_fatal_to_connection());
    }
}
