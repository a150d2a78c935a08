//! Error types for sqlgate.
//!
//! All fallible operations return [`DbResult`]. Variants follow the failure
//! classes callers care about: configuration problems are fatal at startup,
//! connection and timeout failures may be retried by the caller, everything
//! else is reported as-is.

use thiserror::Error;

/// Constructors for the variants that carry only a message.
macro_rules! message_constructors {
    ($($name:ident => $variant:ident),+ $(,)?) => {
        $(
            pub fn $name(message: impl Into<String>) -> Self {
                Self::$variant {
                    message: message.into(),
                }
            }
        )+
    };
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Query failed: {message}")]
    Query {
        message: String,
        /// e.g., "23505" for a unique violation
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Failed to decode result: {message}")]
    Decode { message: String },

    #[error("Expected at most one row but the query returned {rows} or more")]
    Cardinality { rows: usize },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    message_constructors! {
        configuration => Configuration,
        decode => Decode,
        invalid_input => InvalidInput,
        internal => Internal,
    }

    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// `sql_state` is the backend's error code (SQLSTATE, or the extended
    /// result code on SQLite).
    pub fn query(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Query {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// A single-row read matched `rows` rows.
    pub fn cardinality(rows: usize) -> Self {
        Self::Cardinality { rows }
    }

    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Hint for the operator, present on connection and query failures.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Query { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// SQLSTATE reported by the database, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Query { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Connection and timeout failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

/// Classify driver errors by what the caller can do about them.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let suggestion = if db_err.is_unique_violation()
                    || db_err.is_foreign_key_violation()
                    || db_err.is_check_violation()
                {
                    "The statement violates a constraint; check the bound values"
                } else {
                    "Check the SQL syntax and referenced objects"
                };
                DbError::query(db_err.message(), code, suggestion)
            }
            sqlx::Error::RowNotFound => DbError::query(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::connection(
                "Timed out waiting for a pooled connection",
                "Check that the database server is reachable or raise acquire_timeout",
            ),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Recreate the connection factory")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::decode(format!("Type not found: {}", type_name))
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::decode(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::decode(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::decode(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::decode(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Row mapping goes through serde_json, so its errors are decode failures.
impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::decode(err.to_string())
    }
}

pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("refused", "Start the server");
        assert_eq!(err.to_string(), "Connection failed: refused");

        let err = DbError::cardinality(2);
        assert!(err.to_string().contains("at most one row"));

        let err = DbError::transaction("Commit failed: disk full", "tx_42");
        assert!(err.to_string().ends_with("(transaction: tx_42)"));
    }

    #[test]
    fn test_query_error_details() {
        let err = DbError::query(
            "duplicate key value violates unique constraint",
            Some("23505".to_string()),
            "Use a different student number",
        );
        assert_eq!(err.suggestion(), Some("Use a different student number"));
        assert_eq!(err.sql_state(), Some("23505"));
        assert_eq!(DbError::decode("bad").suggestion(), None);
        assert_eq!(DbError::invalid_input("x").sql_state(), None);
    }

    #[test]
    fn test_retryable_classes() {
        assert!(DbError::timeout("write operation", 5).is_retryable());
        assert!(DbError::connection("reset", "retry").is_retryable());
        assert!(!DbError::configuration("missing").is_retryable());
        assert!(!DbError::cardinality(3).is_retryable());
        assert!(!DbError::query("syntax", None, "fix it").is_retryable());
    }

    #[test]
    fn test_sqlx_error_classification() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DbError::Query { .. }));

        // The pool's own acquire_timeout applies, so no duration is claimed
        let err: DbError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, DbError::Connection { .. }));
        assert!(!err.to_string().contains("30"));
        assert!(err.is_retryable());

        let err: DbError = sqlx::Error::ColumnNotFound("Name".to_string()).into();
        assert!(matches!(err, DbError::Decode { .. }));
    }

    #[test]
    fn test_serde_error_maps_to_decode() {
        let serde_err = serde_json::from_str::<i64>("\"text\"").unwrap_err();
        let err: DbError = serde_err.into();
        assert!(matches!(err, DbError::Decode { .. }));
    }
}
