//! Connection and transaction data models.

use serde::{Deserialize, Serialize};

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }

    /// Statement used for connectivity checks.
    pub fn ping_statement(&self) -> &'static str {
        "SELECT 1"
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Transaction isolation level requested by the caller of
/// [`run_in_transaction_with_isolation`](crate::db::QueryExecutor::run_in_transaction_with_isolation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL keyword form, as used in `SET TRANSACTION ISOLATION LEVEL ...`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Lifecycle of a transaction run by the orchestrator.
///
/// `Opening -> Active -> Committing | RollingBack -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Opening,
    Active,
    Committing,
    RollingBack,
    Closed,
}

impl TransactionState {
    /// Check if the transaction is still active.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Whether moving from `self` to `next` is a legal step.
    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, next),
            (Opening, Active)
                | (Opening, Closed)
                | (Active, Committing)
                | (Active, RollingBack)
                | (Committing, Closed)
                | (Committing, RollingBack)
                | (RollingBack, Closed)
        )
    }
}
