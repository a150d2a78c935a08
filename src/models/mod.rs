//! Data models for sqlgate.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{DatabaseType, IsolationLevel, TransactionState};
pub use query::{
    ColumnMetadata, DEFAULT_QUERY_TIMEOUT_SECS, MAX_QUERY_TIMEOUT_SECS, Params, QueryParam,
    QueryRequest, Record, RowSet, Table, normalize_param_name, params,
};
