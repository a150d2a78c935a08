//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Connection factories, one per supported backend
//! - Query execution with named parameters
//! - Callback-scoped transactions
//! - Row decoding into typed and tabular results
//! - Database dispatch macros for reducing code duplication

#[macro_use]
pub mod macros;
pub mod cursor;
pub mod executor;
pub mod factory;
pub mod params;
pub mod transaction;
pub mod types;

pub use cursor::MultiResultCursor;
pub use executor::QueryExecutor;
pub use factory::{
    Connection, ConnectionFactory, MySqlConnectionFactory, OpenConnection,
    PostgresConnectionFactory, SqliteConnectionFactory, connection_factory,
    factory_from_connection_string,
};
pub use transaction::TransactionExecutor;
