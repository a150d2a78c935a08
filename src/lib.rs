//! sqlgate library
//!
//! A relational database access layer over `sqlx` for SQLite, PostgreSQL and
//! MySQL: connection factories, a query executor mapping rows to typed values,
//! and callback-scoped transactions that commit or roll back as a unit.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use db::{QueryExecutor, TransactionExecutor};
pub use error::{DbError, DbResult};
pub use models::{IsolationLevel, QueryParam, QueryRequest, params};
