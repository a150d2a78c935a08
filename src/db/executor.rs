//! Query execution engine.
//!
//! [`QueryExecutor`] is the entry point for non-transactional work. Every
//! operation opens its own connection from the factory, runs its statement(s)
//! and releases the connection before returning, so concurrent operations never
//! share a connection or observe each other's uncommitted state.
//!
//! # Architecture
//!
//! Statement execution is split in two layers:
//! - free functions over an [`OpenConnection`] (`fetch`, `execute_statement`,
//!   `execute_batch_on`) shared with the transaction executor
//! - database-specific submodules (`mysql`, `postgres`, `sqlite`) that bind
//!   parameters and talk to the driver
//!
//! Each submodule provides identical functionality adapted to its backend.

use crate::config::DatabaseConfig;
use crate::db::cursor::MultiResultCursor;
use crate::db::factory::{ConnectionFactory, OpenConnection, connection_factory};
use crate::db::params::{
    self, CompiledQuery, bind_mysql_param, bind_postgres_param, bind_sqlite_param,
};
use crate::db::types::decode_rows;
use crate::error::{DbError, DbResult};
use crate::models::{
    DEFAULT_QUERY_TIMEOUT_SECS, DatabaseType, MAX_QUERY_TIMEOUT_SECS, Params, QueryRequest,
    RowSet, Table,
};
use futures_util::future::BoxFuture;
use futures_util::{StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Query executor that handles non-transactional database work.
#[derive(Clone)]
pub struct QueryExecutor {
    factory: Arc<dyn ConnectionFactory>,
    default_timeout: Duration,
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("db_type", &self.factory.db_type())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl QueryExecutor {
    /// Create a new query executor with the default statement timeout.
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            default_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS as u64),
        }
    }

    /// Create a query executor with a custom default statement timeout,
    /// capped at [`MAX_QUERY_TIMEOUT_SECS`].
    pub fn with_default_timeout(factory: Arc<dyn ConnectionFactory>, default_timeout: Duration) -> Self {
        Self {
            factory,
            default_timeout: default_timeout.min(Duration::from_secs(MAX_QUERY_TIMEOUT_SECS as u64)),
        }
    }

    /// Build the factory for `config` and wrap it in an executor.
    pub fn from_config(
        config: &DatabaseConfig,
        connect_timeout: Duration,
        default_timeout: Duration,
    ) -> DbResult<Self> {
        let factory = connection_factory(config, connect_timeout)?;
        Ok(Self::with_default_timeout(factory, default_timeout))
    }

    pub fn db_type(&self) -> DatabaseType {
        self.factory.db_type()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub(crate) async fn open(&self) -> DbResult<OpenConnection> {
        self.factory.create()?.open().await
    }

    /// Fetch the only matching row. More than one row is a cardinality
    /// error; no rows yields `None`.
    pub async fn query_single<T: DeserializeOwned>(
        &self,
        request: &QueryRequest,
    ) -> DbResult<Option<T>> {
        let mut conn = self.open().await?;
        fetch(&mut conn, request, self.default_timeout, Some(2))
            .await?
            .single()
    }

    /// Fetch the first row, ignoring any others.
    pub async fn query_first<T: DeserializeOwned>(
        &self,
        request: &QueryRequest,
    ) -> DbResult<Option<T>> {
        let mut conn = self.open().await?;
        fetch(&mut conn, request, self.default_timeout, Some(1))
            .await?
            .first()
    }

    /// Fetch every row, in result order.
    pub async fn query_many<T: DeserializeOwned>(&self, request: &QueryRequest) -> DbResult<Vec<T>> {
        let mut conn = self.open().await?;
        fetch(&mut conn, request, self.default_timeout, None)
            .await?
            .deserialize_all()
    }

    /// Execute a statement with side effects and return the affected row count.
    pub async fn execute(&self, request: &QueryRequest) -> DbResult<u64> {
        let mut conn = self.open().await?;
        execute_statement(&mut conn, request, self.default_timeout).await
    }

    /// Run `request` once per parameter set on a single connection and return
    /// the total affected row count.
    ///
    /// Each set is layered over `request.params`. Outside a transaction the
    /// batch is not atomic: statements before a failing one stay applied.
    pub async fn execute_batch(&self, request: &QueryRequest, param_sets: &[Params]) -> DbResult<u64> {
        if param_sets.is_empty() {
            return Ok(0);
        }
        let mut conn = self.open().await?;
        execute_batch_on(&mut conn, request, param_sets, self.default_timeout).await
    }

    /// First column of the first row, converted to `T`.
    ///
    /// NULL or an empty result only converts into types that accept null
    /// (such as `Option<_>`); anything else is a decode error.
    pub async fn execute_scalar<T: DeserializeOwned>(&self, request: &QueryRequest) -> DbResult<T> {
        let mut conn = self.open().await?;
        fetch(&mut conn, request, self.default_timeout, Some(1))
            .await?
            .scalar()
    }

    /// First column of the first row, or `None` for NULL or no rows.
    pub async fn execute_scalar_or_default<T: DeserializeOwned>(
        &self,
        request: &QueryRequest,
    ) -> DbResult<Option<T>> {
        let mut conn = self.open().await?;
        fetch(&mut conn, request, self.default_timeout, Some(1))
            .await?
            .scalar_or_default()
    }

    /// Fetch every row into a loosely typed grid.
    pub async fn query_as_table(&self, request: &QueryRequest) -> DbResult<Table> {
        let mut conn = self.open().await?;
        Ok(fetch(&mut conn, request, self.default_timeout, None)
            .await?
            .into_table())
    }

    /// Split `request` into its `;`-separated statements and lend `reader` a
    /// cursor that runs them on one connection, in order, as it reads.
    ///
    /// Every statement contributes exactly one row-set, empty for statements
    /// that return no rows. Statements the reader never reads are never run.
    /// The connection is released once `reader` returns.
    ///
    /// ```ignore
    /// let (students, total) = executor
    ///     .query_multiple(&request, |cursor| {
    ///         Box::pin(async move {
    ///             let students: Vec<Student> = cursor.read().await?;
    ///             let total: Option<Count> = cursor.read_single().await?;
    ///             Ok((students, total))
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn query_multiple<T, R>(&self, request: &QueryRequest, reader: R) -> DbResult<T>
    where
        R: for<'c> FnOnce(&'c mut MultiResultCursor) -> BoxFuture<'c, DbResult<T>>,
    {
        let db_type = self.db_type();
        let statements: Vec<String> = params::split_statements(&request.sql, db_type)?
            .into_iter()
            .map(str::to_string)
            .collect();
        let query_timeout = request.effective_timeout(self.default_timeout);

        debug!(
            statements = statements.len(),
            params = request.params.len(),
            timeout_secs = query_timeout.as_secs(),
            "Executing multi-statement query"
        );

        let conn = self.open().await?;
        let mut cursor =
            MultiResultCursor::new(conn, statements, request.params.clone(), query_timeout);
        reader(&mut cursor).await
    }

    /// Lend a freshly opened connection to `op` and release it afterwards,
    /// whatever `op` returns.
    ///
    /// The raw driver connection is reachable through
    /// [`OpenConnection::as_sqlite`] and friends.
    pub async fn with_connection<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut OpenConnection) -> BoxFuture<'c, Result<T, E>>,
        E: From<DbError>,
    {
        let mut conn = self.open().await?;
        op(&mut conn).await
    }

    /// Open a connection and run a trivial round trip.
    ///
    /// Returns `false` on any failure instead of an error.
    pub async fn test_connection(&self) -> bool {
        let round_trip = async {
            let mut conn = self.open().await?;
            let ping = QueryRequest::new(conn.db_type().ping_statement());
            fetch(&mut conn, &ping, self.default_timeout, Some(1)).await
        };
        match round_trip.await {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    db_type = %self.db_type(),
                    error = %e,
                    suggestion = e.suggestion().unwrap_or_default(),
                    "Connection test failed"
                );
                false
            }
        }
    }
}

// =============================================================================
// Statement Execution
// =============================================================================

/// Run a row-returning statement, keeping at most `limit` rows.
pub(crate) async fn fetch(
    conn: &mut OpenConnection,
    request: &QueryRequest,
    default_timeout: Duration,
    limit: Option<usize>,
) -> DbResult<RowSet> {
    let compiled = params::compile(&request.sql, &request.params, conn.db_type())?;
    let query_timeout = request.effective_timeout(default_timeout);

    debug!(
        sql = %request.sql,
        params = request.params.len(),
        limit = ?limit,
        timeout_secs = query_timeout.as_secs(),
        "Executing query"
    );

    fetch_compiled(conn, &compiled, limit, query_timeout).await
}

pub(crate) async fn fetch_compiled(
    conn: &mut OpenConnection,
    compiled: &CompiledQuery<'_>,
    limit: Option<usize>,
    query_timeout: Duration,
) -> DbResult<RowSet> {
    let start = Instant::now();
    let rows = async {
        impl_db_dispatch!(conn, {
            MySql(c) => decode_rows(&mysql::fetch_rows(c, compiled, limit).await?),
            Postgres(c) => decode_rows(&postgres::fetch_rows(c, compiled, limit).await?),
            SQLite(c) => decode_rows(&sqlite::fetch_rows(c, compiled, limit).await?),
        })
    };

    match timeout(query_timeout, rows).await {
        Ok(Ok(set)) => {
            debug!(
                rows = set.records.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Query complete"
            );
            Ok(set)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(timeout_error("query execution", query_timeout)),
    }
}

/// Run a statement with side effects and return the affected row count.
pub(crate) async fn execute_statement(
    conn: &mut OpenConnection,
    request: &QueryRequest,
    default_timeout: Duration,
) -> DbResult<u64> {
    let compiled = params::compile(&request.sql, &request.params, conn.db_type())?;
    let query_timeout = request.effective_timeout(default_timeout);

    debug!(
        sql = %request.sql,
        params = request.params.len(),
        timeout_secs = query_timeout.as_secs(),
        "Executing write operation"
    );

    execute_compiled(conn, &compiled, query_timeout).await
}

async fn execute_compiled(
    conn: &mut OpenConnection,
    compiled: &CompiledQuery<'_>,
    query_timeout: Duration,
) -> DbResult<u64> {
    let result = impl_db_dispatch!(conn, {
        MySql(c) => timeout(query_timeout, mysql::execute(c, compiled)).await,
        Postgres(c) => timeout(query_timeout, postgres::execute(c, compiled)).await,
        SQLite(c) => timeout(query_timeout, sqlite::execute(c, compiled)).await,
    });

    match result {
        Ok(Ok(rows_affected)) => Ok(rows_affected),
        Ok(Err(e)) => Err(DbError::from(e)),
        Err(_) => Err(timeout_error("write operation", query_timeout)),
    }
}

/// Run `request` once per parameter set, in order, and sum affected rows.
pub(crate) async fn execute_batch_on(
    conn: &mut OpenConnection,
    request: &QueryRequest,
    param_sets: &[Params],
    default_timeout: Duration,
) -> DbResult<u64> {
    let db_type = conn.db_type();
    let query_timeout = request.effective_timeout(default_timeout);

    debug!(
        sql = %request.sql,
        batch_size = param_sets.len(),
        timeout_secs = query_timeout.as_secs(),
        "Executing batch"
    );

    let mut total = 0;
    for set in param_sets {
        let mut merged = request.params.clone();
        merged.extend(set.iter().map(|(k, v)| (k.clone(), v.clone())));
        let compiled = params::compile(&request.sql, &merged, db_type)?;
        total += execute_compiled(conn, &compiled, query_timeout).await?;
    }
    Ok(total)
}

fn timeout_error(operation: &str, timeout: Duration) -> DbError {
    DbError::timeout(operation, timeout.as_secs() as u32)
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database type.
// Without arguments the text is sent unprepared, since some statements (and
// multi-statement scripts) cannot be prepared.

macro_rules! backend_module {
    ($name:ident, $conn:ty, $row:ty, $bind:ident) => {
        mod $name {
            use super::*;
            use sqlx::Executor;

            pub async fn fetch_rows(
                conn: &mut $conn,
                compiled: &CompiledQuery<'_>,
                limit: Option<usize>,
            ) -> Result<Vec<$row>, sqlx::Error> {
                let limit = limit.unwrap_or(usize::MAX);
                if compiled.is_raw() {
                    conn.fetch(compiled.sql.as_str())
                        .take(limit)
                        .try_collect()
                        .await
                } else {
                    let mut query = sqlx::query(&compiled.sql);
                    for param in &compiled.args {
                        query = $bind(query, *param);
                    }
                    query.fetch(conn).take(limit).try_collect().await
                }
            }

            pub async fn execute(
                conn: &mut $conn,
                compiled: &CompiledQuery<'_>,
            ) -> Result<u64, sqlx::Error> {
                let result = if compiled.is_raw() {
                    conn.execute(compiled.sql.as_str()).await?
                } else {
                    let mut query = sqlx::query(&compiled.sql);
                    for param in &compiled.args {
                        query = $bind(query, *param);
                    }
                    query.execute(conn).await?
                };
                Ok(result.rows_affected())
            }
        }
    };
}

backend_module!(
    mysql,
    sqlx::MySqlConnection,
    sqlx::mysql::MySqlRow,
    bind_mysql_param
);
backend_module!(
    postgres,
    sqlx::PgConnection,
    sqlx::postgres::PgRow,
    bind_postgres_param
);
backend_module!(
    sqlite,
    sqlx::SqliteConnection,
    sqlx::sqlite::SqliteRow,
    bind_sqlite_param
);
