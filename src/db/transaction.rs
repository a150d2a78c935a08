//! Callback-scoped transactions.
//!
//! [`QueryExecutor::run_in_transaction`] opens a connection, begins a
//! transaction and lends a [`TransactionExecutor`] to the caller's unit of
//! work. The transaction commits when the unit of work returns `Ok` and rolls
//! back when it returns `Err`; the original error is always what the caller
//! sees. A statement that failed on the server poisons the transaction: even
//! if the unit of work swallows the error and returns `Ok`, nothing is
//! committed. If the orchestrating future is dropped (or the unit of work
//! panics) before the transaction closes, its connection is discarded rather
//! than returned to the pool, so the open transaction dies with it.

use crate::db::executor::{QueryExecutor, execute_batch_on, execute_statement, fetch};
use crate::db::factory::OpenConnection;
use crate::error::{DbError, DbResult};
use crate::models::{
    DatabaseType, IsolationLevel, Params, QueryRequest, RowSet, Table, TransactionState,
};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

/// Generate a unique transaction ID.
pub(crate) fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

/// Statements that open a transaction at `isolation` on `db_type`.
fn begin_statements(db_type: DatabaseType, isolation: IsolationLevel) -> Vec<String> {
    match db_type {
        DatabaseType::PostgreSQL => vec![format!("BEGIN ISOLATION LEVEL {}", isolation.as_sql())],
        DatabaseType::MySQL => vec![
            format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql()),
            "START TRANSACTION".to_string(),
        ],
        // SQLite transactions are always serializable; the levels only pick
        // the locking mode and whether shared-cache reads may be dirty
        DatabaseType::SQLite => match isolation {
            IsolationLevel::ReadUncommitted => vec![
                "PRAGMA read_uncommitted = true".to_string(),
                "BEGIN".to_string(),
            ],
            IsolationLevel::Serializable => vec!["BEGIN IMMEDIATE".to_string()],
            IsolationLevel::ReadCommitted | IsolationLevel::RepeatableRead => {
                vec!["BEGIN".to_string()]
            }
        },
    }
}

/// Session state to undo once the transaction has ended.
fn reset_statement(db_type: DatabaseType, isolation: IsolationLevel) -> Option<&'static str> {
    match (db_type, isolation) {
        (DatabaseType::SQLite, IsolationLevel::ReadUncommitted) => {
            Some("PRAGMA read_uncommitted = false")
        }
        _ => None,
    }
}

/// Statement executor bound to one open transaction.
///
/// Only obtainable inside a unit of work passed to
/// [`QueryExecutor::run_in_transaction`], and only as a borrow that ends when
/// the unit of work's future completes. Every call runs on the transaction's
/// connection, in the order issued.
pub struct TransactionExecutor<'a> {
    executor: &'a QueryExecutor,
    conn: Option<OpenConnection>,
    id: String,
    isolation: IsolationLevel,
    state: TransactionState,
    /// First server-side statement failure seen by the unit of work
    failure: Option<String>,
}

impl<'a> TransactionExecutor<'a> {
    async fn begin(executor: &'a QueryExecutor, isolation: IsolationLevel) -> DbResult<Self> {
        let conn = executor.open().await?;
        let db_type = conn.db_type();
        let mut tx = Self {
            executor,
            conn: Some(conn),
            id: generate_transaction_id(),
            isolation,
            state: TransactionState::Opening,
            failure: None,
        };

        for statement in begin_statements(db_type, isolation) {
            if let Err(e) = tx.run_control(&statement).await {
                warn!(
                    transaction_id = %tx.id,
                    error = %e,
                    "Failed to begin transaction"
                );
                tx.finish(true);
                return Err(e);
            }
        }

        tx.transition(TransactionState::Active);
        info!(
            transaction_id = %tx.id,
            db_type = %db_type,
            isolation = %isolation,
            "Transaction started"
        );
        Ok(tx)
    }

    /// Identifier used in log lines for this transaction.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn db_type(&self) -> DatabaseType {
        self.executor.db_type()
    }

    fn transition(&mut self, next: TransactionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transaction transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(transaction_id = %self.id, from = ?self.state, to = ?next, "Transaction state");
        self.state = next;
    }

    /// The connection, for statements issued by the unit of work.
    fn active_conn(&mut self) -> DbResult<&mut OpenConnection> {
        if !self.state.is_active() {
            return Err(DbError::transaction(
                format!("Transaction is not active ({:?})", self.state),
                &self.id,
            ));
        }
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::transaction("Transaction has no connection", &self.id))
    }

    /// Remember a failed statement. Client-side failures (bad input, row
    /// mapping, cardinality) leave the server transaction intact.
    fn track<T>(&mut self, result: DbResult<T>) -> DbResult<T> {
        if let Err(e) = &result {
            let server_side = matches!(
                e,
                DbError::Query { .. }
                    | DbError::Connection { .. }
                    | DbError::Timeout { .. }
                    | DbError::Internal { .. }
            );
            if server_side && self.failure.is_none() {
                debug!(transaction_id = %self.id, error = %e, "Statement failed inside transaction");
                self.failure = Some(e.to_string());
            }
        }
        result
    }

    /// Run a transaction control statement regardless of state.
    async fn run_control(&mut self, sql: &str) -> DbResult<()> {
        let default_timeout = self.executor.default_timeout();
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| DbError::transaction("Transaction has no connection", &self.id))?;
        execute_statement(conn, &QueryRequest::new(sql), default_timeout).await?;
        Ok(())
    }

    /// Release the connection and enter `Closed`. A connection whose session
    /// state is uncertain is discarded instead of returned to the pool.
    fn finish(&mut self, discard: bool) {
        if let Some(conn) = self.conn.take() {
            if discard {
                conn.discard();
            }
        }
        self.transition(TransactionState::Closed);
    }

    /// Undo per-transaction session settings. Returns whether the connection
    /// is clean enough to go back to the pool.
    async fn reset_session(&mut self) -> bool {
        let Some(statement) = reset_statement(self.db_type(), self.isolation) else {
            return true;
        };
        match self.run_control(statement).await {
            Ok(()) => true,
            Err(e) => {
                warn!(transaction_id = %self.id, error = %e, "Failed to reset session state");
                false
            }
        }
    }

    async fn commit(&mut self) -> DbResult<()> {
        if let Some(failure) = self.failure.take() {
            warn!(
                transaction_id = %self.id,
                failure = %failure,
                "Unit of work succeeded after a failed statement; rolling back"
            );
            self.rollback().await;
            return Err(DbError::transaction(
                format!("Not committed because a statement failed: {}", failure),
                &self.id,
            ));
        }
        self.transition(TransactionState::Committing);
        match self.run_control("COMMIT").await {
            Ok(()) => {
                let clean = self.reset_session().await;
                self.finish(!clean);
                info!(transaction_id = %self.id, "Transaction committed");
                Ok(())
            }
            Err(e) => {
                error!(transaction_id = %self.id, error = %e, "Commit failed, rolling back");
                self.transition(TransactionState::RollingBack);
                if let Err(rollback_err) = self.run_control("ROLLBACK").await {
                    error!(
                        transaction_id = %self.id,
                        error = %rollback_err,
                        "Rollback after failed commit also failed"
                    );
                }
                self.finish(true);
                Err(DbError::transaction(format!("Commit failed: {}", e), &self.id))
            }
        }
    }

    /// Roll back, logging (never returning) a rollback failure.
    async fn rollback(&mut self) {
        self.transition(TransactionState::RollingBack);
        match self.run_control("ROLLBACK").await {
            Ok(()) => {
                let clean = self.reset_session().await;
                self.finish(!clean);
                info!(transaction_id = %self.id, "Transaction rolled back");
            }
            Err(e) => {
                error!(
                    transaction_id = %self.id,
                    error = %e,
                    "Rollback failed; discarding connection"
                );
                self.finish(true);
            }
        }
    }

    /// Fetch the only matching row; more than one row is a cardinality error.
    pub async fn query_single<T: DeserializeOwned>(
        &mut self,
        request: &QueryRequest,
    ) -> DbResult<Option<T>> {
        self.fetch(request, Some(2)).await?.single()
    }

    /// Fetch the first row, ignoring any others.
    pub async fn query_first<T: DeserializeOwned>(
        &mut self,
        request: &QueryRequest,
    ) -> DbResult<Option<T>> {
        self.fetch(request, Some(1)).await?.first()
    }

    pub async fn query_many<T: DeserializeOwned>(
        &mut self,
        request: &QueryRequest,
    ) -> DbResult<Vec<T>> {
        self.fetch(request, None).await?.deserialize_all()
    }

    pub async fn execute(&mut self, request: &QueryRequest) -> DbResult<u64> {
        let default_timeout = self.executor.default_timeout();
        let result = execute_statement(self.active_conn()?, request, default_timeout).await;
        self.track(result)
    }

    /// Run `request` once per parameter set and return the total affected
    /// row count. Atomic with the rest of the transaction.
    pub async fn execute_batch(
        &mut self,
        request: &QueryRequest,
        param_sets: &[Params],
    ) -> DbResult<u64> {
        let default_timeout = self.executor.default_timeout();
        let result =
            execute_batch_on(self.active_conn()?, request, param_sets, default_timeout).await;
        self.track(result)
    }

    pub async fn execute_scalar<T: DeserializeOwned>(
        &mut self,
        request: &QueryRequest,
    ) -> DbResult<T> {
        self.fetch(request, Some(1)).await?.scalar()
    }

    pub async fn execute_scalar_or_default<T: DeserializeOwned>(
        &mut self,
        request: &QueryRequest,
    ) -> DbResult<Option<T>> {
        self.fetch(request, Some(1)).await?.scalar_or_default()
    }

    pub async fn query_as_table(&mut self, request: &QueryRequest) -> DbResult<Table> {
        Ok(self.fetch(request, None).await?.into_table())
    }

    async fn fetch(&mut self, request: &QueryRequest, limit: Option<usize>) -> DbResult<RowSet> {
        let default_timeout = self.executor.default_timeout();
        let result = fetch(self.active_conn()?, request, default_timeout, limit).await;
        self.track(result)
    }
}

impl Drop for TransactionExecutor<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(
                transaction_id = %self.id,
                state = ?self.state,
                "Transaction abandoned before completion; discarding its connection"
            );
            conn.discard();
        }
    }
}

impl std::fmt::Debug for TransactionExecutor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionExecutor")
            .field("id", &self.id)
            .field("isolation", &self.isolation)
            .field("state", &self.state)
            .finish()
    }
}

impl QueryExecutor {
    /// Run `unit_of_work` inside a read-committed transaction.
    ///
    /// See [`run_in_transaction_with_isolation`](Self::run_in_transaction_with_isolation).
    pub async fn run_in_transaction<'a, T, E, F>(&'a self, unit_of_work: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut TransactionExecutor<'a>) -> BoxFuture<'t, Result<T, E>>,
        E: From<DbError>,
    {
        self.run_in_transaction_with_isolation(IsolationLevel::default(), unit_of_work)
            .await
    }

    /// Run `unit_of_work` inside a transaction at `isolation`.
    ///
    /// `Ok` commits and returns the value; a failing commit is reported as a
    /// [`DbError::Transaction`], and so is an `Ok` after a statement failed on
    /// the server (the work is rolled back instead). `Err` rolls back and
    /// returns the error unchanged; a failing rollback is logged but never
    /// replaces it.
    ///
    /// The executor cannot be kept past the unit of work, and it offers no way
    /// to start a nested transaction.
    ///
    /// ```ignore
    /// let id: i64 = executor
    ///     .run_in_transaction(|tx| {
    ///         Box::pin(async move {
    ///             tx.execute(&insert_student).await?;
    ///             tx.execute_scalar(&last_id).await
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn run_in_transaction_with_isolation<'a, T, E, F>(
        &'a self,
        isolation: IsolationLevel,
        unit_of_work: F,
    ) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut TransactionExecutor<'a>) -> BoxFuture<'t, Result<T, E>>,
        E: From<DbError>,
    {
        let mut tx = TransactionExecutor::begin(self, isolation).await?;
        match unit_of_work(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback().await;
                Err(err)
            }
        }
    }
}
