//! Sequential reader over the row-sets of a multi-statement query.

use crate::db::executor::fetch_compiled;
use crate::db::factory::OpenConnection;
use crate::db::params;
use crate::error::{DbError, DbResult};
use crate::models::{Params, RowSet, Table};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// Hands out the row-sets produced by [`query_multiple`], one per statement,
/// in statement order.
///
/// Statements run one at a time on the cursor's connection as their row-set
/// is read, so statements the reader never reaches are never executed. Each
/// row-set can be read once.
///
/// [`query_multiple`]: crate::db::QueryExecutor::query_multiple
pub struct MultiResultCursor {
    conn: OpenConnection,
    pending: VecDeque<String>,
    params: Params,
    query_timeout: Duration,
    read: usize,
}

impl MultiResultCursor {
    pub(crate) fn new(
        conn: OpenConnection,
        statements: Vec<String>,
        params: Params,
        query_timeout: Duration,
    ) -> Self {
        Self {
            conn,
            pending: statements.into(),
            params,
            query_timeout,
            read: 0,
        }
    }

    /// Number of row-sets not read yet.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    pub fn is_consumed(&self) -> bool {
        self.pending.is_empty()
    }

    /// Run the next statement, keeping at most `limit` of its rows.
    async fn next_set(&mut self, limit: Option<usize>) -> DbResult<RowSet> {
        let statement = self.pending.pop_front().ok_or_else(|| {
            DbError::invalid_input(format!(
                "No more result sets: all {} have been read",
                self.read
            ))
        })?;
        self.read += 1;
        debug!(index = self.read, "Reading next result set");

        let compiled = params::compile(&statement, &self.params, self.conn.db_type())?;
        fetch_compiled(&mut self.conn, &compiled, limit, self.query_timeout).await
    }

    /// Read the next row-set as a list of `T`.
    pub async fn read<T: DeserializeOwned>(&mut self) -> DbResult<Vec<T>> {
        self.next_set(None).await?.deserialize_all()
    }

    /// Read the first row of the next row-set, ignoring the rest.
    pub async fn read_first<T: DeserializeOwned>(&mut self) -> DbResult<Option<T>> {
        self.next_set(Some(1)).await?.first()
    }

    /// Read the only row of the next row-set; more than one row is an error.
    pub async fn read_single<T: DeserializeOwned>(&mut self) -> DbResult<Option<T>> {
        self.next_set(Some(2)).await?.single()
    }

    /// Read the next row-set as a loosely typed table.
    pub async fn read_table(&mut self) -> DbResult<Table> {
        Ok(self.next_set(None).await?.into_table())
    }
}

impl std::fmt::Debug for MultiResultCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiResultCursor")
            .field("db_type", &self.conn.db_type())
            .field("remaining", &self.pending.len())
            .field("read", &self.read)
            .finish()
    }
}
