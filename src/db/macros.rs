//! Database dispatch macros for reducing code duplication.

/// Match an [`OpenConnection`](crate::db::OpenConnection) against per-backend
/// arms, binding the backend's `PoolConnection`.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(conn, {
///     MySql(c) => mysql::execute(c, &compiled).await,
///     Postgres(c) => postgres::execute(c, &compiled).await,
///     SQLite(c) => sqlite::execute(c, &compiled).await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::factory::OpenConnection::$variant($c) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;
