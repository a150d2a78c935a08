//! Tests against real PostgreSQL and MySQL servers.
//!
//! Set `TEST_POSTGRES_URL` and/or `TEST_MYSQL_URL` to run them; otherwise each
//! test is skipped.

use rand::Rng;
use serde::Deserialize;
use sqlgate::db::{QueryExecutor, factory_from_connection_string};
use sqlgate::error::DbError;
use sqlgate::models::{IsolationLevel, QueryParam, QueryRequest, params};

fn executor_from_env(var: &str) -> Option<QueryExecutor> {
    match std::env::var(var) {
        Ok(url) => Some(QueryExecutor::new(
            factory_from_connection_string(&url).expect("Invalid test connection string"),
        )),
        Err(_) => {
            eprintln!("Skipping test: {var} not set");
            None
        }
    }
}

/// Unique table names so concurrent runs do not collide.
fn table_names() -> (String, String) {
    let suffix: u32 = rand::thread_rng().r#gen();
    (format!("students_{suffix}"), format!("logs_{suffix}"))
}

async fn create_tables(executor: &QueryExecutor, students: &str, logs: &str) {
    executor
        .execute(&QueryRequest::new(format!(
            "CREATE TABLE {students} (StudentNumber VARCHAR(32) PRIMARY KEY, Name VARCHAR(100) NOT NULL)"
        )))
        .await
        .unwrap();
    executor
        .execute(&QueryRequest::new(format!(
            "CREATE TABLE {logs} (id INTEGER PRIMARY KEY, message VARCHAR(200) NOT NULL)"
        )))
        .await
        .unwrap();
}

async fn drop_tables(executor: &QueryExecutor, students: &str, logs: &str) {
    for table in [students, logs] {
        let _ = executor
            .execute(&QueryRequest::new(format!("DROP TABLE IF EXISTS {table}")))
            .await;
    }
}

#[derive(Debug, Deserialize)]
struct Student {
    #[serde(alias = "studentnumber", rename = "StudentNumber")]
    student_number: String,
    #[serde(alias = "name", rename = "Name")]
    name: String,
}

async fn rollback_on_constraint_violation(executor: QueryExecutor) {
    let (students, logs) = table_names();
    create_tables(&executor, &students, &logs).await;

    let insert_student = QueryRequest::new(format!(
        "INSERT INTO {students} (StudentNumber, Name) VALUES (@n, @m)"
    ))
    .bind("n", "S-1")
    .bind("m", "Ada");
    let bad_log = QueryRequest::new(format!("INSERT INTO {logs} (id, message) VALUES (@id, @message)"))
        .bind("id", 1)
        .bind("message", QueryParam::Null);

    let result: Result<(), DbError> = executor
        .run_in_transaction(|tx| {
            Box::pin(async move {
                tx.execute(&insert_student).await?;
                tx.execute(&bad_log).await?;
                Ok(())
            })
        })
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, DbError::Query { .. }), "got {err:?}");

    let found: Option<Student> = executor
        .query_single(&QueryRequest::new(format!(
            "SELECT StudentNumber, Name FROM {students} WHERE StudentNumber = :n"
        )).bind("n", "S-1"))
        .await
        .unwrap();
    assert!(found.is_none());

    drop_tables(&executor, &students, &logs).await;
}

async fn commit_with_isolation_levels(executor: QueryExecutor) {
    let (students, logs) = table_names();
    create_tables(&executor, &students, &logs).await;

    let insert = QueryRequest::new(format!(
        "INSERT INTO {students} (StudentNumber, Name) VALUES (@n, @m)"
    ));
    for (i, isolation) in [
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ]
    .into_iter()
    .enumerate()
    {
        let sets = vec![params([
            ("n", QueryParam::from(format!("S-{i}"))),
            ("m", QueryParam::from("Grace")),
        ])];
        let insert = &insert;
        let affected = executor
            .run_in_transaction_with_isolation(isolation, |tx| {
                Box::pin(async move { tx.execute_batch(insert, &sets).await })
            })
            .await
            .unwrap();
        assert_eq!(affected, 1);
    }

    let rows: Vec<Student> = executor
        .query_many(&QueryRequest::new(format!(
            "SELECT StudentNumber, Name FROM {students} ORDER BY StudentNumber"
        )))
        .await
        .unwrap();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|s| s.name == "Grace"));
    assert_eq!(rows[0].student_number, "S-0");

    drop_tables(&executor, &students, &logs).await;
}

async fn repeated_named_parameter(executor: QueryExecutor) {
    let request = QueryRequest::new("SELECT @x + @x AS doubled").bind("x", 21);
    let doubled: i64 = executor.execute_scalar(&request).await.unwrap();
    assert_eq!(doubled, 42);
}

async fn swallowed_error_is_not_committed(executor: QueryExecutor) {
    let (students, logs) = table_names();
    create_tables(&executor, &students, &logs).await;

    let insert = QueryRequest::new(format!(
        "INSERT INTO {students} (StudentNumber, Name) VALUES (@n, @m)"
    ))
    .bind("n", "S-1")
    .bind("m", "Ada");

    // PostgreSQL answers COMMIT on an aborted transaction with a silent
    // rollback; the duplicate key must still surface as a failed commit
    let result: Result<(), DbError> = executor
        .run_in_transaction(|tx| {
            Box::pin(async move {
                tx.execute(&insert).await?;
                let duplicate = tx.execute(&insert).await;
                assert!(matches!(duplicate, Err(DbError::Query { .. })), "got {duplicate:?}");
                Ok(())
            })
        })
        .await;
    assert!(matches!(result, Err(DbError::Transaction { .. })), "got {result:?}");

    let remaining: i64 = executor
        .execute_scalar(&QueryRequest::new(format!("SELECT COUNT(*) FROM {students}")))
        .await
        .unwrap();
    assert_eq!(remaining, 0);

    drop_tables(&executor, &students, &logs).await;
}

#[tokio::test]
async fn test_postgres_rollback_on_constraint_violation() {
    if let Some(executor) = executor_from_env("TEST_POSTGRES_URL") {
        rollback_on_constraint_violation(executor).await;
    }
}

#[tokio::test]
async fn test_postgres_isolation_levels() {
    if let Some(executor) = executor_from_env("TEST_POSTGRES_URL") {
        commit_with_isolation_levels(executor).await;
    }
}

#[tokio::test]
async fn test_postgres_repeated_parameter() {
    if let Some(executor) = executor_from_env("TEST_POSTGRES_URL") {
        repeated_named_parameter(executor).await;
    }
}

#[tokio::test]
async fn test_mysql_rollback_on_constraint_violation() {
    if let Some(executor) = executor_from_env("TEST_MYSQL_URL") {
        rollback_on_constraint_violation(executor).await;
    }
}

#[tokio::test]
async fn test_mysql_isolation_levels() {
    if let Some(executor) = executor_from_env("TEST_MYSQL_URL") {
        commit_with_isolation_levels(executor).await;
    }
}

#[tokio::test]
async fn test_mysql_repeated_parameter() {
    if let Some(executor) = executor_from_env("TEST_MYSQL_URL") {
        repeated_named_parameter(executor).await;
    }
}

#[tokio::test]
async fn test_postgres_swallowed_error_is_not_committed() {
    if let Some(executor) = executor_from_env("TEST_POSTGRES_URL") {
        swallowed_error_is_not_committed(executor).await;
    }
}

#[tokio::test]
async fn test_mysql_swallowed_error_is_not_committed() {
    if let Some(executor) = executor_from_env("TEST_MYSQL_URL") {
        swallowed_error_is_not_committed(executor).await;
    }
}
