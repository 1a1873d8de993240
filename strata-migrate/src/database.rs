//! The database capabilities the migration engine relies on.
//!
//! The engine never talks to a driver directly. Instead it goes through three
//! small object-safe traits:
//!
//! - [`Executor`] runs statements and queries with bound [`SqlValue`]s.
//! - [`Connection`] is a dedicated connection with explicit transaction control.
//! - [`Database`] is the pool-level handle: it executes in autocommit mode,
//!   hands out dedicated connections, and quotes identifiers.
//!
//! [`with_transaction`] and [`transaction`] implement the scoped-acquisition
//! pattern on top of them: commit on success, roll back on error or panic,
//! and always release what was acquired.

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use crate::error::{MigrateResult, MigrationError};
use crate::value::{Row, SqlValue};

/// Runs statements against a database.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute a statement and return the number of affected rows.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> MigrateResult<u64>;

    /// Execute a query and return all rows.
    async fn query(&self, sql: &str, params: &[SqlValue]) -> MigrateResult<Vec<Row>>;

    /// Execute a query and return its first row.
    async fn query_row(&self, sql: &str, params: &[SqlValue]) -> MigrateResult<Row> {
        self.query(sql, params)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MigrationError::database("query returned no rows"))
    }

    /// Execute a query returning a single boolean.
    async fn query_bool(&self, sql: &str, params: &[SqlValue]) -> MigrateResult<bool> {
        self.query_row(sql, params).await?.get_bool(0)
    }
}

/// A dedicated connection taken out of the pool.
#[async_trait]
pub trait Connection: Executor {
    /// Begin a transaction.
    async fn begin(&self) -> MigrateResult<()>;

    /// Commit the open transaction.
    async fn commit(&self) -> MigrateResult<()>;

    /// Roll back the open transaction.
    async fn rollback(&self) -> MigrateResult<()>;

    /// Return the connection to the pool, rolling back any open transaction.
    async fn release(&self) -> MigrateResult<()>;
}

/// A pool-level database handle.
#[async_trait]
pub trait Database: Executor {
    /// Acquire a dedicated connection.
    async fn connect(&self) -> MigrateResult<Box<dyn Connection>>;

    /// Quote an identifier for interpolation into generated SQL.
    fn quote_identifier(&self, name: &str) -> String {
        quote_identifier(name)
    }
}

/// Quote an identifier using standard SQL double quotes.
///
/// Embedded quotes are doubled and anything after a NUL byte is dropped.
pub fn quote_identifier(name: &str) -> String {
    let name = name.split('\0').next().unwrap_or_default();
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Run `body` inside a transaction on `conn`.
///
/// Commits when the body succeeds; rolls back when it fails or panics. A
/// panic is converted into [`MigrationError::Panic`].
pub async fn with_transaction<'c, T, F>(conn: &'c dyn Connection, body: F) -> MigrateResult<T>
where
    F: FnOnce(&'c dyn Executor) -> BoxFuture<'c, MigrateResult<T>>,
{
    conn.begin().await?;

    let outcome = AssertUnwindSafe(body(conn)).catch_unwind().await;

    match outcome {
        Ok(Ok(value)) => {
            conn.commit().await?;
            Ok(value)
        }
        Ok(Err(err)) => {
            if let Err(rollback_err) = conn.rollback().await {
                warn!(error = %rollback_err, "Unable to roll back transaction");
            }
            Err(err)
        }
        Err(payload) => {
            let err = MigrationError::from_panic(payload);
            error!(error = %err, "Transaction body panicked, rolling back");
            if let Err(rollback_err) = conn.rollback().await {
                warn!(error = %rollback_err, "Unable to roll back transaction");
            }
            Err(err)
        }
    }
}

/// Acquire a connection from `db`, run `body` in a transaction on it, and
/// release the connection on every exit path.
pub async fn transaction<T, F>(db: &dyn Database, body: F) -> MigrateResult<T>
where
    F: for<'c> FnOnce(&'c dyn Executor) -> BoxFuture<'c, MigrateResult<T>>,
{
    let conn = db.connect().await?;
    debug!("Acquired transactional connection");

    let result = with_transaction(&*conn, body).await;

    if let Err(err) = conn.release().await {
        error!(error = %err, "Unable to release connection");
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDatabase;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("users"), "\"users\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_identifier("cut\0here"), "\"cut\"");
    }

    #[tokio::test]
    async fn test_transaction_commits_on_success() {
        let db = MemoryDatabase::new();

        transaction(&db, |tx| {
            Box::pin(async move {
                tx.execute("CREATE TABLE a (id INT)", &[]).await?;
                Ok::<_, MigrationError>(())
            })
        })
        .await
        .unwrap();

        assert_eq!(db.executed(), vec!["CREATE TABLE a (id INT)".to_string()]);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let db = MemoryDatabase::new();
        db.fail_on("broken");

        let result = transaction(&db, |tx| {
            Box::pin(async move {
                tx.execute("CREATE TABLE a (id INT)", &[]).await?;
                tx.execute("broken statement", &[]).await?;
                Ok::<_, MigrationError>(())
            })
        })
        .await;

        assert!(result.is_err());
        assert!(db.executed().is_empty());
    }

    #[tokio::test]
    async fn test_transaction_converts_panic() {
        let db = MemoryDatabase::new();

        let result: MigrateResult<()> = transaction(&db, |tx| {
            Box::pin(async move {
                tx.execute("CREATE TABLE a (id INT)", &[]).await?;
                let fault = true;
                if fault {
                    panic!("fault inside transaction");
                }
                Ok::<_, MigrationError>(())
            })
        })
        .await;

        match result {
            Err(MigrationError::Panic { message, .. }) => {
                assert_eq!(message, "fault inside transaction");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(db.executed().is_empty());
        assert_eq!(db.open_connections(), 0);
    }
}
