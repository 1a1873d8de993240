//! PostgreSQL connection wrapper.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use deadpool_postgres::{ClientWrapper, Object};
use strata_migrate::{Connection, Executor, MigrateResult, Row, SqlValue};
use tokio_postgres::types::ToSql;
use tracing::{debug, warn};

use crate::error::{PgError, PgResult};
use crate::types::{from_pg_row, to_sql_params};

/// A dedicated pooled connection with explicit transaction control.
///
/// The connection goes back to the pool when dropped. A connection dropped
/// while a transaction is still open is detached from the pool instead, so
/// the open transaction dies with it.
pub struct PgConnection {
    client: Option<Object>,
    in_transaction: AtomicBool,
}

impl PgConnection {
    /// Create a new connection wrapper.
    pub(crate) fn new(client: Object) -> Self {
        Self {
            client: Some(client),
            in_transaction: AtomicBool::new(false),
        }
    }

    /// Check if a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    /// Get the underlying tokio-postgres client.
    ///
    /// This is useful for advanced operations not covered by this wrapper.
    pub fn inner(&self) -> PgResult<&Object> {
        self.client
            .as_ref()
            .ok_or_else(|| PgError::connection("connection already detached"))
    }

    async fn control(&self, sql: &str) -> MigrateResult<()> {
        debug!(sql = %sql, "Executing transaction control");
        self.inner()?
            .batch_execute(sql)
            .await
            .map_err(PgError::from)?;
        Ok(())
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if self.in_transaction() {
            if let Some(client) = self.client.take() {
                warn!("Dropping connection with an open transaction, detaching it from the pool");
                drop(Object::take(client));
            }
        }
    }
}

#[async_trait]
impl Executor for PgConnection {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> MigrateResult<u64> {
        Ok(execute_on(self.inner()?, sql, params).await?)
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> MigrateResult<Vec<Row>> {
        Ok(query_on(self.inner()?, sql, params).await?)
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn begin(&self) -> MigrateResult<()> {
        self.control("BEGIN").await?;
        self.in_transaction.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> MigrateResult<()> {
        let result = self.control("COMMIT").await;
        // A failed COMMIT still ends the transaction block.
        self.in_transaction.store(false, Ordering::SeqCst);
        result
    }

    async fn rollback(&self) -> MigrateResult<()> {
        self.control("ROLLBACK").await?;
        self.in_transaction.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self) -> MigrateResult<()> {
        if self.in_transaction() {
            debug!("Rolling back open transaction before release");
            self.rollback().await?;
        }
        Ok(())
    }
}

/// Execute a statement on a pooled client.
///
/// Statements without parameters go through the simple query protocol, so a
/// migration script may contain several statements.
pub(crate) async fn execute_on(
    client: &ClientWrapper,
    sql: &str,
    params: &[SqlValue],
) -> PgResult<u64> {
    if params.is_empty() {
        debug!(sql = %sql, "Executing batch");
        client.batch_execute(sql).await?;
        return Ok(0);
    }

    debug!(sql = %sql, params = params.len(), "Executing statement");
    let stmt = client.prepare_cached(sql).await?;
    let bound = to_sql_params(params, stmt.params())?;
    let refs: Vec<&(dyn ToSql + Sync)> = bound
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect();
    Ok(client.execute(&stmt, &refs).await?)
}

/// Run a query on a pooled client and convert its rows.
pub(crate) async fn query_on(
    client: &ClientWrapper,
    sql: &str,
    params: &[SqlValue],
) -> PgResult<Vec<Row>> {
    debug!(sql = %sql, params = params.len(), "Executing query");
    let stmt = client.prepare_cached(sql).await?;
    let bound = to_sql_params(params, stmt.params())?;
    let refs: Vec<&(dyn ToSql + Sync)> = bound
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect();
    let rows = client.query(&stmt, &refs).await?;
    rows.iter().map(from_pg_row).collect()
}
