//! The schema history table.
//!
//! [`HistoryStore`] owns the ledger of applied migrations: it creates the
//! schema, table and index on first use, reads the ledger through a
//! monotonic rank cache, appends outcome rows, and serializes migrators
//! through a lock taken on the history table itself.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::database::{Connection, Database, transaction};
use crate::error::{MigrateResult, MigrationError};
use crate::migration::MigrationState;
use crate::retry::RetryPolicy;
use crate::value::{Row, SqlValue};
use crate::version::MigrationVersion;

/// Default name of the history table.
pub const DEFAULT_HISTORY_TABLE: &str = "strata_schema_history";

/// A row of the history table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    /// Installation rank. Strictly increasing, never reused.
    pub installed_rank: i64,
    /// Normalized version, or the repeatable marker.
    pub version: String,
    /// Description at the time of application.
    pub description: String,
    /// Checksum at the time of application.
    pub checksum: String,
    /// When the row was written.
    pub installed_on: DateTime<Utc>,
    /// Time spent applying the migration, in milliseconds.
    pub execution_time_ms: i64,
    /// Whether the migration succeeded.
    pub success: bool,
}

impl AppliedMigration {
    pub(crate) fn from_row(row: &Row) -> MigrateResult<Self> {
        Ok(Self {
            installed_rank: row.get_i64(0)?,
            version: row.get_opt_str(1)?.unwrap_or_default().to_string(),
            description: row.get_str(2)?.to_string(),
            // CHAR(32) comes back blank padded for short values.
            checksum: row.get_opt_str(3)?.unwrap_or_default().trim_end().to_string(),
            installed_on: row.get_timestamp(4)?,
            execution_time_ms: row.get_i64(5)?,
            success: row.get_bool(6)?,
        })
    }

    /// The recorded outcome.
    pub fn state(&self) -> MigrationState {
        if self.success {
            MigrationState::Success
        } else {
            MigrationState::Failed
        }
    }
}

/// How the history table is locked while a migrator works.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStrategy {
    /// `LOCK TABLE .. IN SHARE ROW EXCLUSIVE MODE`. Conflicts with itself,
    /// so it serializes migrators even while the ledger is empty.
    #[default]
    ExclusiveTable,
    /// `SELECT * FROM .. FOR UPDATE`. Only serializes once the ledger holds
    /// at least one row.
    RowsForUpdate,
}

impl LockStrategy {
    /// Statement that takes the lock on `table`.
    pub fn lock_sql(&self, table: &str) -> String {
        match self {
            Self::ExclusiveTable => format!("LOCK TABLE {} IN SHARE ROW EXCLUSIVE MODE", table),
            Self::RowsForUpdate => format!("SELECT * FROM {} FOR UPDATE", table),
        }
    }
}

enum LockSlot {
    Unlocked,
    Acquiring,
    Held(Arc<dyn Connection>),
}

/// Ledger of applied migrations for one schema.
///
/// A store belongs to a single run. Its cache only grows, so a new store
/// should be created for every run.
pub struct HistoryStore<'a> {
    db: &'a dyn Database,
    schema: String,
    table: String,
    retry: RetryPolicy,
    lock_strategy: LockStrategy,
    cache: Mutex<Vec<AppliedMigration>>,
    lock: Mutex<LockSlot>,
}

impl<'a> HistoryStore<'a> {
    /// Create a store for `schema.table`.
    pub fn new(db: &'a dyn Database, schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            db,
            schema: schema.into(),
            table: table.into(),
            retry: RetryPolicy::default(),
            lock_strategy: LockStrategy::default(),
            cache: Mutex::new(Vec::new()),
            lock: Mutex::new(LockSlot::Unlocked),
        }
    }

    /// Set the retry policy used while bootstrapping.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the lock strategy.
    pub fn with_lock_strategy(mut self, strategy: LockStrategy) -> Self {
        self.lock_strategy = strategy;
        self
    }

    /// The schema holding the history table.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// The quoted, schema qualified table name.
    pub fn qualified_table(&self) -> String {
        format!(
            "{}.{}",
            self.db.quote_identifier(&self.schema),
            self.db.quote_identifier(&self.table)
        )
    }

    /// Check if this store currently holds the lock.
    pub fn is_locked(&self) -> bool {
        matches!(*self.lock.lock(), LockSlot::Held(_))
    }

    fn lock_connection(&self) -> Option<Arc<dyn Connection>> {
        match &*self.lock.lock() {
            LockSlot::Held(conn) => Some(Arc::clone(conn)),
            _ => None,
        }
    }

    /// Check whether the schema exists.
    pub async fn schema_exists(&self) -> MigrateResult<bool> {
        self.db
            .query_bool(
                "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname = $1)",
                &[SqlValue::from(self.schema.as_str())],
            )
            .await
    }

    /// Check whether the history table exists.
    pub async fn table_exists(&self) -> MigrateResult<bool> {
        self.db
            .query_bool(
                "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_class c \
                 JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind = 'r')",
                &[
                    SqlValue::from(self.schema.as_str()),
                    SqlValue::from(self.table.as_str()),
                ],
            )
            .await
    }

    async fn create_schema(&self) -> MigrateResult<()> {
        info!(schema = %self.schema, "Creating schema");
        let sql = format!("CREATE SCHEMA {}", self.db.quote_identifier(&self.schema));
        self.db.execute(&sql, &[]).await?;
        Ok(())
    }

    async fn create_table(&self) -> MigrateResult<()> {
        info!(schema = %self.schema, table = %self.table, "Creating schema history table");

        let table = self.qualified_table();
        let create_table = format!(
            "CREATE TABLE {} (\
             installed_rank INT NOT NULL PRIMARY KEY, \
             version VARCHAR(50), \
             description VARCHAR(200) NOT NULL, \
             checksum CHARACTER(32), \
             installed_on TIMESTAMP NOT NULL DEFAULT now(), \
             execution_time INTEGER NOT NULL, \
             success BOOLEAN NOT NULL)",
            table
        );
        let create_index = format!(
            "CREATE INDEX {} ON {} (success)",
            self.db.quote_identifier(&format!("{}_s_idx", self.table)),
            table
        );

        transaction(self.db, move |tx| {
            Box::pin(async move {
                tx.execute(&create_table, &[]).await?;
                tx.execute(&create_index, &[]).await?;
                Ok::<_, MigrationError>(())
            })
        })
        .await
    }

    /// Create whatever `exists` reports missing, under the retry policy.
    ///
    /// Existence is re-checked before every attempt and once more after the
    /// budget is spent, so losing a creation race to another process is not
    /// an error.
    async fn ensure<'s, E, C>(&'s self, what: &str, exists: E, create: C) -> MigrateResult<()>
    where
        E: Fn() -> BoxFuture<'s, MigrateResult<bool>>,
        C: Fn() -> BoxFuture<'s, MigrateResult<()>>,
    {
        if exists().await? {
            return Ok(());
        }

        let result = self
            .retry
            .run(what, |_| {
                let check = exists();
                let create = create();
                async move {
                    if check.await? {
                        return Ok(());
                    }
                    create.await
                }
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(err) if exists().await.unwrap_or(false) => {
                debug!(error = %err, "{} lost a race to another process", what);
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "Unable to {}", what);
                Err(err)
            }
        }
    }

    /// Create the schema, history table and index if they are missing.
    ///
    /// Safe to call repeatedly and from several processes at once.
    pub async fn bootstrap(&self) -> MigrateResult<()> {
        self.ensure(
            "create schema",
            || Box::pin(self.schema_exists()),
            || Box::pin(self.create_schema()),
        )
        .await?;

        self.ensure(
            "create schema history table",
            || Box::pin(self.table_exists()),
            || Box::pin(self.create_table()),
        )
        .await
    }

    /// All ledger rows in installation order.
    ///
    /// Only rows ranked above the highest cached rank are read. The cache is
    /// never pruned, so rows deleted during this run stay visible here; use
    /// the highest rank per version to find the current outcome.
    pub async fn load_applied(&self) -> MigrateResult<Vec<AppliedMigration>> {
        let since = self
            .cache
            .lock()
            .last()
            .map_or(0, |row| row.installed_rank);

        let sql = format!(
            "/*NO LOAD BALANCE*/ SELECT installed_rank, version, description, checksum, \
             installed_on, execution_time, success FROM {} \
             WHERE installed_rank > $1 ORDER BY installed_rank",
            self.qualified_table()
        );
        let params = [SqlValue::Int(since)];

        let rows = match self.lock_connection() {
            Some(conn) => conn.query(&sql, &params).await?,
            None => self.db.query(&sql, &params).await?,
        };
        let fresh = rows
            .iter()
            .map(AppliedMigration::from_row)
            .collect::<MigrateResult<Vec<_>>>()?;

        let mut cache = self.cache.lock();
        let max = cache.last().map_or(0, |row| row.installed_rank);
        cache.extend(fresh.into_iter().filter(|row| row.installed_rank > max));
        cache.sort_by_key(|row| row.installed_rank);
        Ok(cache.clone())
    }

    /// Record the outcome of a migration and return its rank.
    ///
    /// Must be called while holding the lock. Any previous row for a
    /// versioned migration is replaced; for repeatable migrations only a
    /// previous failed row with the same description is.
    pub async fn append(
        &self,
        version: &MigrationVersion,
        description: &str,
        checksum: &str,
        execution_time_ms: i64,
        success: bool,
    ) -> MigrateResult<i64> {
        let conn = self.lock_connection().ok_or(MigrationError::NotLocked)?;

        let applied = self.load_applied().await?;
        let rank = applied.last().map_or(0, |row| row.installed_rank) + 1;

        let table = self.qualified_table();
        let version_text = version.to_string();

        let removed = if version.is_repeatable() {
            conn.execute(
                &format!(
                    "DELETE FROM {} WHERE version = $1 AND description = $2 AND success = FALSE",
                    table
                ),
                &[
                    SqlValue::from(version_text.as_str()),
                    SqlValue::from(description),
                ],
            )
            .await?
        } else {
            conn.execute(
                &format!("DELETE FROM {} WHERE version = $1", table),
                &[SqlValue::from(version_text.as_str())],
            )
            .await?
        };

        conn.execute(
            &format!(
                "INSERT INTO {} (installed_rank, version, description, checksum, \
                 installed_on, execution_time, success) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                table
            ),
            &[
                SqlValue::Int(rank),
                SqlValue::Text(version_text),
                SqlValue::from(description),
                SqlValue::from(checksum),
                SqlValue::Timestamp(Utc::now()),
                SqlValue::Int(execution_time_ms),
                SqlValue::Bool(success),
            ],
        )
        .await?;

        debug!(rank, version = %version, success, removed, "Recorded migration");
        Ok(rank)
    }

    /// Run `body` while holding the history table lock.
    ///
    /// The lock is taken in a transaction on a dedicated connection. The
    /// transaction is committed whether or not `body` fails, rolled back if it
    /// panics, and the connection is always released. Nested calls fail with
    /// [`MigrationError::AlreadyLocked`].
    pub async fn with_lock<'s, T, F>(&'s self, body: F) -> MigrateResult<T>
    where
        F: FnOnce(&'s Self) -> BoxFuture<'s, MigrateResult<T>>,
    {
        {
            let mut slot = self.lock.lock();
            if !matches!(*slot, LockSlot::Unlocked) {
                return Err(MigrationError::AlreadyLocked);
            }
            *slot = LockSlot::Acquiring;
        }

        let conn: Arc<dyn Connection> = match self.acquire().await {
            Ok(conn) => conn,
            Err(err) => {
                *self.lock.lock() = LockSlot::Unlocked;
                return Err(err);
            }
        };
        *self.lock.lock() = LockSlot::Held(Arc::clone(&conn));
        debug!(table = %self.table, "Acquired schema history lock");

        let watermark = self
            .cache
            .lock()
            .last()
            .map_or(0, |row| row.installed_rank);

        let outcome = AssertUnwindSafe(body(self)).catch_unwind().await;
        *self.lock.lock() = LockSlot::Unlocked;

        let result = match outcome {
            Ok(result) => {
                let committed = conn.commit().await;
                match (result, committed) {
                    (Ok(value), Ok(())) => Ok(value),
                    (Ok(_), Err(err)) => Err(err),
                    (Err(err), committed) => {
                        if let Err(commit_err) = committed {
                            warn!(error = %commit_err, "Unable to commit lock transaction");
                        }
                        Err(err)
                    }
                }
            }
            Err(payload) => {
                let err = MigrationError::from_panic(payload);
                error!(error = %err, "Fault while holding schema history lock");
                if let Err(rollback_err) = conn.rollback().await {
                    warn!(error = %rollback_err, "Unable to roll back lock transaction");
                }
                // Rows read inside the rolled back transaction may never have existed.
                self.cache
                    .lock()
                    .retain(|row| row.installed_rank <= watermark);
                Err(err)
            }
        };

        if let Err(err) = conn.release().await {
            error!(error = %err, "Unable to release lock connection");
        }
        debug!(table = %self.table, "Released schema history lock");

        result
    }

    async fn acquire(&self) -> MigrateResult<Arc<dyn Connection>> {
        let conn: Arc<dyn Connection> = Arc::from(self.db.connect().await?);
        let lock_sql = self.lock_strategy.lock_sql(&self.qualified_table());

        let locked = async {
            conn.begin().await?;
            conn.execute(&lock_sql, &[]).await?;
            Ok::<_, MigrationError>(())
        }
        .await;

        match locked {
            Ok(()) => Ok(conn),
            Err(err) => {
                if let Err(rollback_err) = conn.rollback().await {
                    debug!(error = %rollback_err, "Rollback after failed lock");
                }
                if let Err(release_err) = conn.release().await {
                    error!(error = %release_err, "Unable to release lock connection");
                }
                Err(MigrationError::lock_failed(err.to_string()))
            }
        }
    }
}
