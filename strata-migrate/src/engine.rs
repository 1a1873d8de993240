//! Migration engine implementation.

use std::collections::HashSet;
use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::database::{Database, with_transaction};
use crate::error::{MigrateResult, MigrationError};
use crate::history::{AppliedMigration, DEFAULT_HISTORY_TABLE, HistoryStore, LockStrategy};
use crate::migration::{Migration, MigrationState, Procedures};
use crate::reconcile::{RepeatablePolicy, reconcile};
use crate::registry::{PreparedMigrations, Registry};
use crate::retry::RetryPolicy;
use crate::version::SchemaVersion;

/// Configuration for the migrator.
///
/// ```rust
/// use strata_migrate::{LockStrategy, MigratorConfig};
///
/// let config = MigratorConfig::from_toml_str(
///     r#"
///     schema = "billing"
///     lock_strategy = "rows_for_update"
///
///     [retry]
///     max_attempts = 3
///     "#,
/// )
/// .unwrap();
///
/// assert_eq!(config.schema, "billing");
/// assert_eq!(config.table, "strata_schema_history");
/// assert_eq!(config.lock_strategy, LockStrategy::RowsForUpdate);
/// assert_eq!(config.retry.max_attempts, 3);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigratorConfig {
    /// Schema holding the history table.
    pub schema: String,
    /// Name of the history table.
    pub table: String,
    /// Retry policy for bootstrap steps.
    pub retry: RetryPolicy,
    /// How the history table is locked.
    pub lock_strategy: LockStrategy,
    /// When repeatable migrations run.
    pub repeatable_policy: RepeatablePolicy,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            table: DEFAULT_HISTORY_TABLE.to_string(),
            retry: RetryPolicy::default(),
            lock_strategy: LockStrategy::default(),
            repeatable_policy: RepeatablePolicy::default(),
        }
    }
}

impl MigratorConfig {
    /// Create a new configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> MigrateResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> MigrateResult<Self> {
        toml::from_str(content).map_err(|e| MigrationError::config(e.to_string()))
    }

    /// Set the schema.
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Set the history table name.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Set the bootstrap retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the lock strategy.
    pub fn lock_strategy(mut self, strategy: LockStrategy) -> Self {
        self.lock_strategy = strategy;
        self
    }

    /// Set the repeatable migration policy.
    pub fn repeatable_policy(mut self, policy: RepeatablePolicy) -> Self {
        self.repeatable_policy = policy;
        self
    }
}

/// A migration applied during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedStep {
    /// Version, or the repeatable marker.
    pub version: String,
    /// Description.
    pub description: String,
    /// Rank assigned in the history table.
    pub installed_rank: i64,
    /// Time spent applying, in milliseconds.
    pub execution_time_ms: i64,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    /// Number of migrations applied.
    pub applied_count: usize,
    /// The applied migrations, in order.
    pub applied: Vec<AppliedStep>,
    /// Total duration in milliseconds.
    pub duration_ms: i64,
    /// Schema version after the run.
    pub schema_version: Option<String>,
}

impl MigrationReport {
    /// Check if any migrations were applied.
    pub fn has_changes(&self) -> bool {
        self.applied_count > 0
    }

    /// Get a summary of the run.
    pub fn summary(&self) -> String {
        if self.applied_count == 0 {
            return "Schema is up to date. No migration necessary.".to_string();
        }

        format!(
            "Successfully applied {} {} to schema, now at version v{} (execution time {}ms)",
            self.applied_count,
            if self.applied_count == 1 {
                "migration"
            } else {
                "migrations"
            },
            self.schema_version.as_deref().unwrap_or_default(),
            self.duration_ms
        )
    }
}

/// State of one local migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatusEntry {
    /// Version, or the repeatable marker.
    pub version: String,
    /// Description.
    pub description: String,
    /// Reconciled state.
    pub state: MigrationState,
}

/// Read-only view of local migrations against the history table.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    /// Every local migration, in application order.
    pub entries: Vec<MigrationStatusEntry>,
    /// Highest successfully applied version.
    pub current_version: Option<String>,
}

impl MigrationStatus {
    /// Migrations that a run would apply.
    pub fn pending(&self) -> Vec<&MigrationStatusEntry> {
        self.entries
            .iter()
            .filter(|e| e.state == MigrationState::Pending)
            .collect()
    }

    /// Check if nothing is pending.
    pub fn is_up_to_date(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.state != MigrationState::Pending)
    }
}

struct Step {
    current_version: Option<SchemaVersion>,
    applied: Option<(usize, AppliedStep)>,
}

/// Applies registered migrations to a database.
///
/// Any number of migrators, in any number of processes, may run against the
/// same history table at once; the history table lock lets one of them work
/// at a time.
pub struct Migrator<D: Database> {
    db: D,
    config: MigratorConfig,
}

impl<D: Database> Migrator<D> {
    /// Create a migrator with the default configuration.
    pub fn new(db: D) -> Self {
        Self::with_config(db, MigratorConfig::default())
    }

    /// Create a migrator with a custom configuration.
    pub fn with_config(db: D, config: MigratorConfig) -> Self {
        Self { db, config }
    }

    /// Get the configuration.
    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    /// Get the database handle.
    pub fn database(&self) -> &D {
        &self.db
    }

    fn store(&self) -> HistoryStore<'_> {
        HistoryStore::new(&self.db, &self.config.schema, &self.config.table)
            .with_retry(self.config.retry.clone())
            .with_lock_strategy(self.config.lock_strategy)
    }

    /// Apply all pending migrations.
    ///
    /// Migrations are prepared before the database is touched. Each pending
    /// migration is then applied in its own transaction, under the history
    /// table lock, after a fresh reconciliation. The run stops at the first
    /// failure, which is recorded in the history table.
    pub async fn migrate(&self, registry: &Registry) -> MigrateResult<MigrationReport> {
        let start = Instant::now();
        let prepared = registry.prepare()?;

        let store = self.store();
        store.bootstrap().await?;

        let mut ran: HashSet<usize> = HashSet::new();
        let mut applied = Vec::new();
        let mut first_pass = true;

        let schema_version = loop {
            let step = store
                .with_lock(|store| Box::pin(self.step(store, &prepared, &ran, first_pass)))
                .await?;
            first_pass = false;

            match step.applied {
                Some((idx, entry)) => {
                    ran.insert(idx);
                    applied.push(entry);
                }
                None => break step.current_version,
            }
        };

        let report = MigrationReport {
            applied_count: applied.len(),
            applied,
            duration_ms: start.elapsed().as_millis() as i64,
            schema_version: schema_version.map(|v| v.to_string()),
        };
        info!("{}", report.summary());
        Ok(report)
    }

    async fn step(
        &self,
        store: &HistoryStore<'_>,
        prepared: &PreparedMigrations,
        ran: &HashSet<usize>,
        first_pass: bool,
    ) -> MigrateResult<Step> {
        let rows = store.load_applied().await?;
        let reconciliation = reconcile(
            prepared.migrations(),
            &rows,
            ran,
            self.config.repeatable_policy,
            &self.config.schema,
        )?;

        if first_pass {
            info!(
                "Current version of schema {}: v{}",
                self.config.schema,
                reconciliation
                    .current_version
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_default()
            );
        }

        let Some(idx) = reconciliation.next else {
            return Ok(Step {
                current_version: reconciliation.current_version,
                applied: None,
            });
        };

        let migration = &prepared.migrations()[idx];
        let text = migration.migration_text();
        info!("Starting migration of {} ...", text);

        let start = Instant::now();
        let result = self.apply(migration, prepared.procedures()).await;
        let execution_time_ms = start.elapsed().as_millis() as i64;

        match result {
            Ok(()) => {
                let rank = store
                    .append(
                        migration.version(),
                        migration.description(),
                        migration.checksum(),
                        execution_time_ms,
                        true,
                    )
                    .await?;
                info!("Successfully completed migration of {}", text);

                Ok(Step {
                    current_version: reconciliation.current_version,
                    applied: Some((
                        idx,
                        AppliedStep {
                            version: migration.version().to_string(),
                            description: migration.description().to_string(),
                            installed_rank: rank,
                            execution_time_ms,
                        },
                    )),
                })
            }
            Err(err) => {
                warn!(
                    "Migration of {} failed!\n    Caused by: {}\n    Changes successfully rolled back.",
                    text, err
                );
                if let Err(record_err) = store
                    .append(
                        migration.version(),
                        migration.description(),
                        migration.checksum(),
                        execution_time_ms,
                        false,
                    )
                    .await
                {
                    error!(error = %record_err, "Unable to record failed migration");
                }
                Err(MigrationError::ApplyFailed {
                    migration: text,
                    source: Box::new(err),
                })
            }
        }
    }

    /// Run every command of `migration` in one transaction whose
    /// `search_path` is the configured schema, so unqualified names land
    /// next to the history table.
    async fn apply(&self, migration: &Migration, procedures: &Procedures) -> MigrateResult<()> {
        let conn = self.db.connect().await?;
        let scope = format!(
            "SET LOCAL search_path TO {}",
            self.db.quote_identifier(&self.config.schema)
        );

        let result = with_transaction(&*conn, |tx| {
            Box::pin(async move {
                tx.execute(&scope, &[]).await?;
                for command in migration.commands() {
                    command.execute(tx, migration, procedures).await?;
                }
                Ok::<_, MigrationError>(())
            })
        })
        .await;

        if let Err(err) = conn.release().await {
            error!(error = %err, "Unable to release migration connection");
        }
        result
    }

    /// Reconcile without bootstrapping, locking or applying anything.
    pub async fn status(&self, registry: &Registry) -> MigrateResult<MigrationStatus> {
        let prepared = registry.prepare()?;
        let rows = self.history().await?;

        let reconciliation = reconcile(
            prepared.migrations(),
            &rows,
            &HashSet::new(),
            self.config.repeatable_policy,
            &self.config.schema,
        )?;

        let entries = prepared
            .migrations()
            .iter()
            .zip(reconciliation.states)
            .map(|(m, state)| MigrationStatusEntry {
                version: m.version().to_string(),
                description: m.description().to_string(),
                state,
            })
            .collect();

        Ok(MigrationStatus {
            entries,
            current_version: reconciliation.current_version.map(|v| v.to_string()),
        })
    }

    /// Every row of the history table, in rank order. Empty if the table
    /// does not exist yet.
    pub async fn history(&self) -> MigrateResult<Vec<AppliedMigration>> {
        let store = self.store();
        if !store.table_exists().await? {
            return Ok(Vec::new());
        }
        store.load_applied().await
    }
}
