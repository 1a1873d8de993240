//! # strata-migrate
//!
//! Migration engine for Strata.
//!
//! This crate provides functionality for:
//! - Registering versioned and repeatable migrations, in code or from `.sql` files
//! - A schema history table recording every migration attempt and its outcome
//! - Drift detection between local migrations and the history table
//! - Cross-process mutual exclusion using a lock on the history table
//! - Idempotent bootstrap of the history schema, table and index, with retry
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌────────────────┐
//! │   Registry   │────▶│    Migrator    │
//! └──────────────┘     └────────────────┘
//!                              │ bootstrap, then loop
//!                              ▼
//!                      ┌────────────────┐     ┌─────────────┐
//!                      │ History lock   │────▶│ Reconcile   │
//!                      └────────────────┘     └─────────────┘
//!                              ▲                     │
//!                              │                     ▼
//!                      ┌────────────────┐     ┌─────────────┐
//!                      │ History Tbl    │◀────│ Apply one   │
//!                      └────────────────┘     └─────────────┘
//! ```
//!
//! Every pass takes the lock, reconciles, applies the next pending migration
//! in its own transaction and records the outcome. The run ends when nothing
//! is pending or at the first error.
//!
//! ## Example
//!
//! ```rust,ignore
//! use strata_migrate::{Migrator, MigratorConfig, Registry};
//!
//! async fn run_migrations(db: impl strata_migrate::Database) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut registry = Registry::new();
//!     registry.register("1.0.0", "create users", |m| {
//!         m.exec_sql("CREATE TABLE users (id BIGSERIAL PRIMARY KEY, email TEXT NOT NULL)");
//!     })?;
//!     registry.add_directory("./migrations").await?;
//!
//!     let migrator = Migrator::with_config(db, MigratorConfig::new().schema("app"));
//!     let report = migrator.migrate(&registry).await?;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```
//!
//! ## Migration Files
//!
//! ```text
//! migrations/
//! ├── v1.0.0_create_users.sql
//! ├── v1.1.0_add_posts.sql
//! └── R_refresh_reporting_views.sql
//! ```

pub mod database;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod history;
pub mod migration;
pub mod reconcile;
pub mod registry;
pub mod retry;
pub mod testing;
pub mod value;
pub mod version;

// Re-exports
pub use database::{Connection, Database, Executor, quote_identifier, transaction, with_transaction};
pub use discovery::parse_script_name;
pub use engine::{
    AppliedStep, MigrationReport, MigrationStatus, MigrationStatusEntry, Migrator, MigratorConfig,
};
pub use error::{MigrateResult, MigrationError};
pub use history::{AppliedMigration, DEFAULT_HISTORY_TABLE, HistoryStore, LockStrategy};
pub use migration::{
    MAX_DESCRIPTION_LEN, Migration, MigrationCommand, MigrationState, Procedure, Procedures,
};
pub use reconcile::{Reconciliation, RepeatablePolicy, reconcile};
pub use registry::{PreparedMigrations, Registry};
pub use retry::RetryPolicy;
pub use value::{Row, SqlValue};
pub use version::{MigrationVersion, REPEATABLE_MARKER, SchemaVersion};
