//! # Strata
//!
//! Versioned schema migrations for PostgreSQL.
//!
//! Strata provides:
//! - Versioned and repeatable migrations, registered in code or discovered from `.sql` files
//! - A schema history table that records every attempt, successful or not
//! - Drift detection: out-of-order versions, edited or renamed migrations, orphans
//! - Cross-process mutual exclusion through a lock on the history table
//! - Idempotent bootstrap of the history table with retry
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use strata::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = PgPool::connect_url("postgresql://migrator@localhost/mydb")?;
//!
//!     let mut registry = Registry::new();
//!     registry.register("1.0.0", "create users", |m| {
//!         m.exec_sql("CREATE TABLE users (id BIGSERIAL PRIMARY KEY, email TEXT NOT NULL)");
//!     })?;
//!     registry.add_directory("./migrations").await?;
//!
//!     let config = MigratorConfig::load("strata.toml").await?;
//!     let report = Migrator::with_config(pool, config).migrate(&registry).await?;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

/// Migration engine: registry, history ledger, reconciliation and runner.
pub mod migrate {
    pub use strata_migrate::*;
}

/// PostgreSQL backend.
#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres {
    pub use strata_postgres::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::migrate::{
        Database, LockStrategy, MigrateResult, Migration, MigrationError, MigrationReport,
        Migrator, MigratorConfig, Registry, RepeatablePolicy, RetryPolicy,
    };
    #[cfg(feature = "postgres")]
    pub use crate::postgres::{PgConfig, PgPool};
}

// Re-export key types at the crate root
pub use strata_migrate::{MigrateResult, MigrationError, Migrator, MigratorConfig, Registry};
