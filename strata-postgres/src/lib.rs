//! # strata-postgres
//!
//! PostgreSQL backend for the Strata migration engine.
//!
//! This crate provides:
//! - Connection pool management using `deadpool-postgres`
//! - Prepared statement caching through the pool's per-connection cache
//! - Parameter binding typed by what the server infers for each placeholder
//! - [`strata_migrate::Database`] and [`strata_migrate::Connection`] implementations
//!
//! ## Example
//!
//! ```rust,ignore
//! use strata_migrate::{Migrator, MigratorConfig, Registry};
//! use strata_postgres::PgPool;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let app = PgPool::connect_url("postgresql://app@localhost/db?search_path=app")?;
//!     // Migrations usually run with a more privileged role.
//!     let pool = app.with_role("migrator", std::env::var("MIGRATOR_PASSWORD").ok())?;
//!
//!     let mut registry = Registry::new();
//!     registry.add_directory("./migrations").await?;
//!
//!     let migrator = Migrator::with_config(pool, MigratorConfig::new().schema("app"));
//!     println!("{}", migrator.migrate(&registry).await?.summary());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod types;

pub use config::{PgConfig, SslMode};
pub use connection::PgConnection;
pub use error::{PgError, PgResult};
pub use pool::{MIN_POOL_SIZE, PgPool, PoolConfig, PoolStatus};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::PgConfig;
    pub use crate::connection::PgConnection;
    pub use crate::error::{PgError, PgResult};
    pub use crate::pool::{PgPool, PoolConfig};
}
