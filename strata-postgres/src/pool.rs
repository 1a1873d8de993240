//! The connection pool handed to the migrator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use strata_migrate::{Connection, Database, Executor, MigrateResult, Row, SqlValue};
use tokio_postgres::NoTls;
use tracing::{debug, info};

use crate::config::PgConfig;
use crate::connection::{PgConnection, execute_on, query_on};
use crate::error::{PgError, PgResult};

/// Connections a migration run holds at once: one keeps the history table
/// locked while the other applies the migration.
pub const MIN_POOL_SIZE: usize = 2;

/// Pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of open connections. At least [`MIN_POOL_SIZE`].
    pub max_connections: usize,
    /// How long to wait for a free connection or a new one to open.
    pub wait_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            wait_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl PoolConfig {
    /// Set the maximum number of open connections.
    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    /// Set how long to wait for a connection.
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    fn validate(&self) -> PgResult<()> {
        if self.max_connections < MIN_POOL_SIZE {
            return Err(PgError::config(format!(
                "pool of {} connection(s) is too small: a migration run needs {}",
                self.max_connections, MIN_POOL_SIZE
            )));
        }
        Ok(())
    }
}

/// A PostgreSQL connection pool.
///
/// This is the [`Database`] handed to the migrator: statements run on the
/// pool itself execute in autocommit mode on any pooled connection, and
/// [`Database::connect`] hands out a dedicated [`PgConnection`]. Connections
/// are opened lazily, so creating a pool never dials the server.
#[derive(Clone)]
pub struct PgPool {
    inner: Pool,
    config: Arc<PgConfig>,
    pool_config: PoolConfig,
}

impl PgPool {
    /// Create a pool with default sizing.
    pub fn new(config: PgConfig) -> PgResult<Self> {
        Self::with_pool_config(config, PoolConfig::default())
    }

    /// Create a pool with explicit sizing.
    pub fn with_pool_config(config: PgConfig, pool_config: PoolConfig) -> PgResult<Self> {
        pool_config.validate()?;

        let manager = Manager::from_config(
            config.to_pg_config(),
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let inner = Pool::builder(manager)
            .runtime(Runtime::Tokio1)
            .max_size(pool_config.max_connections)
            .wait_timeout(pool_config.wait_timeout)
            .create_timeout(pool_config.wait_timeout)
            .build()
            .map_err(|e| PgError::config(format!("failed to create pool: {}", e)))?;

        info!(
            url = %config,
            max_connections = pool_config.max_connections,
            "PostgreSQL connection pool created"
        );

        Ok(Self {
            inner,
            config: Arc::new(config),
            pool_config,
        })
    }

    /// Create a pool from a database URL with default sizing.
    pub fn connect_url(url: &str) -> PgResult<Self> {
        Self::new(PgConfig::from_url(url)?)
    }

    /// A separate pool on the same database and sizing, logged in as
    /// another role. Typically the application's pool is used to derive the
    /// more privileged pool that runs migrations.
    pub fn with_role(&self, user: impl Into<String>, password: Option<String>) -> PgResult<Self> {
        Self::with_pool_config(self.config.as_role(user, password), self.pool_config)
    }

    /// Get a dedicated connection.
    pub async fn get(&self) -> PgResult<PgConnection> {
        debug!("Acquiring connection from pool");
        let client = self.inner.get().await?;
        Ok(PgConnection::new(client))
    }

    /// Current pool status.
    pub fn status(&self) -> PoolStatus {
        let status = self.inner.status();
        PoolStatus {
            available: status.available as usize,
            size: status.size as usize,
            max_size: status.max_size,
            waiting: status.waiting,
        }
    }

    /// The connection settings.
    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    /// Close the pool. Connections in use are closed when returned.
    pub fn close(&self) {
        self.inner.close();
        info!(url = %self.config, "PostgreSQL connection pool closed");
    }
}

impl std::fmt::Debug for PgPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgPool")
            .field("target", &self.config.to_string())
            .field("status", &self.status())
            .finish()
    }
}

#[async_trait]
impl Executor for PgPool {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> MigrateResult<u64> {
        let client = self.inner.get().await.map_err(PgError::from)?;
        Ok(execute_on(&client, sql, params).await?)
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> MigrateResult<Vec<Row>> {
        let client = self.inner.get().await.map_err(PgError::from)?;
        Ok(query_on(&client, sql, params).await?)
    }
}

#[async_trait]
impl Database for PgPool {
    async fn connect(&self) -> MigrateResult<Box<dyn Connection>> {
        Ok(Box::new(self.get().await?))
    }
}

/// Pool status information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Idle connections.
    pub available: usize,
    /// Open connections.
    pub size: usize,
    /// Maximum number of connections.
    pub max_size: usize,
    /// Tasks waiting for a connection.
    pub waiting: usize,
}
