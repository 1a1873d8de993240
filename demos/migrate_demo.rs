//! Runs a small migration set and shows what Strata logs while doing it.
//!
//! Without `DATABASE_URL` the run goes against the in-memory database, twice,
//! so the second run reports that the schema is up to date.
//!
//! ```bash
//! # Info level (JSON output, default)
//! cargo run --example migrate_demo
//!
//! # Debug level - see every statement and lock transition
//! STRATA_DEBUG=true STRATA_LOG_FORMAT=pretty cargo run --example migrate_demo
//!
//! # Against a real server
//! DATABASE_URL=postgresql://migrator@localhost/app cargo run --example migrate_demo
//! ```

use strata::migrate::testing::MemoryDatabase;
use strata::migrate::{Database, MigrateResult, Migrator, MigratorConfig, Registry};
use strata::postgres::PgPool;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let level = std::env::var("STRATA_LOG_LEVEL").unwrap_or_else(|_| {
        if std::env::var("STRATA_DEBUG").is_ok() {
            "debug".into()
        } else {
            "info".into()
        }
    });

    let format = std::env::var("STRATA_LOG_FORMAT").unwrap_or_else(|_| "json".into());

    let filter = EnvFilter::try_new(format!(
        "strata={},strata_migrate={},strata_postgres={}",
        level, level, level
    ))
    .unwrap_or_else(|_| EnvFilter::new("warn"));

    match format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .compact()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .json()
                .init();
        }
    }
}

fn registry() -> MigrateResult<Registry> {
    let mut registry = Registry::new();
    registry.register("1.0.0", "create accounts", |m| {
        m.exec_sql("CREATE TABLE accounts (id BIGSERIAL PRIMARY KEY, email TEXT NOT NULL)");
    })?;
    registry.register("1.1.0", "add account plan", |m| {
        m.exec_sql("ALTER TABLE accounts ADD COLUMN plan TEXT NOT NULL DEFAULT 'free'");
    })?;
    registry.register("R", "refresh account summary", |m| {
        m.exec_sql(
            "CREATE OR REPLACE VIEW account_summary AS \
             SELECT plan, count(*) AS accounts FROM accounts GROUP BY plan",
        );
    })?;
    Ok(registry)
}

async fn run<D: Database>(db: D, registry: &Registry) -> MigrateResult<()> {
    let migrator = Migrator::with_config(db, MigratorConfig::new().schema("demo"));

    for pass in 1..=2 {
        let report = migrator.migrate(registry).await?;
        println!("run {}: {}", pass, report.summary());
    }

    let status = migrator.status(registry).await?;
    for entry in &status.entries {
        println!("  {:<8} {:<28} {:?}", entry.version, entry.description, entry.state);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    println!("=== Strata Migration Demo ===\n");
    let registry = registry()?;

    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = PgPool::connect_url(&url)?;
            run(pool.clone(), &registry).await?;
            pool.close();
        }
        Err(_) => {
            let db = MemoryDatabase::new();
            run(db.clone(), &registry).await?;
            println!("\nStatements executed:");
            for sql in db.executed() {
                println!("  {}", sql);
            }
        }
    }

    Ok(())
}
