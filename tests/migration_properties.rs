//! End-to-end behaviour of the migrator against the in-memory database.
//!
//! These tests exercise whole runs: bootstrap, locking, reconciliation,
//! application and the history table, the way an application would.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use strata::migrate::testing::MemoryDatabase;
use strata::migrate::{
    Executor, LockStrategy, MigrateResult, Migration, MigrationError, MigrationState, Migrator,
    MigratorConfig, Procedure, Registry, RepeatablePolicy, RetryPolicy, SqlValue,
};

const TABLE: &str = "strata_schema_history";

fn config() -> MigratorConfig {
    MigratorConfig::new().retry(RetryPolicy::immediate())
}

fn migrator(db: &MemoryDatabase) -> Migrator<MemoryDatabase> {
    Migrator::with_config(db.clone(), config())
}

fn registry(versions: &[(&str, &str)]) -> Registry {
    let mut registry = Registry::new();
    for (version, sql) in versions {
        let sql = sql.to_string();
        registry
            .register(version, &format!("step {}", version), move |m| {
                m.exec_sql(sql.clone());
            })
            .unwrap();
    }
    registry
}

/// (rank, version, success) for every committed ledger row.
fn ledger(db: &MemoryDatabase) -> Vec<(i64, String, bool)> {
    db.ledger("public", TABLE)
        .into_iter()
        .map(|row| (row.installed_rank, row.version, row.success))
        .collect()
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let db = MemoryDatabase::new();
    let registry = registry(&[("1.0.0", "CREATE TABLE a (id INT)"), ("1.1.0", "CREATE TABLE b (id INT)")]);

    let first = migrator(&db).migrate(&registry).await.unwrap();
    assert_eq!(first.applied_count, 2);
    assert!(first.summary().starts_with(
        "Successfully applied 2 migrations to schema, now at version v1.1.0"
    ));

    let second = migrator(&db).migrate(&registry).await.unwrap();
    assert!(!second.has_changes());
    assert_eq!(second.schema_version.as_deref(), Some("1.1.0"));
    assert_eq!(
        second.summary(),
        "Schema is up to date. No migration necessary."
    );

    assert_eq!(db.executed().len(), 2);
    assert_eq!(ledger(&db).len(), 2);
    assert_eq!(db.index_names("public", TABLE), vec!["strata_schema_history_s_idx"]);
    assert_eq!(db.open_connections(), 0);
}

#[tokio::test]
async fn test_applies_in_semantic_version_order() {
    let db = MemoryDatabase::new();
    let registry = registry(&[
        ("1.10.0", "SELECT 'ten'"),
        ("1.2.0", "SELECT 'two'"),
        ("v1.9", "SELECT 'nine'"),
    ]);

    let report = migrator(&db).migrate(&registry).await.unwrap();

    assert_eq!(
        report.applied.iter().map(|s| s.version.as_str()).collect::<Vec<_>>(),
        vec!["1.2.0", "1.9.0", "1.10.0"]
    );
    assert_eq!(
        db.executed(),
        vec!["SELECT 'two'", "SELECT 'nine'", "SELECT 'ten'"]
    );
    assert_eq!(
        ledger(&db),
        vec![
            (1, "1.2.0".to_string(), true),
            (2, "1.9.0".to_string(), true),
            (3, "1.10.0".to_string(), true),
        ]
    );
}

#[tokio::test]
async fn test_edited_migration_is_rejected() {
    let db = MemoryDatabase::new();
    migrator(&db)
        .migrate(&registry(&[("1.0.0", "CREATE TABLE a (id INT)")]))
        .await
        .unwrap();

    let err = migrator(&db)
        .migrate(&registry(&[("1.0.0", "CREATE TABLE a (id BIGINT)")]))
        .await
        .unwrap_err();

    assert!(err.is_drift());
    match err {
        MigrationError::ChecksumMismatch {
            migration, details, ..
        } => {
            assert_eq!(migration, "version 1.0.0");
            assert!(details.contains("CREATE TABLE a (id BIGINT)"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(db.executed().len(), 1);
}

#[tokio::test]
async fn test_swapped_commands_change_the_checksum() {
    let build = |first: &'static str, second: &'static str| {
        let mut registry = Registry::new();
        registry
            .register("1.0.0", "two statements", move |m| {
                m.exec_sql(first).exec_sql(second);
            })
            .unwrap();
        registry
    };

    let db = MemoryDatabase::new();
    migrator(&db).migrate(&build("SELECT 'a'", "SELECT 'b'")).await.unwrap();

    let err = migrator(&db)
        .migrate(&build("SELECT 'b'", "SELECT 'a'"))
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::ChecksumMismatch { .. }));
}

#[tokio::test]
async fn test_renamed_migration_is_rejected() {
    let db = MemoryDatabase::new();
    migrator(&db)
        .migrate(&registry(&[("1.0.0", "SELECT 1")]))
        .await
        .unwrap();

    let mut renamed = Registry::new();
    renamed
        .register("1.0.0", "something else", |m| {
            m.exec_sql("SELECT 1");
        })
        .unwrap();

    let err = migrator(&db).migrate(&renamed).await.unwrap_err();
    match err {
        MigrationError::DescriptionMismatch {
            applied, resolved, ..
        } => {
            assert_eq!(applied, "step 1.0.0");
            assert_eq!(resolved, "something else");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_out_of_order_migration_is_rejected() {
    let db = MemoryDatabase::new();
    migrator(&db)
        .migrate(&registry(&[("1.0.0", "SELECT 1"), ("2.0.0", "SELECT 2")]))
        .await
        .unwrap();

    let err = migrator(&db)
        .migrate(&registry(&[
            ("1.0.0", "SELECT 1"),
            ("1.5.0", "SELECT 15"),
            ("2.0.0", "SELECT 2"),
        ]))
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "Schema public has a version (2.0.0) that is newer than the available migration (1.5.0)"
    );
    assert_eq!(db.executed(), vec!["SELECT 1", "SELECT 2"]);
}

#[tokio::test]
async fn test_removed_migration_is_rejected() {
    let db = MemoryDatabase::new();
    migrator(&db)
        .migrate(&registry(&[("1.0.0", "SELECT 1"), ("1.1.0", "SELECT 2")]))
        .await
        .unwrap();

    let err = migrator(&db)
        .migrate(&registry(&[("1.0.0", "SELECT 1")]))
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::OrphanAppliedMigration(_)));

    let err = migrator(&db).migrate(&Registry::new()).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Detected applied migration not resolved locally: version 1.0.0"
    );
}

#[tokio::test]
async fn test_older_local_version_is_out_of_order() {
    let db = MemoryDatabase::new();
    migrator(&db)
        .migrate(&registry(&[("2.0.0", "SELECT 2")]))
        .await
        .unwrap();

    let err = migrator(&db)
        .migrate(&registry(&[("1.0.0", "SELECT 1")]))
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::OutOfOrderVersion { .. }));
}

#[tokio::test]
async fn test_concurrent_runners_apply_each_migration_once() {
    let db = MemoryDatabase::new();
    let versions = [
        ("1.0.0", "SELECT 'one'"),
        ("1.1.0", "SELECT 'two'"),
        ("1.2.0", "SELECT 'three'"),
        ("1.3.0", "SELECT 'four'"),
        ("1.4.0", "SELECT 'five'"),
    ];
    let left_registry = registry(&versions);
    let right_registry = registry(&versions);
    let left = migrator(&db);
    let right = migrator(&db);

    let (a, b) = tokio::join!(left.migrate(&left_registry), right.migrate(&right_registry));
    let (a, b) = (a.unwrap(), b.unwrap());

    // Both runners raced through bootstrap and took turns holding the lock.
    assert!(db.lock_waits() > 0);
    assert!(a.applied_count >= 1, "left runner applied nothing");
    assert!(b.applied_count >= 1, "right runner applied nothing");
    assert_eq!(a.applied_count + b.applied_count, 5);
    assert_eq!(a.schema_version.as_deref(), Some("1.4.0"));
    assert_eq!(b.schema_version.as_deref(), Some("1.4.0"));
    assert_eq!(db.executed().len(), 5);
    assert_eq!(
        ledger(&db).iter().map(|(rank, _, _)| *rank).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5]
    );
    assert_eq!(db.open_connections(), 0);
}

#[tokio::test]
async fn test_concurrent_runners_with_row_locks() {
    let db = MemoryDatabase::new();
    let config = config().lock_strategy(LockStrategy::RowsForUpdate);
    let versions = [("1.0.0", "SELECT 'one'"), ("1.1.0", "SELECT 'two'")];

    // Seed the ledger so the row locks have something to hold on to.
    Migrator::with_config(db.clone(), config.clone())
        .migrate(&registry(&versions[..1]))
        .await
        .unwrap();

    let left = Migrator::with_config(db.clone(), config.clone());
    let right = Migrator::with_config(db.clone(), config);
    let (left_registry, right_registry) = (registry(&versions), registry(&versions));

    let waits_before = db.lock_waits();
    let (a, b) = tokio::join!(left.migrate(&left_registry), right.migrate(&right_registry));
    assert_eq!(a.unwrap().applied_count + b.unwrap().applied_count, 1);
    assert!(db.lock_waits() > waits_before);
    assert_eq!(db.executed(), vec!["SELECT 'one'", "SELECT 'two'"]);
}

#[tokio::test]
async fn test_failed_migration_is_recorded_and_retried() {
    let db = MemoryDatabase::new();
    let mut registry = registry(&[("1.0.0", "SELECT 1"), ("1.2.0", "SELECT 3")]);
    registry
        .register("1.1.0", "step 1.1.0", |m| {
            m.exec_sql("SELECT 'first half'").exec_sql("SELECT broken");
        })
        .unwrap();
    db.fail_on("broken");

    let err = migrator(&db).migrate(&registry).await.unwrap_err();
    match &err {
        MigrationError::ApplyFailed { migration, source } => {
            assert_eq!(migration, "schema to version 1.1.0 (step 1.1.0)");
            assert!(source.to_string().contains("injected failure"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(db.executed(), vec!["SELECT 1"]);
    assert_eq!(
        ledger(&db),
        vec![(1, "1.0.0".to_string(), true), (2, "1.1.0".to_string(), false)]
    );

    let status = migrator(&db).status(&registry).await.unwrap();
    assert_eq!(
        status.entries.iter().map(|e| e.state).collect::<Vec<_>>(),
        vec![
            MigrationState::Success,
            MigrationState::Pending,
            MigrationState::Pending
        ]
    );
    assert_eq!(status.current_version.as_deref(), Some("1.0.0"));

    db.clear_failures();
    let report = migrator(&db).migrate(&registry).await.unwrap();
    assert_eq!(report.applied_count, 2);
    assert_eq!(
        db.executed(),
        vec!["SELECT 1", "SELECT 'first half'", "SELECT broken", "SELECT 3"]
    );

    // The failed row is replaced and ranks keep growing.
    assert_eq!(
        ledger(&db),
        vec![
            (1, "1.0.0".to_string(), true),
            (3, "1.1.0".to_string(), true),
            (4, "1.2.0".to_string(), true),
        ]
    );
    assert_eq!(db.open_connections(), 0);
}

struct Explode;

#[async_trait]
impl Procedure for Explode {
    async fn call(
        &self,
        db: &dyn Executor,
        _migration: &Migration,
        _args: &[SqlValue],
    ) -> MigrateResult<()> {
        db.execute("SELECT 'before the fault'", &[]).await?;
        let fault = true;
        if fault {
            panic!("procedure exploded");
        }
        Ok(())
    }
}

struct Backfill {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Procedure for Backfill {
    async fn call(
        &self,
        db: &dyn Executor,
        migration: &Migration,
        args: &[SqlValue],
    ) -> MigrateResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        db.execute(
            &format!("UPDATE accounts SET plan = $1 -- {}", migration.version()),
            args,
        )
        .await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_procedure_runs_inside_the_migration() {
    let db = MemoryDatabase::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut registry = Registry::new();
    registry.procedure(
        "backfill",
        Backfill {
            calls: Arc::clone(&calls),
        },
    );
    registry
        .register("1.0.0", "backfill plans", |m| {
            m.exec_sql("ALTER TABLE accounts ADD COLUMN plan TEXT")
                .call("backfill", vec![SqlValue::from("free")]);
        })
        .unwrap();

    migrator(&db).migrate(&registry).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        db.executed(),
        vec![
            "ALTER TABLE accounts ADD COLUMN plan TEXT",
            "UPDATE accounts SET plan = $1 -- 1.0.0",
        ]
    );
}

#[tokio::test]
async fn test_procedure_panic_rolls_back_and_is_recorded() {
    let db = MemoryDatabase::new();
    let mut registry = Registry::new();
    registry.procedure("explode", Explode);
    registry
        .register("1.0.0", "explode", |m| {
            m.exec_sql("SELECT 'first'").call("explode", Vec::new());
        })
        .unwrap();

    let err = migrator(&db).migrate(&registry).await.unwrap_err();
    match err {
        MigrationError::ApplyFailed { source, .. } => match *source {
            MigrationError::Panic { message, .. } => assert_eq!(message, "procedure exploded"),
            other => panic!("unexpected source: {other:?}"),
        },
        other => panic!("unexpected error: {other:?}"),
    }

    assert!(db.executed().is_empty());
    assert_eq!(ledger(&db), vec![(1, "1.0.0".to_string(), false)]);
    assert_eq!(db.open_connections(), 0);
}

#[tokio::test]
async fn test_bootstrap_retries_transient_failures() {
    let db = MemoryDatabase::new();
    db.fail_times("CREATE TABLE \"public\"", 2);

    let report = migrator(&db)
        .migrate(&registry(&[("1.0.0", "SELECT 1")]))
        .await
        .unwrap();

    assert_eq!(report.applied_count, 1);
    assert_eq!(db.failures("CREATE TABLE \"public\""), 2);
}

#[tokio::test]
async fn test_bootstrap_gives_up_after_budget() {
    let db = MemoryDatabase::new();
    db.fail_on("CREATE TABLE \"public\"");
    let config = config().retry(RetryPolicy::immediate().max_attempts(3));

    let err = Migrator::with_config(db.clone(), config)
        .migrate(&registry(&[("1.0.0", "SELECT 1")]))
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::Database(_)));
    assert_eq!(db.failures("CREATE TABLE \"public\""), 3);
    assert!(db.executed().is_empty());
    assert_eq!(db.open_connections(), 0);
}

#[tokio::test]
async fn test_custom_schema_and_table() {
    let db = MemoryDatabase::new();
    let migrator = Migrator::with_config(db.clone(), config().schema("billing").table("ledger"));

    migrator
        .migrate(&registry(&[("1.0.0", "SELECT 1")]))
        .await
        .unwrap();

    assert!(db.has_schema("billing"));
    assert_eq!(db.ledger("billing", "ledger").len(), 1);
    assert_eq!(db.index_names("billing", "ledger"), vec!["ledger_s_idx"]);
    assert!(db.ledger("public", TABLE).is_empty());
}

#[tokio::test]
async fn test_migrations_run_in_the_configured_schema() {
    let db = MemoryDatabase::new();
    let migrator = Migrator::with_config(db.clone(), config().schema("billing"));
    let mut registry = registry(&[("1.0.0", "CREATE TABLE users (id INT)")]);
    registry
        .register("1.1.0", "two steps", |m| {
            m.exec_sql("CREATE TABLE invoices (id INT)")
                .exec_sql("CREATE INDEX invoices_id ON invoices (id)");
        })
        .unwrap();

    migrator.migrate(&registry).await.unwrap();

    let billing = Some("billing".to_string());
    assert_eq!(
        db.executed_with_search_path(),
        vec![
            (billing.clone(), "CREATE TABLE users (id INT)".to_string()),
            (billing.clone(), "CREATE TABLE invoices (id INT)".to_string()),
            (billing, "CREATE INDEX invoices_id ON invoices (id)".to_string()),
        ]
    );
}

fn with_views(versions: &[(&str, &str)], view_sql: &'static str) -> Registry {
    let mut registry = registry(versions);
    registry
        .register("R", "refresh views", move |m| {
            m.exec_sql(view_sql);
        })
        .unwrap();
    registry
}

#[tokio::test]
async fn test_repeatable_runs_every_time_by_default() {
    let db = MemoryDatabase::new();
    let registry = with_views(&[("1.0.0", "SELECT 1")], "CREATE VIEW v AS SELECT 1");

    let first = migrator(&db).migrate(&registry).await.unwrap();
    assert_eq!(first.applied_count, 2);
    let second = migrator(&db).migrate(&registry).await.unwrap();
    assert_eq!(second.applied_count, 1);

    assert_eq!(
        db.executed(),
        vec![
            "SELECT 1",
            "CREATE VIEW v AS SELECT 1",
            "CREATE VIEW v AS SELECT 1"
        ]
    );
    assert_eq!(
        ledger(&db),
        vec![
            (1, "1.0.0".to_string(), true),
            (2, "R".to_string(), true),
            (3, "R".to_string(), true),
        ]
    );
}

#[tokio::test]
async fn test_repeatable_runs_on_checksum_change() {
    let db = MemoryDatabase::new();
    let config = config().repeatable_policy(RepeatablePolicy::OnChecksumChange);
    let run = |registry: Registry| {
        let migrator = Migrator::with_config(db.clone(), config.clone());
        async move { migrator.migrate(&registry).await.unwrap().applied_count }
    };

    assert_eq!(run(with_views(&[("1.0.0", "SELECT 1")], "CREATE VIEW v AS SELECT 1")).await, 2);
    assert_eq!(run(with_views(&[("1.0.0", "SELECT 1")], "CREATE VIEW v AS SELECT 1")).await, 0);
    assert_eq!(run(with_views(&[("1.0.0", "SELECT 1")], "CREATE VIEW v AS SELECT 2")).await, 1);

    assert_eq!(
        db.executed(),
        vec![
            "SELECT 1",
            "CREATE VIEW v AS SELECT 1",
            "CREATE VIEW v AS SELECT 2"
        ]
    );
}
