//! Integration tests for migrations loaded from a scripts directory.

use pretty_assertions::assert_eq;
use strata::migrate::testing::MemoryDatabase;
use strata::migrate::{MigrationError, Migrator, MigratorConfig, Registry, RetryPolicy};

async fn write(dir: &std::path::Path, name: &str, sql: &str) {
    tokio::fs::write(dir.join(name), sql).await.unwrap();
}

#[tokio::test]
async fn test_scripts_directory_migrates_in_version_order() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("views");
    tokio::fs::create_dir(&nested).await.unwrap();

    write(dir.path(), "v1.10.0_add_audit_log.sql", "CREATE TABLE audit_log (id INT)").await;
    write(dir.path(), "v1.0.0_create_users.sql", "CREATE TABLE users (id INT)").await;
    write(dir.path(), "v1.2_add_user_email.sql", "ALTER TABLE users ADD email TEXT").await;
    write(&nested, "R_refresh_reporting_views.sql", "CREATE VIEW report AS SELECT 1").await;
    write(dir.path(), "README.md", "not a migration").await;

    let mut registry = Registry::new();
    let added = registry.add_directory(dir.path()).await.unwrap();
    assert_eq!(added, 4);

    let db = MemoryDatabase::new();
    let migrator = Migrator::with_config(
        db.clone(),
        MigratorConfig::new().retry(RetryPolicy::immediate()),
    );
    let report = migrator.migrate(&registry).await.unwrap();

    assert_eq!(
        report
            .applied
            .iter()
            .map(|s| (s.version.as_str(), s.description.as_str()))
            .collect::<Vec<_>>(),
        vec![
            ("1.0.0", "create users"),
            ("1.2.0", "add user email"),
            ("1.10.0", "add audit log"),
            ("R", "refresh reporting views"),
        ]
    );
    assert_eq!(
        db.executed(),
        vec![
            "CREATE TABLE users (id INT)",
            "ALTER TABLE users ADD email TEXT",
            "CREATE TABLE audit_log (id INT)",
            "CREATE VIEW report AS SELECT 1",
        ]
    );
    assert_eq!(report.schema_version.as_deref(), Some("1.10.0"));
}

#[tokio::test]
async fn test_badly_named_script_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "create_users.sql", "CREATE TABLE users (id INT)").await;

    let mut registry = Registry::new();
    let err = registry.add_directory(dir.path()).await.unwrap_err();
    assert!(matches!(err, MigrationError::InvalidVersion(_)));
}

#[tokio::test]
async fn test_duplicate_script_versions_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "v1.0_create_users.sql", "CREATE TABLE users (id INT)").await;
    write(dir.path(), "v1.0.0_create_accounts.sql", "CREATE TABLE accounts (id INT)").await;

    let mut registry = Registry::new();
    let err = registry.add_directory(dir.path()).await.unwrap_err();
    assert!(err.is_registration());
    assert!(err.to_string().starts_with("found more than one migration with version 1.0.0"));
}
