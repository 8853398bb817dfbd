//! End-to-end startup migration from changelog files on disk

use keel::changelog::ExtensionSource;
use keel::config::MigrationConfig;
use keel::migration::MigrationEngine;
use keel::{KeelExecutor, MigrationError, SqlValue, SqliteExecutor};
use std::fs;
use std::path::Path;

const CORE: &str = r#"{
  "changeSets": [
    {
      "id": "1.0.0",
      "author": "keel",
      "comment": "realm table",
      "changes": [
        { "sql": "CREATE TABLE ${prefix}realm (id VARCHAR(36) PRIMARY KEY, name VARCHAR(255))" },
        { "createIndex": { "indexName": "idx_realm_name", "tableName": "${prefix}realm", "columns": ["name"], "unique": true } }
      ]
    },
    {
      "id": "1.0.1",
      "author": "keel",
      "changes": [ { "dropTable": { "tableName": "legacy_realm", "ifExists": true } } ]
    }
  ]
}"#;

const REGIONS: &str = "--changeset acme:regions-1\n\
    --comment: region table\n\
    CREATE TABLE ${prefix}region (id VARCHAR(36) PRIMARY KEY, realm_id VARCHAR(36));\n\
    CREATE INDEX idx_region_realm ON ${prefix}region (realm_id);\n";

const AUDIT: &str = "--changeset acme:audit-1\n\
    CREATE TABLE ${prefix}audit (id INTEGER PRIMARY KEY, event TEXT);\n";

fn write_changelogs(root: &Path) {
    fs::create_dir_all(root.join("META-INF")).unwrap();
    fs::create_dir_all(root.join("ext")).unwrap();
    fs::write(root.join("META-INF/keel-changelog.json"), CORE).unwrap();
    fs::write(root.join("ext/regions.sql"), REGIONS).unwrap();
    fs::write(root.join("ext/audit.sql"), AUDIT).unwrap();
}

fn engine(root: &Path) -> MigrationEngine {
    let mut config = MigrationConfig {
        changelog_root: root.to_path_buf(),
        ..MigrationConfig::default()
    };
    config.parameters.insert("prefix".to_string(), "kc_".to_string());
    MigrationEngine::new(config).unwrap()
}

fn extensions() -> Vec<ExtensionSource> {
    vec![
        ExtensionSource::new("regions", "ext/regions.sql"),
        ExtensionSource::new("audit", "ext/audit.sql"),
    ]
}

#[test]
fn test_startup_migration_applies_core_then_sorted_extensions() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    write_changelogs(dir.path());
    let engine = engine(dir.path());
    let executor = SqliteExecutor::open(dir.path().join("keel.db")).unwrap();

    let result = engine.migrate(&executor, extensions()).unwrap();
    let applied: Vec<_> = result.applied.iter().map(|identity| identity.id.as_str()).collect();
    assert_eq!(applied, vec!["1.0.0", "1.0.1", "audit-1", "regions-1"]);
    assert!(result.lock_released);

    executor
        .execute(
            "INSERT INTO kc_region (id, realm_id) VALUES (?1, ?2)",
            &[SqlValue::from("eu"), SqlValue::from("master")],
        )
        .unwrap();

    let again = engine.migrate(&executor, extensions()).unwrap();
    assert_eq!(again.applied_count(), 0);
    assert_eq!(again.previously_applied, 4);

    let status = engine.status(&executor, extensions()).unwrap();
    assert!(status.is_up_to_date());
    let orders: Vec<_> = status.applied.iter().map(|r| r.order_executed).collect();
    assert_eq!(orders, vec![1, 2, 3, 4]);
}

#[test]
fn test_new_extension_is_applied_on_next_startup() {
    let dir = tempfile::tempdir().unwrap();
    write_changelogs(dir.path());
    let engine = engine(dir.path());
    let executor = SqliteExecutor::open(dir.path().join("keel.db")).unwrap();

    let first = engine
        .migrate(&executor, vec![ExtensionSource::new("regions", "ext/regions.sql")])
        .unwrap();
    assert_eq!(first.applied_count(), 3);

    let second = engine.migrate(&executor, extensions()).unwrap();
    assert_eq!(second.applied.len(), 1);
    assert_eq!(second.applied[0].source, "ext/audit.sql");
}

#[test]
fn test_extension_redefining_core_changeset_aborts_before_touching_database() {
    let dir = tempfile::tempdir().unwrap();
    write_changelogs(dir.path());
    fs::write(dir.path().join("ext/rogue.json"), CORE.replace("realm table", "hijacked")).unwrap();
    let engine = engine(dir.path());

    // Same ids and authors, but a different source file: a distinct identity.
    let executor = SqliteExecutor::open_in_memory().unwrap();
    let plan = engine
        .plan("sqlite", vec![ExtensionSource::new("rogue", "ext/rogue.json")])
        .unwrap();
    assert_eq!(plan.len(), 4);

    let err = engine
        .plan(
            "sqlite",
            vec![
                ExtensionSource::new("regions", "ext/regions.sql"),
                ExtensionSource::new("regions-copy", "ext/regions.sql"),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, MigrationError::DuplicateChangeSetIdentity { .. }));
    assert!(executor.query_all("SELECT * FROM keel_changelog", &[]).is_err());
}

#[test]
fn test_missing_extension_changelog_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    write_changelogs(dir.path());
    let engine = engine(dir.path());
    let executor = SqliteExecutor::open_in_memory().unwrap();

    let err = engine
        .migrate(&executor, vec![ExtensionSource::new("ghost", "ext/ghost.sql")])
        .unwrap_err();
    assert!(matches!(err, MigrationError::Parse { ref locator, .. } if locator == "ext/ghost.sql"));
}
