//! Integration tests for tidemark-core.
//!
//! Requires a running PostgreSQL instance. Tests are skipped when
//! TEST_DATABASE_URL is unset, e.g.:
//!   TEST_DATABASE_URL="host=localhost user=postgres dbname=tidemark_test"
//!
//! Run with: cargo test --test integration_test

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_postgres::Client;

use tidemark_core::config::{DatabaseConfig, MigrationSettings, SchemaSettings, TidemarkConfig};
use tidemark_core::db::{self, quote_ident};
use tidemark_core::history::VersionStore;
use tidemark_core::hooks::SqlHook;
use tidemark_core::{
    CodeMigration, HookDescriptor, HookPhase, InlineSchema, MigrateOptions, MigrationRegistry,
    MigrationState, RebuildOptions, RollbackTarget, Tidemark, TidemarkError,
};

const TABLE: &str = "tidemark_migrations";

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL").ok()
}

macro_rules! require_db {
    () => {
        match test_url() {
            Some(url) => url,
            None => {
                eprintln!("TEST_DATABASE_URL not set; skipping");
                return;
            }
        }
    };
}

/// Build a config pointing at a unique schema to isolate test runs.
fn test_config(url: &str, schema: &str, migrations_dir: &Path) -> TidemarkConfig {
    TidemarkConfig {
        database: DatabaseConfig {
            url: Some(url.to_string()),
            ..Default::default()
        },
        migrations: MigrationSettings {
            directory: migrations_dir.to_path_buf(),
            schema: schema.to_string(),
            lock_timeout_secs: 5,
            ..Default::default()
        },
        schema: SchemaSettings {
            managed_schemas: vec![schema.to_string()],
            ..Default::default()
        },
        hooks: Vec::new(),
    }
}

/// Helper: connect, create a fresh schema, return client + schema name.
async fn setup_schema(url: &str, prefix: &str) -> (Client, String) {
    let client = db::connect(url).await.expect("Failed to connect to DB");
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let schema = format!("tidemark_test_{}_{}_{}", prefix, std::process::id(), id);
    client
        .batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&schema)))
        .await
        .expect("Failed to create test schema");
    (client, schema)
}

async fn teardown_schema(url: &str, schema: &str) {
    let client = db::connect(url).await.unwrap();
    let _ = client
        .batch_execute(&format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(schema)))
        .await;
}

/// Write `<stem>.up.sql` and `<stem>.down.sql`.
fn write_pair(dir: &Path, stem: &str, up: &str, down: &str) {
    std::fs::write(dir.join(format!("{}.up.sql", stem)), up).unwrap();
    std::fs::write(dir.join(format!("{}.down.sql", stem)), down).unwrap();
}

fn create_table_pair(dir: &Path, schema: &str, stem: &str, table: &str) {
    write_pair(
        dir,
        stem,
        &format!("CREATE TABLE {}.{} (id SERIAL PRIMARY KEY);", schema, table),
        &format!("DROP TABLE {}.{};", schema, table),
    );
}

async fn table_exists(url: &str, schema: &str, table: &str) -> bool {
    let client = db::connect(url).await.unwrap();
    let row = client
        .query_one(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2)",
            &[&schema, &table],
        )
        .await
        .unwrap();
    row.get(0)
}

async fn recorded_versions(url: &str, schema: &str) -> Vec<String> {
    let client = db::connect(url).await.unwrap();
    VersionStore::new(&client, schema, TABLE)
        .applied_versions()
        .await
        .unwrap()
}

// ─── Tests ───

#[tokio::test]
async fn test_migrate_applies_pending_in_order() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "migrate").await;
    let dir = tempfile::tempdir().unwrap();
    create_table_pair(dir.path(), &schema, "001_create_users", "users");
    create_table_pair(dir.path(), &schema, "002_create_orders", "orders");

    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client).unwrap();
    let applied = tm.apply_pending(false).await.expect("migrate failed");
    assert_eq!(applied, vec!["001", "002"]);

    // Second run is a no-op.
    assert!(tm.apply_pending(false).await.unwrap().is_empty());

    let status = tm.status().await.unwrap();
    assert_eq!(status.applied_count, 2);
    assert_eq!(status.pending_count, 0);
    assert!(status.migrations.iter().all(|m| m.state == MigrationState::Applied));
    assert!(table_exists(&url, &schema, "orders").await);

    let store = VersionStore::new(tm.client(), &schema, TABLE);
    assert!(store.is_applied("002").await.unwrap());
    assert!(!store.is_applied("003").await.unwrap());

    teardown_schema(&url, &schema).await;
}

#[tokio::test]
async fn test_failure_keeps_earlier_versions_committed() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "isolation").await;
    let dir = tempfile::tempdir().unwrap();
    create_table_pair(dir.path(), &schema, "001_ok", "first");
    write_pair(
        dir.path(),
        "002_broken",
        &format!("CREATE TABLE {}.second (id INT);\nSELECT * FROM no_such_table;", schema),
        "SELECT 1;",
    );
    create_table_pair(dir.path(), &schema, "003_never", "third");

    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client).unwrap();
    let err = tm.migrate(&MigrateOptions::default()).await.unwrap_err();
    match &err {
        TidemarkError::MigrationFailed {
            version,
            applied_before,
            non_transactional,
            ..
        } => {
            assert_eq!(version, "002");
            assert_eq!(applied_before, &vec!["001".to_string()]);
            assert!(!non_transactional);
        }
        other => panic!("expected MigrationFailed, got {:?}", other),
    }
    assert_eq!(err.exit_code(), 3);

    assert_eq!(recorded_versions(&url, &schema).await, vec!["001"]);
    assert!(table_exists(&url, &schema, "first").await);
    assert!(!table_exists(&url, &schema, "second").await);
    assert!(!table_exists(&url, &schema, "third").await);

    let status = tm.status().await.unwrap();
    let second = status.migrations.iter().find(|m| m.version == "002").unwrap();
    assert_eq!(second.state, MigrationState::Pending);

    teardown_schema(&url, &schema).await;
}

#[tokio::test]
async fn test_continue_on_error_runs_the_rest() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "continue").await;
    let dir = tempfile::tempdir().unwrap();
    write_pair(dir.path(), "001_broken", "SELECT * FROM no_such_table;", "SELECT 1;");
    create_table_pair(dir.path(), &schema, "002_fine", "fine");

    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client).unwrap();
    let report = tm
        .migrate(&MigrateOptions {
            continue_on_error: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(report.applied_versions(), vec!["002"]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].version, "001");

    teardown_schema(&url, &schema).await;
}

#[tokio::test]
async fn test_duplicate_versions_block_before_any_sql() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "dupes").await;
    let dir = tempfile::tempdir().unwrap();
    create_table_pair(dir.path(), &schema, "001_create_users", "users");
    create_table_pair(dir.path(), &schema, "001_backfill_data", "backfill");

    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client).unwrap();
    let dupes = tm.find_duplicate_versions().unwrap();
    assert_eq!(dupes.get("001").map(Vec::len), Some(2));

    let err = tm.apply_pending(false).await.unwrap_err();
    assert!(matches!(err, TidemarkError::DuplicateVersions(_)));
    assert_eq!(err.exit_code(), 3);
    assert!(matches!(
        tm.baseline("001").await,
        Err(TidemarkError::DuplicateVersions(_))
    ));
    assert!(!table_exists(&url, &schema, TABLE).await);
    assert!(!table_exists(&url, &schema, "users").await);

    teardown_schema(&url, &schema).await;
}

#[tokio::test]
async fn test_force_reapplies_and_rewrites_record() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "force").await;
    let dir = tempfile::tempdir().unwrap();
    write_pair(
        dir.path(),
        "001_counter",
        &format!(
            "CREATE TABLE IF NOT EXISTS {s}.runs (n INT);\nINSERT INTO {s}.runs VALUES (1);",
            s = schema
        ),
        &format!("DROP TABLE {}.runs;", schema),
    );

    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client).unwrap();
    assert_eq!(tm.apply_pending(false).await.unwrap(), vec!["001"]);
    assert_eq!(tm.apply_pending(true).await.unwrap(), vec!["001"]);

    let row = tm
        .client()
        .query_one(&format!("SELECT count(*) FROM {}.runs", schema), &[])
        .await
        .unwrap();
    assert_eq!(row.get::<_, i64>(0), 2);
    assert_eq!(recorded_versions(&url, &schema).await, vec!["001"]);

    teardown_schema(&url, &schema).await;
}

#[tokio::test]
async fn test_baseline_through_is_a_union() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "baseline").await;
    let dir = tempfile::tempdir().unwrap();
    for (i, table) in ["a", "b", "c", "d"].iter().enumerate() {
        create_table_pair(dir.path(), &schema, &format!("00{}_{}", i + 1, table), table);
    }

    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client).unwrap();
    let first = tm.baseline("001").await.unwrap();
    assert_eq!(first.marked, vec!["001"]);
    let store = VersionStore::new(tm.client(), &schema, TABLE);
    let original = store.applied_records().await.unwrap()[0].applied_at;

    let report = tm.baseline("002").await.unwrap();
    assert_eq!(report.marked, vec!["002"]);

    let records = store.applied_records().await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].applied_at, original);

    let status = tm.status().await.unwrap();
    let pending: Vec<&str> = status
        .migrations
        .iter()
        .filter(|m| m.state == MigrationState::Pending)
        .map(|m| m.version.as_str())
        .collect();
    assert_eq!(pending, vec!["003", "004"]);
    assert!(!table_exists(&url, &schema, "a").await);

    teardown_schema(&url, &schema).await;
}

#[tokio::test]
async fn test_baseline_unknown_version_writes_nothing() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "baseline_missing").await;
    let dir = tempfile::tempdir().unwrap();
    create_table_pair(dir.path(), &schema, "001_a", "a");

    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client).unwrap();
    let err = tm.baseline("999").await.unwrap_err();
    assert!(matches!(&err, TidemarkError::VersionNotFound(v) if v == "999"));
    assert!(recorded_versions(&url, &schema).await.is_empty());

    teardown_schema(&url, &schema).await;
}

#[tokio::test]
async fn test_dry_run_leaves_database_unchanged() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "dry_run").await;
    let dir = tempfile::tempdir().unwrap();
    create_table_pair(dir.path(), &schema, "001_users", "users");
    write_pair(
        dir.path(),
        "002_add_email",
        &format!("ALTER TABLE {}.users ADD COLUMN email TEXT;", schema),
        &format!("ALTER TABLE {}.users DROP COLUMN email;", schema),
    );

    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client).unwrap();
    let first = tm.dry_run(None).await.expect("dry run failed");
    let second = tm.dry_run(None).await.expect("second dry run failed");

    assert_eq!(first.records.len(), 2);
    assert_eq!(second.records.len(), 2);
    assert!(first.records.iter().all(|r| r.success));
    assert!(second.records.iter().all(|r| r.success));
    let record = &first.records[0];
    assert_eq!(record.confidence_percent, 85);
    assert!(record.estimated_production_range_ms.0 <= record.execution_time_ms);
    assert!(record.estimated_production_range_ms.1 >= record.execution_time_ms);

    assert!(!table_exists(&url, &schema, "users").await);
    assert!(!table_exists(&url, &schema, TABLE).await);

    teardown_schema(&url, &schema).await;
}

#[tokio::test]
async fn test_dry_run_failure_is_wrapped_and_rolled_back() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "dry_run_fail").await;
    let dir = tempfile::tempdir().unwrap();
    create_table_pair(dir.path(), &schema, "001_users", "users");
    write_pair(dir.path(), "002_bad", "SELECT * FROM no_such_table;", "SELECT 1;");

    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client).unwrap();
    let err = tm.dry_run(None).await.unwrap_err();
    assert!(matches!(&err, TidemarkError::DryRunFailed { version, .. } if version == "002"));
    assert!(!table_exists(&url, &schema, "users").await);

    // The connection is usable afterwards.
    assert!(tm.status().await.is_ok());

    teardown_schema(&url, &schema).await;
}

#[tokio::test]
async fn test_dry_run_ignores_inline_commit() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "dry_run_commit").await;
    let dir = tempfile::tempdir().unwrap();
    write_pair(
        dir.path(),
        "001_leak",
        &format!("CREATE TABLE {}.leak (id INT); COMMIT;", schema),
        &format!("DROP TABLE {}.leak;", schema),
    );

    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client).unwrap();
    let report = tm.dry_run(None).await.expect("dry run failed");
    assert_eq!(report.records.len(), 1);
    assert!(report.records[0].warnings.iter().any(|w| w.contains("transaction control")));
    assert!(!table_exists(&url, &schema, "leak").await);
    assert!(!table_exists(&url, &schema, TABLE).await);

    teardown_schema(&url, &schema).await;
}

struct CommitsInline {
    schema: String,
}

#[async_trait]
impl CodeMigration for CommitsInline {
    fn version(&self) -> &str {
        "001"
    }

    fn name(&self) -> &str {
        "commits_inline"
    }

    async fn up(&self, client: &Client) -> tidemark_core::error::Result<()> {
        client
            .batch_execute(&format!("CREATE TABLE {}.committed (id INT); COMMIT;", self.schema))
            .await?;
        Ok(())
    }

    async fn down(&self, client: &Client) -> tidemark_core::error::Result<()> {
        client
            .batch_execute(&format!("DROP TABLE {}.committed", self.schema))
            .await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_dry_run_fails_when_transaction_ends_early() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "dry_run_ended").await;
    let dir = tempfile::tempdir().unwrap();

    let mut registry = MigrationRegistry::new();
    registry.register(Arc::new(CommitsInline {
        schema: schema.clone(),
    }));
    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client)
        .unwrap()
        .with_registry(registry);

    let err = tm.dry_run(None).await.unwrap_err();
    match &err {
        TidemarkError::DryRunFailed { version, reason, .. } => {
            assert_eq!(version, "001");
            assert!(reason.contains("ended the dry-run transaction"));
        }
        other => panic!("expected DryRunFailed, got {:?}", other),
    }
    assert!(tm.status().await.is_ok());

    teardown_schema(&url, &schema).await;
}

#[tokio::test]
async fn test_inline_commit_does_not_break_step_isolation() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "inline_commit").await;
    let dir = tempfile::tempdir().unwrap();
    write_pair(
        dir.path(),
        "001_leak",
        &format!("CREATE TABLE {}.leak (id INT); COMMIT; SELECT * FROM no_such_table;", schema),
        &format!("DROP TABLE {}.leak;", schema),
    );

    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client).unwrap();
    let err = tm.apply_pending(false).await.unwrap_err();
    assert!(matches!(err, TidemarkError::MigrationFailed { .. }));
    assert!(!table_exists(&url, &schema, "leak").await);
    assert!(recorded_versions(&url, &schema).await.is_empty());

    teardown_schema(&url, &schema).await;
}

#[tokio::test]
async fn test_plpgsql_function_migration_applies() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "plpgsql").await;
    let dir = tempfile::tempdir().unwrap();
    write_pair(
        dir.path(),
        "001_fn",
        &format!(
            "CREATE FUNCTION {}.touch() RETURNS integer AS $$\nBEGIN\n RETURN 1;\nEND;\n$$ LANGUAGE plpgsql;",
            schema
        ),
        &format!("DROP FUNCTION {}.touch();", schema),
    );

    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client).unwrap();
    assert_eq!(tm.apply_pending(false).await.expect("migrate failed"), vec!["001"]);

    let row = tm
        .client()
        .query_one(&format!("SELECT {}.touch()", schema), &[])
        .await
        .unwrap();
    assert_eq!(row.get::<_, i32>(0), 1);

    tm.rollback(&RollbackTarget::Steps(1)).await.unwrap();
    assert!(recorded_versions(&url, &schema).await.is_empty());

    teardown_schema(&url, &schema).await;
}

#[tokio::test]
async fn test_rollback_steps_and_versions() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "down").await;
    let dir = tempfile::tempdir().unwrap();
    create_table_pair(dir.path(), &schema, "001_a", "a");
    create_table_pair(dir.path(), &schema, "002_b", "b");
    create_table_pair(dir.path(), &schema, "003_c", "c");

    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client).unwrap();
    tm.apply_pending(false).await.unwrap();

    let report = tm.rollback(&RollbackTarget::Steps(2)).await.unwrap();
    assert_eq!(report.rolled_back_versions(), vec!["003", "002"]);
    assert_eq!(recorded_versions(&url, &schema).await, vec!["001"]);
    assert!(!table_exists(&url, &schema, "c").await);

    assert!(matches!(
        tm.rollback(&RollbackTarget::Versions(vec!["002".into()])).await,
        Err(TidemarkError::NotApplied(_))
    ));

    // Reapplication after rollback is allowed.
    assert_eq!(tm.apply_pending(false).await.unwrap(), vec!["002", "003"]);

    teardown_schema(&url, &schema).await;
}

fn log_hook(tm: Tidemark, schema: &str, id: &str, priority: u8, deps: &[&str]) -> Tidemark {
    let descriptor = HookDescriptor::new(id, HookPhase::BeforeDdl)
        .with_priority(priority)
        .depends_on(deps);
    let sql = format!("INSERT INTO {}.hook_log (hook) VALUES ('{}');", schema, id);
    tm.with_hook(Arc::new(SqlHook::new(descriptor, sql)))
}

#[tokio::test]
async fn test_hooks_run_in_dependency_then_priority_order() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "hooks").await;
    client
        .batch_execute(&format!(
            "CREATE TABLE {}.hook_log (id SERIAL PRIMARY KEY, hook TEXT NOT NULL)",
            schema
        ))
        .await
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    create_table_pair(dir.path(), &schema, "001_a", "a");

    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client).unwrap();
    let tm = log_hook(tm, &schema, "B", 5, &["A"]);
    let tm = log_hook(tm, &schema, "A", 1, &[]);
    let tm = log_hook(tm, &schema, "C", 1, &[]);

    let report = tm.migrate(&MigrateOptions::default()).await.unwrap();
    let hook_ids: Vec<&str> = report.applied[0].hooks.iter().map(|h| h.hook_id.as_str()).collect();
    assert_eq!(hook_ids, vec!["A", "C", "B"]);

    let rows = tm
        .client()
        .query(&format!("SELECT hook FROM {}.hook_log ORDER BY id", schema), &[])
        .await
        .unwrap();
    let logged: Vec<String> = rows.iter().map(|r| r.get(0)).collect();
    assert_eq!(logged, vec!["A", "C", "B"]);

    teardown_schema(&url, &schema).await;
}

#[tokio::test]
async fn test_hook_failure_rolls_back_the_step() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "hook_fail").await;
    let dir = tempfile::tempdir().unwrap();
    create_table_pair(dir.path(), &schema, "001_a", "a");

    let broken = SqlHook::new(
        HookDescriptor::new("verify", HookPhase::AfterValidation),
        "SELECT * FROM no_such_table",
    );
    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client)
        .unwrap()
        .with_hook(Arc::new(broken));

    let err = tm.apply_pending(false).await.unwrap_err();
    match err {
        TidemarkError::MigrationFailed { reason, .. } => assert!(reason.contains("verify")),
        other => panic!("expected MigrationFailed, got {:?}", other),
    }
    assert!(!table_exists(&url, &schema, "a").await);
    assert!(recorded_versions(&url, &schema).await.is_empty());

    teardown_schema(&url, &schema).await;
}

#[tokio::test]
async fn test_hook_cycle_is_reported_before_any_sql() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "hook_cycle").await;
    let dir = tempfile::tempdir().unwrap();
    create_table_pair(dir.path(), &schema, "001_a", "a");

    let x = SqlHook::new(HookDescriptor::new("x", HookPhase::BeforeDdl).depends_on(&["y"]), "SELECT 1");
    let y = SqlHook::new(HookDescriptor::new("y", HookPhase::BeforeDdl).depends_on(&["x"]), "SELECT 1");
    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client)
        .unwrap()
        .with_hook(Arc::new(x))
        .with_hook(Arc::new(y));

    let err = tm.apply_pending(false).await.unwrap_err();
    assert!(matches!(err, TidemarkError::HookCycle { .. }));
    assert_eq!(err.exit_code(), 2);
    assert!(!table_exists(&url, &schema, "a").await);

    teardown_schema(&url, &schema).await;
}

#[tokio::test]
async fn test_non_transactional_migration() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "non_tx").await;
    let dir = tempfile::tempdir().unwrap();
    create_table_pair(dir.path(), &schema, "001_users", "users");
    write_pair(
        dir.path(),
        "002_index",
        &format!(
            "-- Strategy: non-transactional\nCREATE INDEX CONCURRENTLY users_id_idx ON {}.users (id);",
            schema
        ),
        &format!("-- Strategy: non-transactional\nDROP INDEX CONCURRENTLY {}.users_id_idx;", schema),
    );

    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client).unwrap();
    let report = tm.migrate(&MigrateOptions::default()).await.unwrap();
    assert_eq!(report.applied_versions(), vec!["001", "002"]);
    assert!(!report.applied[1].transactional);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("mixes transactional and non-transactional")));

    // Dry runs refuse non-transactional migrations.
    tm.rollback(&RollbackTarget::Steps(1)).await.unwrap();
    assert!(matches!(
        tm.dry_run(None).await,
        Err(TidemarkError::DryRunFailed { .. })
    ));

    teardown_schema(&url, &schema).await;
}

#[tokio::test]
async fn test_checksum_drift_strict_and_lenient() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "checksum").await;
    let dir = tempfile::tempdir().unwrap();
    create_table_pair(dir.path(), &schema, "001_a", "a");

    let mut config = test_config(&url, &schema, dir.path());
    let tm = Tidemark::with_client(config.clone(), client).unwrap();
    tm.apply_pending(false).await.unwrap();

    write_pair(
        dir.path(),
        "001_a",
        &format!("CREATE TABLE {}.a (id SERIAL PRIMARY KEY, extra TEXT);", schema),
        &format!("DROP TABLE {}.a;", schema),
    );

    let report = tm.migrate(&MigrateOptions::default()).await.unwrap();
    assert_eq!(report.warnings.len(), 1);
    assert!(tm.validate().await.unwrap().valid);

    config.migrations.strict_checksums = true;
    let strict = Tidemark::with_client(config, db::connect(&url).await.unwrap()).unwrap();
    let err = strict.apply_pending(false).await.unwrap_err();
    assert!(matches!(err, TidemarkError::ChecksumMismatch { .. }));
    assert_eq!(err.exit_code(), 3);
    assert!(matches!(
        strict.validate().await,
        Err(TidemarkError::ChecksumMismatch { .. })
    ));

    let status = strict.status().await.unwrap();
    assert_eq!(status.migrations[0].state, MigrationState::ChecksumMismatch);

    teardown_schema(&url, &schema).await;
}

#[tokio::test]
async fn test_run_lock_times_out() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "lock").await;
    let dir = tempfile::tempdir().unwrap();
    create_table_pair(dir.path(), &schema, "001_a", "a");

    let holder = db::connect(&url).await.unwrap();
    let lock_id = VersionStore::new(&holder, &schema, TABLE).lock_id();
    holder
        .execute("SELECT pg_advisory_lock($1)", &[&lock_id])
        .await
        .unwrap();

    let mut config = test_config(&url, &schema, dir.path());
    config.migrations.lock_timeout_secs = 1;
    let tm = Tidemark::with_client(config, client).unwrap();
    let err = tm.apply_pending(false).await.unwrap_err();
    assert!(matches!(err, TidemarkError::LockTimeout { .. }));
    assert_eq!(err.code(), "LOCK_TIMEOUT");

    holder
        .execute("SELECT pg_advisory_unlock($1)", &[&lock_id])
        .await
        .unwrap();
    assert_eq!(tm.apply_pending(false).await.unwrap(), vec!["001"]);

    teardown_schema(&url, &schema).await;
}

struct CreateAudit {
    schema: String,
}

#[async_trait]
impl CodeMigration for CreateAudit {
    fn version(&self) -> &str {
        "002"
    }

    fn name(&self) -> &str {
        "create_audit"
    }

    async fn up(&self, client: &Client) -> tidemark_core::error::Result<()> {
        client
            .batch_execute(&format!("CREATE TABLE {}.audit (id SERIAL, at TIMESTAMPTZ)", self.schema))
            .await?;
        Ok(())
    }

    async fn down(&self, client: &Client) -> tidemark_core::error::Result<()> {
        client
            .batch_execute(&format!("DROP TABLE {}.audit", self.schema))
            .await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_code_migrations_interleave_with_sql() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "code").await;
    let dir = tempfile::tempdir().unwrap();
    create_table_pair(dir.path(), &schema, "001_a", "a");
    std::fs::write(dir.path().join("002_create_audit.rs"), "// registered in code").unwrap();
    create_table_pair(dir.path(), &schema, "003_c", "c");

    let mut registry = MigrationRegistry::new();
    registry.register(Arc::new(CreateAudit {
        schema: schema.clone(),
    }));
    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client)
        .unwrap()
        .with_registry(registry);

    assert_eq!(tm.apply_pending(false).await.unwrap(), vec!["001", "002", "003"]);
    assert!(table_exists(&url, &schema, "audit").await);

    tm.rollback(&RollbackTarget::Versions(vec!["002".into()])).await.unwrap();
    assert!(!table_exists(&url, &schema, "audit").await);

    teardown_schema(&url, &schema).await;
}

#[tokio::test]
async fn test_reinit_requires_confirmation() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "reinit").await;
    let dir = tempfile::tempdir().unwrap();
    create_table_pair(dir.path(), &schema, "001_a", "a");
    create_table_pair(dir.path(), &schema, "002_b", "b");

    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client).unwrap();
    tm.apply_pending(false).await.unwrap();

    let err = tm.reinit(None, false, false).await.unwrap_err();
    assert_eq!(err.exit_code(), 2);

    let preview = tm.reinit(Some("001"), false, true).await.unwrap();
    assert!(preview.dry_run);
    assert_eq!(preview.records_removed, 2);
    assert_eq!(preview.marked, vec!["001"]);
    assert_eq!(recorded_versions(&url, &schema).await, vec!["001", "002"]);

    let report = tm.reinit(Some("001"), true, false).await.unwrap();
    assert_eq!(report.records_removed, 2);
    assert_eq!(recorded_versions(&url, &schema).await, vec!["001"]);

    assert!(matches!(
        tm.reinit(Some("042"), true, false).await,
        Err(TidemarkError::VersionNotFound(_))
    ));

    teardown_schema(&url, &schema).await;
}

#[tokio::test]
async fn test_rebuild_from_inline_schema() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "rebuild").await;
    let dir = tempfile::tempdir().unwrap();
    create_table_pair(dir.path(), &schema, "001_a", "a");
    create_table_pair(dir.path(), &schema, "002_b", "b");

    let ddl = format!(
        "CREATE TABLE {s}.a (id SERIAL PRIMARY KEY);\nCREATE TABLE {s}.b (id SERIAL PRIMARY KEY);",
        s = schema
    );
    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client)
        .unwrap()
        .with_schema_source(Box::new(InlineSchema(ddl)));

    let plan = tm
        .rebuild(&RebuildOptions {
            dry_run: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(plan.dry_run);
    assert_eq!(plan.ddl_statements_executed, 2);
    assert_eq!(plan.migrations_marked, vec!["001", "002"]);
    assert!(!table_exists(&url, &schema, "a").await);

    let report = tm
        .rebuild(&RebuildOptions {
            backup_tracking: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(report.success);
    assert_eq!(report.migrations_marked, vec!["001", "002"]);
    assert!(table_exists(&url, &schema, "b").await);
    assert!(tm.apply_pending(false).await.unwrap().is_empty());

    teardown_schema(&url, &schema).await;
}

#[tokio::test]
async fn test_rebuild_failure_is_reported() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "rebuild_fail").await;
    let dir = tempfile::tempdir().unwrap();
    create_table_pair(dir.path(), &schema, "001_a", "a");

    let tm = Tidemark::with_client(test_config(&url, &schema, dir.path()), client)
        .unwrap()
        .with_schema_source(Box::new(InlineSchema("CREATE TABLE broken (".to_string())));

    let err = tm.rebuild(&RebuildOptions::default()).await.unwrap_err();
    match &err {
        TidemarkError::RebuildFailed(msg) => assert!(msg.starts_with("Schema build failed")),
        other => panic!("expected RebuildFailed, got {:?}", other),
    }
    assert_eq!(err.exit_code(), 4);
    assert!(recorded_versions(&url, &schema).await.is_empty());

    teardown_schema(&url, &schema).await;
}

#[tokio::test]
async fn test_auto_detect_baseline_from_snapshot() {
    let url = require_db!();
    let (client, schema) = setup_schema(&url, "detect").await;
    client
        .batch_execute(&format!("CREATE TABLE {}.widgets (id INTEGER PRIMARY KEY)", schema))
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    create_table_pair(dir.path(), &schema, "001_widgets", "widgets");
    create_table_pair(dir.path(), &schema, "002_gadgets", "gadgets");

    let history = tempfile::tempdir().unwrap();
    std::fs::write(
        history.path().join("001_widgets.sql"),
        format!(
            "-- after 001\nCREATE TABLE {}.widgets (\n    id INTEGER NOT NULL,\n    PRIMARY KEY (id)\n);\n",
            schema
        ),
    )
    .unwrap();

    let mut config = test_config(&url, &schema, dir.path());
    config.migrations.snapshots_dir = history.path().to_path_buf();
    let tm = Tidemark::with_client(config, client).unwrap();

    let detected = tm.detect_baseline().await.unwrap();
    assert!(detected.matched.as_ref().is_some_and(|m| m.exact));

    let report = tm
        .migrate(&MigrateOptions {
            auto_detect_baseline: true,
            ..Default::default()
        })
        .await
        .unwrap();
    let baseline = report.baseline.as_ref().expect("expected a detected baseline");
    assert_eq!(baseline.snapshot_version, "001");
    assert_eq!(baseline.marked, vec!["001"]);
    assert_eq!(report.applied_versions(), vec!["002"]);

    teardown_schema(&url, &schema).await;
}
