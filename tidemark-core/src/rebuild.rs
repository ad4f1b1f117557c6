//! Drop managed schemas, rebuild them from cumulative DDL and baseline history.

use std::path::PathBuf;
use std::time::Instant;

use serde::Serialize;
use tokio_postgres::Client;

use crate::baseline::mark_through;
use crate::builder::{split_statements, sql_files, SchemaSource};
use crate::config::TidemarkConfig;
use crate::db::{self, quote_ident};
use crate::discovery::DiscoveryReport;
use crate::error::{reason_of, Result, TidemarkError};
use crate::history::{TrackingRecord, VersionStore};

const EXTENSION_SAVEPOINT: &str = "tidemark_extension";

#[derive(Debug, Clone, Default)]
pub struct RebuildOptions {
    pub drop_schemas: bool,
    pub dry_run: bool,
    pub apply_seeds: bool,
    pub backup_tracking: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub success: bool,
    pub dry_run: bool,
    /// Dropped, or that would be dropped on a dry run.
    pub schemas_dropped: Vec<String>,
    pub ddl_statements_executed: usize,
    pub seeds_applied: Vec<String>,
    pub migrations_marked: Vec<String>,
    pub tracking_rows_backed_up: usize,
    pub total_execution_time_ms: i64,
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub tracking_backup: Vec<TrackingRecord>,
}

pub struct RebuildCoordinator<'a> {
    client: &'a Client,
    config: &'a TidemarkConfig,
    source: &'a dyn SchemaSource,
}

impl<'a> RebuildCoordinator<'a> {
    pub fn new(client: &'a Client, config: &'a TidemarkConfig, source: &'a dyn SchemaSource) -> Self {
        Self {
            client,
            config,
            source,
        }
    }

    fn store(&self) -> VersionStore<'a> {
        VersionStore::new(
            self.client,
            &self.config.migrations.schema,
            &self.config.migrations.table,
        )
    }

    /// Rebuild and mark every discovered migration as applied.
    ///
    /// The caller holds the run lock. A dry run reads but never writes.
    pub async fn rebuild(
        &self,
        discovery: &DiscoveryReport,
        options: &RebuildOptions,
    ) -> Result<RebuildReport> {
        let start = Instant::now();
        let store = self.store();

        tracing::info!(source = %self.source.describe(), dry_run = options.dry_run, "Building schema");
        let ddl = self
            .source
            .build()
            .map_err(|e| TidemarkError::RebuildFailed(format!("Schema build failed: {}", reason_of(&e))))?;
        let statements = split_statements(&ddl);

        let schemas = if options.drop_schemas {
            user_schemas(self.client).await?
        } else {
            Vec::new()
        };
        let seeds: Vec<PathBuf> = if options.apply_seeds {
            sql_files(&self.config.schema.seeds_dir)?
        } else {
            Vec::new()
        };
        let tracking_backup = if options.backup_tracking {
            store.applied_records().await?
        } else {
            Vec::new()
        };

        let mut report = RebuildReport {
            success: false,
            dry_run: options.dry_run,
            schemas_dropped: schemas.clone(),
            ddl_statements_executed: statements.len(),
            seeds_applied: seeds.iter().map(|p| p.display().to_string()).collect(),
            migrations_marked: Vec::new(),
            tracking_rows_backed_up: tracking_backup.len(),
            total_execution_time_ms: 0,
            warnings: Vec::new(),
            tracking_backup,
        };

        if options.dry_run {
            report.migrations_marked = discovery
                .definitions
                .iter()
                .map(|d| d.version.to_string())
                .collect();
            report.success = true;
            report.total_execution_time_ms = start.elapsed().as_millis() as i64;
            return Ok(report);
        }

        db::begin(self.client).await?;
        match self.apply(discovery, &schemas, &statements, &seeds, &mut report).await {
            Ok(()) => db::commit(self.client).await?,
            Err(e) => {
                db::rollback_quietly(self.client).await;
                tracing::error!(error = %reason_of(&e), "Rebuild failed; all changes rolled back");
                return Err(e);
            }
        }

        report.success = true;
        report.total_execution_time_ms = start.elapsed().as_millis() as i64;
        tracing::info!(
            schemas_dropped = report.schemas_dropped.len(),
            statements = report.ddl_statements_executed,
            seeds = report.seeds_applied.len(),
            marked = report.migrations_marked.len(),
            "Rebuild complete"
        );
        Ok(report)
    }

    async fn apply(
        &self,
        discovery: &DiscoveryReport,
        schemas: &[String],
        statements: &[String],
        seeds: &[PathBuf],
        report: &mut RebuildReport,
    ) -> Result<()> {
        for schema in schemas {
            tracing::info!(schema = %schema, "Dropping schema");
            self.client
                .batch_execute(&format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(schema)))
                .await?;
        }
        self.client
            .batch_execute("CREATE SCHEMA IF NOT EXISTS public")
            .await?;

        for (i, statement) in statements.iter().enumerate() {
            if is_create_extension(statement) {
                if let Some(warning) = self.try_extension(statement).await? {
                    report.warnings.push(warning);
                }
                continue;
            }
            self.client.batch_execute(statement).await.map_err(|e| {
                TidemarkError::RebuildFailed(format!(
                    "Schema build failed: statement {} of {}: {}",
                    i + 1,
                    statements.len(),
                    crate::error::format_db_error(&e)
                ))
            })?;
        }

        for seed in seeds {
            tracing::info!(file = %seed.display(), "Applying seed file");
            let sql = std::fs::read_to_string(seed)?;
            self.client.batch_execute(&sql).await.map_err(|e| {
                TidemarkError::RebuildFailed(format!(
                    "Seed file '{}' failed: {}",
                    seed.display(),
                    crate::error::format_db_error(&e)
                ))
            })?;
        }

        let store = self.store();
        store.initialize().await?;
        let cleared = store.clear().await?;
        if cleared > 0 {
            tracing::info!(rows = cleared, "Cleared previous tracking records");
        }
        report.migrations_marked = mark_through(&store, &discovery.definitions, None).await?;
        Ok(())
    }

    /// Run a `CREATE EXTENSION` inside a savepoint; failure becomes a warning.
    async fn try_extension(&self, statement: &str) -> Result<Option<String>> {
        db::savepoint(self.client, EXTENSION_SAVEPOINT).await?;
        match self.client.batch_execute(statement).await {
            Ok(()) => {
                db::release_savepoint(self.client, EXTENSION_SAVEPOINT).await?;
                Ok(None)
            }
            Err(e) => {
                db::rollback_to_savepoint(self.client, EXTENSION_SAVEPOINT).await?;
                let warning = format!(
                    "Skipped extension ({}): {}",
                    statement.lines().next().unwrap_or(statement).trim(),
                    crate::error::format_db_error(&e)
                );
                tracing::warn!(warning = %warning, "Extension could not be created");
                Ok(Some(warning))
            }
        }
    }
}

fn is_create_extension(statement: &str) -> bool {
    let body: String = statement
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("--"))
        .collect::<Vec<_>>()
        .join(" ");
    body.to_lowercase().starts_with("create extension")
}

/// Every schema except the system ones.
pub async fn user_schemas(client: &Client) -> Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT nspname FROM pg_catalog.pg_namespace \
             WHERE nspname NOT IN ('pg_catalog', 'information_schema', 'pg_toast') \
               AND nspname NOT LIKE 'pg\\_temp\\_%' \
               AND nspname NOT LIKE 'pg\\_toast\\_temp\\_%' \
             ORDER BY nspname",
            &[],
        )
        .await?;
    Ok(rows.iter().map(|r| r.get(0)).collect())
}
