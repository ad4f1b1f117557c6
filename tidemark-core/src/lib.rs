pub mod baseline;
pub mod builder;
pub mod checksum;
pub mod commands;
pub mod config;
pub mod context;
pub mod db;
pub mod discovery;
pub mod dry_run;
pub mod engine;
pub mod error;
pub mod history;
pub mod hooks;
pub mod migration;
pub mod rebuild;

use std::sync::Arc;

use config::TidemarkConfig;
use error::Result;
use tokio_postgres::Client;

pub use baseline::{BaselineDetector, MatchOutcome, SnapshotMatch};
pub use builder::{DirectorySchemaBuilder, InlineSchema, SchemaSource};
pub use commands::baseline::{BaselineReport, ReinitReport};
pub use commands::down::{RollbackReport, RollbackTarget};
pub use commands::migrate::{MigrateOptions, MigrateReport};
pub use commands::status::{MigrationState, MigrationStatus, StatusReport};
pub use commands::validate::ValidateReport;
pub use config::CliOverrides;
pub use context::{Operation, RunContext};
pub use discovery::DuplicateVersionReport;
pub use dry_run::{DryRunRecord, DryRunReport};
pub use error::TidemarkError;
pub use hooks::{Hook, HookContext, HookDescriptor, HookOutcome, HookPhase};
pub use migration::{CodeMigration, MigrationRegistry};
pub use rebuild::{RebuildOptions, RebuildReport};

/// Main entry point for the Tidemark library.
///
/// Create a `Tidemark` instance with a config and use its methods to
/// run migration commands programmatically. Each call creates its own
/// [`RunContext`].
pub struct Tidemark {
    pub config: TidemarkConfig,
    client: Client,
    registry: MigrationRegistry,
    hooks: hooks::HookOrchestrator,
    schema_source: Option<Box<dyn SchemaSource>>,
}

impl Tidemark {
    /// Create a new Tidemark instance, connecting to the database.
    ///
    /// If `connect_retries` is configured, retries with exponential backoff.
    pub async fn new(config: TidemarkConfig) -> Result<Self> {
        let conn_string = config.connection_string()?;
        let client = db::connect_with_config(
            &conn_string,
            &config.database.ssl_mode,
            config.database.connect_retries,
            config.database.connect_timeout_secs,
            config.database.statement_timeout_secs,
        )
        .await?;
        Self::with_client(config, client)
    }

    /// Create a new Tidemark instance with an existing database client.
    ///
    /// Fails if a configured hook file cannot be loaded.
    pub fn with_client(config: TidemarkConfig, client: Client) -> Result<Self> {
        let hooks = hooks::HookOrchestrator::from_config(&config.hooks)?;
        Ok(Self {
            config,
            client,
            registry: MigrationRegistry::new(),
            hooks,
            schema_source: None,
        })
    }

    /// Use these code migrations alongside the SQL files on disk.
    pub fn with_registry(mut self, registry: MigrationRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register a hook that applies to every migration step.
    pub fn with_hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.register(hook);
        self
    }

    /// Replace the schema source used by rebuild. Defaults to `schema.source_dir`.
    pub fn with_schema_source(mut self, source: Box<dyn SchemaSource>) -> Self {
        self.schema_source = Some(source);
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Apply pending migrations.
    pub async fn migrate(&self, options: &MigrateOptions) -> Result<MigrateReport> {
        let run = RunContext::new(Operation::MigrateUp).with_force(options.force);
        commands::migrate::execute(&self.client, &self.config, &self.registry, &self.hooks, run, options)
            .await
    }

    /// Apply pending migrations and return the versions newly applied.
    pub async fn apply_pending(&self, force: bool) -> Result<Vec<String>> {
        let options = MigrateOptions {
            force,
            ..Default::default()
        };
        Ok(self.migrate(&options).await?.applied_versions())
    }

    /// Roll back applied migrations.
    pub async fn rollback(&self, target: &RollbackTarget) -> Result<RollbackReport> {
        let run = RunContext::new(Operation::MigrateDown);
        commands::down::execute(&self.client, &self.config, &self.registry, &self.hooks, run, target)
            .await
    }

    /// Simulate pending migrations (up to `target`) and roll everything back.
    pub async fn dry_run(&self, target: Option<&str>) -> Result<DryRunReport> {
        let run = RunContext::new(Operation::DryRun);
        commands::dry_run::execute(&self.client, &self.config, &self.registry, &self.hooks, run, target)
            .await
    }

    /// Show migration status information.
    pub async fn status(&self) -> Result<StatusReport> {
        commands::status::execute(&self.client, &self.config, &self.registry).await
    }

    /// Validate applied migrations against the definitions on disk.
    pub async fn validate(&self) -> Result<ValidateReport> {
        commands::validate::execute(&self.client, &self.config, &self.registry).await
    }

    /// Mark every version up to `through` as applied without running it.
    pub async fn baseline(&self, through: &str) -> Result<BaselineReport> {
        commands::baseline::execute(&self.client, &self.config, &self.registry, through).await
    }

    /// Clear the tracking table and mark versions as applied from disk.
    pub async fn reinit(
        &self,
        through: Option<&str>,
        confirmed: bool,
        dry_run: bool,
    ) -> Result<ReinitReport> {
        commands::baseline::reinit(
            &self.client,
            &self.config,
            &self.registry,
            through,
            confirmed,
            dry_run,
        )
        .await
    }

    /// Rebuild the schema from its source and baseline every migration.
    pub async fn rebuild(&self, options: &RebuildOptions) -> Result<RebuildReport> {
        let default_source;
        let source: &dyn SchemaSource = match &self.schema_source {
            Some(source) => source.as_ref(),
            None => {
                default_source = DirectorySchemaBuilder::new(&self.config.schema.source_dir);
                &default_source
            }
        };
        commands::rebuild::execute(&self.client, &self.config, &self.registry, source, options).await
    }

    /// Versions claimed by more than one migration on disk.
    pub fn find_duplicate_versions(&self) -> Result<DuplicateVersionReport> {
        Ok(commands::discover(&self.config, &self.registry)?.duplicates)
    }

    /// Compare the live schema with the snapshot history without writing anything.
    pub async fn detect_baseline(&self) -> Result<MatchOutcome> {
        let live = baseline::introspect_live_schema(
            &self.client,
            &self.config.schema.managed_schemas,
            (&self.config.migrations.schema, &self.config.migrations.table),
        )
        .await?;
        BaselineDetector::new(
            &self.config.migrations.snapshots_dir,
            self.config.migrations.similarity_threshold,
        )
        .find_matching_snapshot(&live)
    }
}
