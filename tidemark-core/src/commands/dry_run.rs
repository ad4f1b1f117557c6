//! `migrate up --dry-run`: simulate every pending migration and roll back.

use std::collections::HashSet;

use tokio_postgres::Client;

use crate::config::TidemarkConfig;
use crate::context::RunContext;
use crate::dry_run::{DryRunReport, DryRunSimulator};
use crate::error::{Result, TidemarkError};
use crate::hooks::HookOrchestrator;
use crate::migration::{MigrationDefinition, MigrationRegistry};

/// Execute the dry-run command. Nothing is written, so no run lock is taken.
pub async fn execute(
    client: &Client,
    config: &TidemarkConfig,
    registry: &MigrationRegistry,
    hooks: &HookOrchestrator,
    run: RunContext,
    target: Option<&str>,
) -> Result<DryRunReport> {
    let discovery = super::discover(config, registry)?;
    discovery.ensure_runnable()?;
    let target = target
        .map(|t| {
            discovery
                .find(t)
                .map(|d| d.version.clone())
                .ok_or_else(|| TidemarkError::VersionNotFound(t.to_string()))
        })
        .transpose()?;

    let store = super::version_store(client, config);
    let applied: HashSet<String> = store.applied_versions().await?.into_iter().collect();
    let pending: Vec<MigrationDefinition> = discovery
        .definitions
        .iter()
        .filter(|d| !applied.contains(d.version.as_str()))
        .filter(|d| target.as_ref().map_or(true, |t| d.version <= *t))
        .cloned()
        .collect();

    tracing::info!(pending = pending.len(), "Simulating pending migrations");
    DryRunSimulator::new(client, hooks, run)
        .run_batch(&pending)
        .await
}
