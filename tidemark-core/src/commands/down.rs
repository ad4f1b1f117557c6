//! Roll back applied migrations with their backward change.

use std::time::Instant;

use serde::Serialize;
use tokio_postgres::Client;

use crate::config::TidemarkConfig;
use crate::context::RunContext;
use crate::discovery::DiscoveryReport;
use crate::engine::{ExecutionEngine, InterruptSignal, StepReport};
use crate::error::{reason_of, Result, TidemarkError};
use crate::history::{TrackingRecord, VersionStore};
use crate::hooks::HookOrchestrator;
use crate::migration::{MigrationDefinition, MigrationRegistry, MigrationVersion};

/// Which versions to roll back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackTarget {
    /// The N most recently applied versions.
    Steps(usize),
    /// Exactly these versions, which must all be applied.
    Versions(Vec<String>),
}

impl Default for RollbackTarget {
    fn default() -> Self {
        RollbackTarget::Steps(1)
    }
}

#[derive(Debug, Serialize)]
pub struct RollbackReport {
    pub run_id: String,
    /// In the order they were rolled back (newest first).
    pub rolled_back: Vec<StepReport>,
    pub total_time_ms: i64,
}

impl RollbackReport {
    pub fn rolled_back_versions(&self) -> Vec<String> {
        self.rolled_back.iter().map(|s| s.version.clone()).collect()
    }
}

/// Execute the down command.
pub async fn execute(
    client: &Client,
    config: &TidemarkConfig,
    registry: &MigrationRegistry,
    hooks: &HookOrchestrator,
    run: RunContext,
    target: &RollbackTarget,
) -> Result<RollbackReport> {
    let discovery = super::discover(config, registry)?;
    discovery.ensure_runnable()?;

    let store = super::version_store(client, config);
    let result = super::with_run_lock(&store, config, run_down(&store, config, hooks, run, target, &discovery)).await;

    match &result {
        Ok(report) => tracing::info!(rolled_back = report.rolled_back.len(), "Rollback completed"),
        Err(e) => tracing::error!(error = %reason_of(e), "Rollback failed"),
    }
    result
}

async fn run_down(
    store: &VersionStore<'_>,
    config: &TidemarkConfig,
    hooks: &HookOrchestrator,
    run: RunContext,
    target: &RollbackTarget,
    discovery: &DiscoveryReport,
) -> Result<RollbackReport> {
    let interrupt = InterruptSignal::listen();
    let start = Instant::now();
    let records = store.applied_records().await?;
    let definitions = select_targets(&records, discovery, target)?;

    let engine = ExecutionEngine::new(
        VersionStore::new(store.client(), &config.migrations.schema, &config.migrations.table),
        hooks,
        run,
        &interrupt,
    );
    let mut report = RollbackReport {
        run_id: engine.run_context().run_id.clone(),
        rolled_back: Vec::new(),
        total_time_ms: 0,
    };

    for definition in definitions {
        let step = engine.rollback(definition).await.inspect_err(|_| {
            if !report.rolled_back.is_empty() {
                tracing::warn!(
                    rolled_back = ?report.rolled_back_versions(),
                    "Stopped after a failed rollback; earlier rollbacks stay committed"
                );
            }
        })?;
        report.rolled_back.push(step);
    }

    report.total_time_ms = start.elapsed().as_millis() as i64;
    Ok(report)
}

/// Resolve the target to definitions in rollback order, newest first.
///
/// Every target must be applied and present on disk before anything runs.
fn select_targets<'d>(
    records: &[TrackingRecord],
    discovery: &'d DiscoveryReport,
    target: &RollbackTarget,
) -> Result<Vec<&'d MigrationDefinition>> {
    let mut versions: Vec<MigrationVersion> = match target {
        RollbackTarget::Steps(n) => records
            .iter()
            .rev()
            .take(*n)
            .map(|r| MigrationVersion::new(r.version.as_str()))
            .collect(),
        RollbackTarget::Versions(requested) => {
            let mut versions = Vec::with_capacity(requested.len());
            for v in requested {
                if !records.iter().any(|r| &r.version == v) {
                    return Err(TidemarkError::NotApplied(v.clone()));
                }
                versions.push(MigrationVersion::new(v.as_str()));
            }
            versions
        }
    };
    versions.sort_by(|a, b| b.cmp(a));
    versions.dedup();

    versions
        .iter()
        .map(|v| {
            discovery
                .find(v.as_str())
                .ok_or_else(|| TidemarkError::VersionNotFound(v.to_string()))
        })
        .collect()
}
