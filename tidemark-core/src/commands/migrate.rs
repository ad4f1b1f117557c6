use std::collections::{HashMap, HashSet};
use std::time::Instant;

use serde::Serialize;
use tokio_postgres::Client;

use crate::baseline::{introspect_live_schema, mark_through, BaselineDetector};
use crate::config::TidemarkConfig;
use crate::context::RunContext;
use crate::discovery::DiscoveryReport;
use crate::engine::{ExecutionEngine, InterruptSignal, StepReport};
use crate::error::{reason_of, Result, TidemarkError};
use crate::history::{TrackingRecord, VersionStore};
use crate::hooks::HookOrchestrator;
use crate::migration::{MigrationDefinition, MigrationRegistry, MigrationVersion};

#[derive(Debug, Clone, Default)]
pub struct MigrateOptions {
    /// Apply every discovered migration, even ones already recorded.
    pub force: bool,
    /// Stop after this version.
    pub target: Option<String>,
    /// Keep going after a failed migration. Also enabled by config.
    pub continue_on_error: bool,
    /// Baseline from a matching schema snapshot when there is no history.
    pub auto_detect_baseline: bool,
}

/// Report returned after a migrate operation.
#[derive(Debug, Serialize)]
pub struct MigrateReport {
    pub run_id: String,
    pub applied: Vec<StepReport>,
    pub failures: Vec<FailedMigration>,
    pub baseline: Option<AutoBaseline>,
    pub warnings: Vec<String>,
    pub total_time_ms: i64,
}

impl MigrateReport {
    /// Versions newly applied in this invocation, in order.
    pub fn applied_versions(&self) -> Vec<String> {
        self.applied.iter().map(|s| s.version.clone()).collect()
    }
}

/// A migration skipped over because `continue_on_error` was set.
#[derive(Debug, Serialize)]
pub struct FailedMigration {
    pub version: String,
    pub name: String,
    pub code: &'static str,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct AutoBaseline {
    pub snapshot_version: String,
    pub similarity: f64,
    pub exact: bool,
    pub marked: Vec<String>,
}

/// Execute the migrate command.
pub async fn execute(
    client: &Client,
    config: &TidemarkConfig,
    registry: &MigrationRegistry,
    hooks: &HookOrchestrator,
    run: RunContext,
    options: &MigrateOptions,
) -> Result<MigrateReport> {
    // Discovery problems block before the database is touched.
    let discovery = super::discover(config, registry)?;
    discovery.ensure_runnable()?;
    let target = match &options.target {
        Some(t) => Some(
            discovery
                .find(t)
                .map(|d| d.version.clone())
                .ok_or_else(|| TidemarkError::VersionNotFound(t.clone()))?,
        ),
        None => None,
    };

    let store = super::version_store(client, config);
    let result = super::with_run_lock(
        &store,
        config,
        run_migrate(&store, config, hooks, run, options, &discovery, target.as_ref()),
    )
    .await;

    match &result {
        Ok(report) => {
            tracing::info!(
                migrations_applied = report.applied.len(),
                failures = report.failures.len(),
                total_time_ms = report.total_time_ms,
                "Migrate completed"
            );
        }
        Err(e) => {
            tracing::error!(error = %reason_of(e), "Migrate failed");
        }
    }

    result
}

async fn run_migrate(
    store: &VersionStore<'_>,
    config: &TidemarkConfig,
    hooks: &HookOrchestrator,
    run: RunContext,
    options: &MigrateOptions,
    discovery: &DiscoveryReport,
    target: Option<&MigrationVersion>,
) -> Result<MigrateReport> {
    let interrupt = InterruptSignal::listen();
    let start = Instant::now();
    let run = run.with_force(options.force);
    let continue_on_error = options.continue_on_error || config.migrations.continue_on_error;

    let mut report = MigrateReport {
        run_id: run.run_id.clone(),
        applied: Vec::new(),
        failures: Vec::new(),
        baseline: None,
        warnings: Vec::new(),
        total_time_ms: 0,
    };

    if options.auto_detect_baseline && store.applied_records().await?.is_empty() {
        report.baseline = auto_baseline(store, config, discovery).await?;
    }

    store.initialize().await?;
    let records = store.applied_records().await?;

    if options.force {
        tracing::warn!("Force mode: applying every migration regardless of recorded state");
    } else {
        report.warnings.extend(verify_checksums(
            &records,
            discovery,
            config.migrations.strict_checksums,
        )?);
    }

    let applied: HashSet<&str> = records.iter().map(|r| r.version.as_str()).collect();
    let targets: Vec<&MigrationDefinition> = discovery
        .definitions
        .iter()
        .filter(|d| options.force || !applied.contains(d.version.as_str()))
        .filter(|d| target.map_or(true, |t| d.version <= *t))
        .collect();

    if targets.is_empty() {
        tracing::info!("Schema is up to date");
    }
    if let Some(warning) = mixed_transaction_warning(&targets) {
        tracing::warn!("{}", warning);
        report.warnings.push(warning);
    }

    let engine = ExecutionEngine::new(
        VersionStore::new(store.client(), &config.migrations.schema, &config.migrations.table),
        hooks,
        run,
        &interrupt,
    );
    let mut applied_so_far: Vec<String> = Vec::new();

    for definition in targets {
        match engine.apply(definition, &applied_so_far).await {
            Ok(step) => {
                applied_so_far.push(step.version.clone());
                report.applied.push(step);
            }
            Err(e @ TidemarkError::Interrupted { .. }) => return Err(e),
            Err(e) if continue_on_error => {
                tracing::warn!(
                    version = %definition.version,
                    error = %reason_of(&e),
                    "Migration failed; continuing with the next one"
                );
                report.failures.push(FailedMigration {
                    version: definition.version.to_string(),
                    name: definition.name.clone(),
                    code: e.code(),
                    reason: reason_of(&e),
                });
            }
            Err(e) => return Err(e),
        }
    }

    report.total_time_ms = start.elapsed().as_millis() as i64;
    Ok(report)
}

/// A batch that mixes transactional and non-transactional migrations cannot be
/// undone as a whole if a later transactional step fails.
fn mixed_transaction_warning(targets: &[&MigrationDefinition]) -> Option<String> {
    let (transactional, direct): (Vec<_>, Vec<_>) = targets.iter().partition(|d| d.transactional);
    if transactional.is_empty() || direct.is_empty() {
        return None;
    }
    let labels = |defs: &[&&MigrationDefinition], limit: usize| {
        let mut shown: Vec<String> = defs.iter().take(limit).map(|d| d.label()).collect();
        if defs.len() > limit {
            shown.push("...".to_string());
        }
        shown.join(", ")
    };
    Some(format!(
        "Batch mixes transactional and non-transactional migrations; if a transactional \
         migration fails after a non-transactional one succeeds, the non-transactional \
         changes need manual cleanup (non-transactional: {}; transactional: {})",
        labels(&direct, usize::MAX),
        labels(&transactional, 3)
    ))
}

/// Compare stored checksums with the definitions on disk.
///
/// Strict mode fails on the first drift; otherwise each drift becomes a warning.
pub(crate) fn verify_checksums(
    records: &[TrackingRecord],
    discovery: &DiscoveryReport,
    strict: bool,
) -> Result<Vec<String>> {
    let by_version: HashMap<&str, &MigrationDefinition> = discovery
        .definitions
        .iter()
        .map(|d| (d.version.as_str(), d))
        .collect();

    let mut warnings = Vec::new();
    for record in records {
        let Some(definition) = by_version.get(record.version.as_str()) else {
            continue;
        };
        if definition.checksum == record.checksum {
            continue;
        }
        if strict {
            return Err(TidemarkError::ChecksumMismatch {
                version: record.version.clone(),
                expected: record.checksum.clone(),
                found: definition.checksum.clone(),
            });
        }
        tracing::warn!(
            version = %record.version,
            expected = %record.checksum,
            found = %definition.checksum,
            "Migration changed after it was applied"
        );
        warnings.push(format!(
            "Checksum mismatch for version {}: recorded {}, on disk {}",
            record.version, record.checksum, definition.checksum
        ));
    }
    Ok(warnings)
}

async fn auto_baseline(
    store: &VersionStore<'_>,
    config: &TidemarkConfig,
    discovery: &DiscoveryReport,
) -> Result<Option<AutoBaseline>> {
    let live = introspect_live_schema(
        store.client(),
        &config.schema.managed_schemas,
        (&config.migrations.schema, &config.migrations.table),
    )
    .await?;
    if live.trim().is_empty() {
        tracing::info!("Live schema has no tables; skipping baseline detection");
        return Ok(None);
    }

    let detector = BaselineDetector::new(
        &config.migrations.snapshots_dir,
        config.migrations.similarity_threshold,
    );
    let outcome = detector.find_matching_snapshot(&live)?;
    let Some(matched) = outcome.matched else {
        let closest = outcome
            .closest
            .map(|c| format!("; closest is {} at {:.1}% similarity", c.version, c.similarity * 100.0))
            .unwrap_or_default();
        return Err(TidemarkError::SchemaError(format!(
            "Live schema matches none of the {} snapshots in '{}' (threshold {:.0}%){}",
            outcome.snapshots_compared,
            detector.snapshots_dir().display(),
            config.migrations.similarity_threshold * 100.0,
            closest
        )));
    };

    let through = discovery
        .find(&matched.version)
        .map(|d| d.version.clone())
        .ok_or_else(|| TidemarkError::VersionNotFound(matched.version.clone()))?;

    tracing::info!(
        version = %matched.version,
        similarity = matched.similarity,
        exact = matched.exact,
        "Detected baseline from schema snapshot"
    );

    store.initialize().await?;
    let marked = super::in_transaction(
        store,
        mark_through(store, &discovery.definitions, Some(&through)),
    )
    .await?;

    Ok(Some(AutoBaseline {
        snapshot_version: matched.version,
        similarity: matched.similarity,
        exact: matched.exact,
        marked,
    }))
}
