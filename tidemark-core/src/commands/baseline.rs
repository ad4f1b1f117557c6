//! Mark migrations as applied without running them: `baseline` and `reinit`.

use serde::Serialize;
use tokio_postgres::Client;

use crate::baseline::mark_through;
use crate::config::TidemarkConfig;
use crate::discovery::DiscoveryReport;
use crate::error::{Result, TidemarkError};
use crate::migration::{MigrationRegistry, MigrationVersion};

#[derive(Debug, Serialize)]
pub struct BaselineReport {
    pub through: String,
    /// Newly marked versions. Versions already recorded are left alone.
    pub marked: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ReinitReport {
    pub dry_run: bool,
    pub through: Option<String>,
    /// Tracking records deleted (or that would be).
    pub records_removed: usize,
    /// Versions marked (or that would be).
    pub marked: Vec<String>,
}

fn resolve_through(discovery: &DiscoveryReport, through: &str) -> Result<MigrationVersion> {
    discovery
        .find(through)
        .map(|d| d.version.clone())
        .ok_or_else(|| TidemarkError::VersionNotFound(through.to_string()))
}

/// Execute the baseline command: mark every version up to `through` as applied.
pub async fn execute(
    client: &Client,
    config: &TidemarkConfig,
    registry: &MigrationRegistry,
    through: &str,
) -> Result<BaselineReport> {
    let discovery = super::discover(config, registry)?;
    discovery.ensure_runnable()?;
    let through_version = resolve_through(&discovery, through)?;

    let store = super::version_store(client, config);
    let marked = super::with_run_lock(&store, config, async {
        store.initialize().await?;
        super::in_transaction(&store, mark_through(&store, &discovery.definitions, Some(&through_version))).await
    })
    .await?;

    tracing::info!(through = %through, marked = marked.len(), "Baseline completed");
    Ok(BaselineReport {
        through: through.to_string(),
        marked,
    })
}

/// Execute the reinit command: clear the tracking table and re-mark from disk.
///
/// Needs `confirmed` unless it is a dry run.
pub async fn reinit(
    client: &Client,
    config: &TidemarkConfig,
    registry: &MigrationRegistry,
    through: Option<&str>,
    confirmed: bool,
    dry_run: bool,
) -> Result<ReinitReport> {
    let discovery = super::discover(config, registry)?;
    discovery.ensure_runnable()?;
    let through_version = through.map(|t| resolve_through(&discovery, t)).transpose()?;

    let store = super::version_store(client, config);

    if dry_run {
        let records_removed = store.applied_records().await?.len();
        let marked = discovery
            .definitions
            .iter()
            .filter(|d| through_version.as_ref().map_or(true, |t| d.version <= *t))
            .map(|d| d.version.to_string())
            .collect();
        return Ok(ReinitReport {
            dry_run: true,
            through: through.map(str::to_string),
            records_removed,
            marked,
        });
    }

    if !confirmed {
        return Err(TidemarkError::ConfigError(
            "reinit deletes every tracking record; pass --yes to confirm".to_string(),
        ));
    }

    let (records_removed, marked) = super::with_run_lock(&store, config, async {
        store.initialize().await?;
        super::in_transaction(&store, async {
            let removed = store.clear().await?;
            let marked = mark_through(&store, &discovery.definitions, through_version.as_ref()).await?;
            Ok((removed as usize, marked))
        })
        .await
    })
    .await?;

    tracing::info!(removed = records_removed, marked = marked.len(), "Reinit completed");
    Ok(ReinitReport {
        dry_run: false,
        through: through.map(str::to_string),
        records_removed,
        marked,
    })
}
