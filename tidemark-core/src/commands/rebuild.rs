use tokio_postgres::Client;

use crate::builder::SchemaSource;
use crate::config::TidemarkConfig;
use crate::error::Result;
use crate::migration::MigrationRegistry;
use crate::rebuild::{RebuildCoordinator, RebuildOptions, RebuildReport};

/// Execute the rebuild command. A dry run skips the run lock.
pub async fn execute(
    client: &Client,
    config: &TidemarkConfig,
    registry: &MigrationRegistry,
    source: &dyn SchemaSource,
    options: &RebuildOptions,
) -> Result<RebuildReport> {
    let discovery = super::discover(config, registry)?;
    discovery.ensure_runnable()?;

    let coordinator = RebuildCoordinator::new(client, config, source);
    if options.dry_run {
        return coordinator.rebuild(&discovery, options).await;
    }

    let store = super::version_store(client, config);
    super::with_run_lock(&store, config, coordinator.rebuild(&discovery, options)).await
}
