//! Command implementations: migrate, down, dry-run, status, validate, baseline, reinit, rebuild.

pub mod baseline;
pub mod down;
pub mod dry_run;
pub mod migrate;
pub mod rebuild;
pub mod status;
pub mod validate;

use std::future::Future;
use std::time::Duration;

use tokio_postgres::Client;

use crate::config::TidemarkConfig;
use crate::db;
use crate::discovery::{self, DiscoveryReport};
use crate::error::{reason_of, Result};
use crate::history::VersionStore;
use crate::migration::MigrationRegistry;

pub(crate) fn discover(config: &TidemarkConfig, registry: &MigrationRegistry) -> Result<DiscoveryReport> {
    discovery::discover(
        &config.migrations.directory,
        registry,
        &config.migrations.code_extensions,
    )
}

pub(crate) fn version_store<'a>(client: &'a Client, config: &TidemarkConfig) -> VersionStore<'a> {
    VersionStore::new(client, &config.migrations.schema, &config.migrations.table)
}

/// Run `work` while holding the run lock. The lock is released whatever the outcome.
pub(crate) async fn with_run_lock<T>(
    store: &VersionStore<'_>,
    config: &TidemarkConfig,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    store
        .acquire_run_lock(Duration::from_secs(config.migrations.lock_timeout_secs))
        .await?;

    let result = work.await;

    if let Err(e) = store.release_run_lock().await {
        tracing::warn!(error = %reason_of(&e), "Failed to release run lock");
    }
    result
}

/// Run `work` inside `BEGIN`/`COMMIT`, rolling back if it fails.
pub(crate) async fn in_transaction<T>(
    store: &VersionStore<'_>,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    let client = store.client();
    db::begin(client).await?;
    match work.await {
        Ok(value) => {
            db::commit(client).await?;
            Ok(value)
        }
        Err(e) => {
            db::rollback_quietly(client).await;
            Err(e)
        }
    }
}
