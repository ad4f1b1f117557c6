use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_postgres::Client;

use crate::config::TidemarkConfig;
use crate::discovery::{DiscoveryReport, DuplicateVersionReport, InvalidHeader, OrphanedFile};
use crate::error::Result;
use crate::history::TrackingRecord;
use crate::migration::{MigrationRegistry, MigrationVersion, Strategy};

/// The state of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationState {
    Applied,
    Pending,
    /// Applied, but the file changed since.
    ChecksumMismatch,
    /// Recorded as applied but absent on disk.
    Missing,
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationState::Applied => write!(f, "Applied"),
            MigrationState::Pending => write!(f, "Pending"),
            MigrationState::ChecksumMismatch => write!(f, "Checksum Mismatch"),
            MigrationState::Missing => write!(f, "Missing"),
        }
    }
}

/// Combined view of a migration (definition + tracking record).
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub version: String,
    pub name: String,
    pub kind: Option<&'static str>,
    pub strategy: Option<Strategy>,
    pub state: MigrationState,
    pub applied_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub tracking_table_exists: bool,
    pub migrations: Vec<MigrationStatus>,
    pub applied_count: usize,
    pub pending_count: usize,
    pub duplicates: DuplicateVersionReport,
    pub orphans: Vec<OrphanedFile>,
    pub invalid_headers: Vec<InvalidHeader>,
    pub rebuild_recommended: bool,
    pub rebuild_reasons: Vec<String>,
}

/// Execute the status command. Read-only; works before the tracking table exists.
pub async fn execute(
    client: &Client,
    config: &TidemarkConfig,
    registry: &MigrationRegistry,
) -> Result<StatusReport> {
    let discovery = super::discover(config, registry)?;
    let store = super::version_store(client, config);
    let exists = store.exists().await?;
    let records = if exists {
        store.applied_records().await?
    } else {
        Vec::new()
    };
    Ok(build_report(
        exists,
        &records,
        discovery,
        config.migrations.rebuild_threshold,
    ))
}

fn build_report(
    tracking_table_exists: bool,
    records: &[TrackingRecord],
    discovery: DiscoveryReport,
    rebuild_threshold: usize,
) -> StatusReport {
    let by_version: HashMap<&str, &TrackingRecord> =
        records.iter().map(|r| (r.version.as_str(), r)).collect();

    let mut migrations: Vec<MigrationStatus> = discovery
        .definitions
        .iter()
        .map(|d| {
            let record = by_version.get(d.version.as_str());
            let state = match record {
                Some(r) if r.checksum != d.checksum => MigrationState::ChecksumMismatch,
                Some(_) => MigrationState::Applied,
                None => MigrationState::Pending,
            };
            MigrationStatus {
                version: d.version.to_string(),
                name: d.name.clone(),
                kind: Some(d.kind.label()),
                strategy: Some(d.strategy),
                state,
                applied_at: record.map(|r| r.applied_at),
                execution_time_ms: record.map(|r| r.execution_time_ms),
            }
        })
        .collect();

    for record in records {
        if discovery.find(&record.version).is_none() {
            migrations.push(MigrationStatus {
                version: record.version.clone(),
                name: record.name.clone(),
                kind: None,
                strategy: None,
                state: MigrationState::Missing,
                applied_at: Some(record.applied_at),
                execution_time_ms: Some(record.execution_time_ms),
            });
        }
    }
    migrations.sort_by(|a, b| {
        MigrationVersion::new(a.version.as_str()).cmp(&MigrationVersion::new(b.version.as_str()))
    });

    let pending: Vec<&MigrationStatus> = migrations
        .iter()
        .filter(|m| m.state == MigrationState::Pending)
        .collect();
    let applied_count = migrations
        .iter()
        .filter(|m| m.state != MigrationState::Pending)
        .count();

    let mut rebuild_reasons = Vec::new();
    if pending.len() > rebuild_threshold {
        rebuild_reasons.push(format!(
            "{} pending migrations exceed threshold of {}",
            pending.len(),
            rebuild_threshold
        ));
    }
    for m in &pending {
        if m.strategy == Some(Strategy::Rebuild) {
            rebuild_reasons.push(format!(
                "Pending migration {} ({}) declares the rebuild strategy",
                m.version, m.name
            ));
        }
    }

    StatusReport {
        tracking_table_exists,
        applied_count,
        pending_count: pending.len(),
        rebuild_recommended: !rebuild_reasons.is_empty(),
        rebuild_reasons,
        migrations,
        duplicates: discovery.duplicates,
        orphans: discovery.orphans,
        invalid_headers: discovery.invalid_headers,
    }
}
