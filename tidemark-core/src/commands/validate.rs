use serde::Serialize;
use tokio_postgres::Client;

use crate::config::TidemarkConfig;
use crate::discovery::DiscoveryReport;
use crate::error::{Result, TidemarkError};
use crate::history::TrackingRecord;
use crate::migration::MigrationRegistry;

/// Report returned after a validate operation.
#[derive(Debug, Serialize)]
pub struct ValidateReport {
    pub valid: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

/// Execute the validate command.
///
/// Duplicate versions fail immediately. Orphans and bad strategy headers are
/// issues. Checksum drift fails in strict mode and warns otherwise. Records
/// with no file on disk are warnings.
pub async fn execute(
    client: &Client,
    config: &TidemarkConfig,
    registry: &MigrationRegistry,
) -> Result<ValidateReport> {
    let discovery = super::discover(config, registry)?;
    if !discovery.duplicates.is_empty() {
        return Err(TidemarkError::DuplicateVersions(discovery.duplicates));
    }

    let store = super::version_store(client, config);
    let records = store.applied_records().await?;
    let report = check(&discovery, &records, config.migrations.strict_checksums)?;

    tracing::info!(
        valid = report.valid,
        issue_count = report.issues.len(),
        warning_count = report.warnings.len(),
        "Validation completed"
    );

    if !report.valid {
        return Err(TidemarkError::ValidationFailed(report.issues.join("\n")));
    }
    Ok(report)
}

fn check(discovery: &DiscoveryReport, records: &[TrackingRecord], strict: bool) -> Result<ValidateReport> {
    let mut issues = Vec::new();
    let mut warnings = super::migrate::verify_checksums(records, discovery, strict)?;

    for orphan in &discovery.orphans {
        issues.push(format!("Orphaned file {}: {}", orphan.path.display(), orphan.reason));
    }
    for header in &discovery.invalid_headers {
        issues.push(format!(
            "Unrecognized strategy header in {}: '{}'",
            header.path.display(),
            header.value
        ));
    }
    for record in records {
        if discovery.find(&record.version).is_none() {
            warnings.push(format!(
                "Applied migration {} ({}) not found on disk",
                record.version, record.name
            ));
        }
    }

    Ok(ValidateReport {
        valid: issues.is_empty(),
        issues,
        warnings,
    })
}
