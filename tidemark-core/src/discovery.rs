//! Migration discovery: directory scan, duplicate detection and orphan reporting.
//!
//! Discovery never touches the database. Mutating commands re-run it at the
//! start of every invocation and refuse to continue when
//! [`DiscoveryReport::ensure_runnable`] fails.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::checksum::{calculate_checksum, calculate_pair_checksum};
use crate::error::{Result, TidemarkError};
use crate::migration::{
    parse_filename, parse_strategy_header, parse_version_prefix, FileRole, MigrationDefinition, MigrationKind,
    MigrationRegistry, MigrationVersion, StrategyHeader,
};

/// Version → every source path claiming it, for versions claimed more than once.
pub type DuplicateVersionReport = BTreeMap<String, Vec<PathBuf>>;

/// A file that looks like a migration but cannot become one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// A strategy directive that could not be understood.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidHeader {
    pub path: PathBuf,
    pub value: String,
}

#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Sorted by version, then name.
    pub definitions: Vec<MigrationDefinition>,
    pub duplicates: DuplicateVersionReport,
    pub orphans: Vec<OrphanedFile>,
    pub invalid_headers: Vec<InvalidHeader>,
}

impl DiscoveryReport {
    /// Fail with the first blocking discovery problem, if any.
    pub fn ensure_runnable(&self) -> Result<()> {
        if !self.duplicates.is_empty() {
            return Err(TidemarkError::DuplicateVersions(self.duplicates.clone()));
        }
        if let Some(bad) = self.invalid_headers.first() {
            return Err(TidemarkError::InvalidStrategyHeader {
                path: bad.path.display().to_string(),
                value: bad.value.clone(),
            });
        }
        if !self.orphans.is_empty() {
            return Err(TidemarkError::OrphanedFiles(
                self.orphans
                    .iter()
                    .map(|o| format!("{} ({})", o.path.display(), o.reason))
                    .collect(),
            ));
        }
        Ok(())
    }

    pub fn find(&self, version: &str) -> Option<&MigrationDefinition> {
        self.definitions.iter().find(|d| d.version.as_str() == version)
    }
}

/// Files sharing one `(version, name)` identity, split by kind.
#[derive(Default)]
struct Unit {
    up: Option<PathBuf>,
    down: Option<PathBuf>,
    code: Option<PathBuf>,
}

struct Scan {
    units: BTreeMap<(MigrationVersion, String), Unit>,
    orphans: Vec<OrphanedFile>,
    /// Version-prefixed files with an unknown extension. They still claim
    /// their version for duplicate detection.
    stray: Vec<((MigrationVersion, String), PathBuf)>,
}

fn scan_directory(dir: &Path, code_extensions: &[String]) -> Result<Scan> {
    let mut scan = Scan {
        units: BTreeMap::new(),
        orphans: Vec::new(),
        stray: Vec::new(),
    };

    if !dir.exists() {
        tracing::debug!(dir = %dir.display(), "Migrations directory does not exist");
        return Ok(scan);
    }

    let entries = std::fs::read_dir(dir).map_err(|e| {
        TidemarkError::IoError(std::io::Error::new(
            e.kind(),
            format!("Failed to read migrations directory '{}': {}", dir.display(), e),
        ))
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    for path in files {
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if filename.starts_with('.') {
            continue;
        }

        match parse_filename(filename, code_extensions) {
            Some(parsed) => {
                let unit = scan.units.entry((parsed.version, parsed.name)).or_default();
                match parsed.role {
                    FileRole::Up => unit.up = Some(path),
                    FileRole::Down => unit.down = Some(path),
                    FileRole::Code => unit.code = Some(path),
                }
            }
            None => {
                let is_candidate = filename.ends_with(".sql")
                    || filename
                        .rsplit_once('.')
                        .is_some_and(|(_, ext)| code_extensions.iter().any(|e| e == ext));
                if is_candidate {
                    scan.orphans.push(OrphanedFile {
                        path,
                        reason: "name does not match <version>_<name>.up.sql/.down.sql or a code extension"
                            .to_string(),
                    });
                } else if let Some(key) = parse_version_prefix(filename) {
                    tracing::warn!(file = %filename, "Migration file has an unrecognized extension");
                    scan.stray.push((key, path.clone()));
                    scan.orphans.push(OrphanedFile {
                        path,
                        reason: format!(
                            "unrecognized migration extension (expected .up.sql/.down.sql or one of: {})",
                            code_extensions.join(", ")
                        ),
                    });
                } else {
                    tracing::debug!(file = %filename, "Ignoring non-migration file");
                }
            }
        }
    }

    Ok(scan)
}

/// Group source paths by version across every migration kind.
fn collect_duplicates(
    claims: impl IntoIterator<Item = (MigrationVersion, PathBuf)>,
) -> DuplicateVersionReport {
    let mut by_version: BTreeMap<MigrationVersion, Vec<PathBuf>> = BTreeMap::new();
    for (version, path) in claims {
        by_version.entry(version).or_default().push(path);
    }
    by_version
        .into_iter()
        .filter(|(_, paths)| paths.len() > 1)
        .map(|(version, paths)| (version.to_string(), paths))
        .collect()
}

fn unit_claims(scan: &Scan) -> Vec<(MigrationVersion, PathBuf)> {
    let mut claims = Vec::new();
    for ((version, _), unit) in &scan.units {
        if let Some(code) = &unit.code {
            claims.push((version.clone(), code.clone()));
        }
        if let Some(sql) = unit.up.as_ref().or(unit.down.as_ref()) {
            claims.push((version.clone(), sql.clone()));
        }
    }
    // A stray copy of a known migration (e.g. `.up.sql.bak`) is not a second claim.
    claims.extend(
        scan.stray
            .iter()
            .filter(|(key, _)| !scan.units.contains_key(key))
            .map(|((version, _), path)| (version.clone(), path.clone())),
    );
    claims
}

/// Find versions claimed by more than one migration, regardless of kind.
///
/// A missing directory yields an empty report.
pub fn find_duplicate_versions(dir: &Path, code_extensions: &[String]) -> Result<DuplicateVersionReport> {
    let scan = scan_directory(dir, code_extensions)?;
    Ok(collect_duplicates(unit_claims(&scan)))
}

/// Scan `dir` and the registry into a full discovery report.
pub fn discover(
    dir: &Path,
    registry: &MigrationRegistry,
    code_extensions: &[String],
) -> Result<DiscoveryReport> {
    let scan = scan_directory(dir, code_extensions)?;
    let mut claims = unit_claims(&scan);
    let mut report = DiscoveryReport {
        orphans: scan.orphans.clone(),
        ..Default::default()
    };

    let mut matched: Vec<(String, String)> = Vec::new();

    for ((version, name), unit) in &scan.units {
        if let Some(code_path) = &unit.code {
            match registry.find(version.as_str(), name) {
                Some(migration) => {
                    matched.push((version.to_string(), name.clone()));
                    let content = std::fs::read_to_string(code_path)?;
                    report.definitions.push(MigrationDefinition {
                        version: version.clone(),
                        name: name.clone(),
                        kind: MigrationKind::Code(migration.clone()),
                        strategy: migration.strategy(),
                        transactional: migration.transactional(),
                        source_paths: vec![code_path.clone()],
                        checksum: calculate_checksum(&content),
                    });
                }
                None => report.orphans.push(OrphanedFile {
                    path: code_path.clone(),
                    reason: "no registered code migration with this version and name".to_string(),
                }),
            }
        }

        match (&unit.up, &unit.down) {
            (Some(up_path), Some(down_path)) => {
                let up_sql = std::fs::read_to_string(up_path)?;
                let down_sql = std::fs::read_to_string(down_path)?;
                let header = match parse_strategy_header(&up_sql) {
                    Ok(h) => h.unwrap_or_default(),
                    Err(value) => {
                        report.invalid_headers.push(InvalidHeader {
                            path: up_path.clone(),
                            value,
                        });
                        StrategyHeader::default()
                    }
                };
                let checksum = calculate_pair_checksum(&up_sql, &down_sql);
                report.definitions.push(MigrationDefinition {
                    version: version.clone(),
                    name: name.clone(),
                    kind: MigrationKind::SqlPair { up_sql, down_sql },
                    strategy: header.strategy,
                    transactional: header.transactional,
                    source_paths: vec![up_path.clone(), down_path.clone()],
                    checksum,
                });
            }
            (Some(up_path), None) => report.orphans.push(OrphanedFile {
                path: up_path.clone(),
                reason: "missing matching .down.sql".to_string(),
            }),
            (None, Some(down_path)) => report.orphans.push(OrphanedFile {
                path: down_path.clone(),
                reason: "missing matching .up.sql".to_string(),
            }),
            (None, None) => {}
        }
    }

    // Registered migrations without a file on disk still count.
    for migration in registry.iter() {
        let key = (migration.version().to_string(), migration.name().to_string());
        if matched.contains(&key) {
            continue;
        }
        let version = MigrationVersion::new(migration.version());
        let pseudo_path = PathBuf::from(format!("<registered>/{}_{}", key.0, key.1));
        claims.push((version.clone(), pseudo_path));
        let checksum_input = format!(
            "{}:{}:{}",
            key.0,
            key.1,
            migration.checksum_source().unwrap_or_default()
        );
        report.definitions.push(MigrationDefinition {
            version,
            name: key.1,
            kind: MigrationKind::Code(migration.clone()),
            strategy: migration.strategy(),
            transactional: migration.transactional(),
            source_paths: Vec::new(),
            checksum: calculate_checksum(&checksum_input),
        });
    }

    report.duplicates = collect_duplicates(claims);
    report
        .definitions
        .sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.name.cmp(&b.name)));

    tracing::debug!(
        definitions = report.definitions.len(),
        duplicates = report.duplicates.len(),
        orphans = report.orphans.len(),
        "Discovery complete"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio_postgres::Client;

    use crate::config::MigrationSettings;
    use crate::migration::{CodeMigration, Strategy};

    struct Noop {
        version: &'static str,
        name: &'static str,
    }

    #[async_trait]
    impl CodeMigration for Noop {
        fn version(&self) -> &str {
            self.version
        }
        fn name(&self) -> &str {
            self.name
        }
        async fn up(&self, _client: &Client) -> Result<()> {
            Ok(())
        }
        async fn down(&self, _client: &Client) -> Result<()> {
            Ok(())
        }
    }

    fn exts() -> Vec<String> {
        vec!["rs".to_string(), "py".to_string()]
    }

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_duplicate_code_migrations_grouped() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "001_create_users.py", "");
        let b = write(dir.path(), "001_backfill_data.py", "");

        let dups = find_duplicate_versions(dir.path(), &exts()).unwrap();
        assert_eq!(dups.len(), 1);
        let paths = &dups["001"];
        assert_eq!(paths.len(), 2);
        assert!(paths.contains(&a));
        assert!(paths.contains(&b));
    }

    #[test]
    fn test_unknown_extension_claims_version_with_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "001_create_users.py", "");
        let b = write(dir.path(), "001_backfill_data.py", "");
        write(dir.path(), "notes.txt", "not a migration");
        let defaults = MigrationSettings::default().code_extensions;

        let dups = find_duplicate_versions(dir.path(), &defaults).unwrap();
        assert_eq!(dups["001"], vec![b.clone(), a.clone()]);

        let report = discover(dir.path(), &MigrationRegistry::new(), &defaults).unwrap();
        assert_eq!(report.orphans.len(), 2);
        assert!(report.orphans.iter().all(|o| o.reason.contains("unrecognized migration extension")));
        assert!(matches!(
            report.ensure_runnable(),
            Err(TidemarkError::DuplicateVersions(map)) if map["001"].len() == 2
        ));
    }

    #[test]
    fn test_unknown_extension_alone_is_orphan() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001_first.up.sql", "SELECT 1;");
        write(dir.path(), "001_first.down.sql", "SELECT -1;");
        let stray = write(dir.path(), "002_backfill.py", "");
        let defaults = MigrationSettings::default().code_extensions;

        write(dir.path(), "001_first.up.sql.bak", "SELECT 1;");

        let report = discover(dir.path(), &MigrationRegistry::new(), &defaults).unwrap();
        assert!(report.duplicates.is_empty());
        assert_eq!(report.orphans.len(), 2);
        assert!(report.orphans.iter().any(|o| o.path == stray));
        assert!(matches!(report.ensure_runnable(), Err(TidemarkError::OrphanedFiles(_))));
    }

    #[test]
    fn test_duplicate_across_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let code = write(dir.path(), "001_create_users.rs", "");
        let up = write(dir.path(), "001_add_email.up.sql", "ALTER TABLE users ADD email TEXT;");
        write(dir.path(), "001_add_email.down.sql", "ALTER TABLE users DROP email;");
        write(dir.path(), "002_other.up.sql", "SELECT 1;");
        write(dir.path(), "002_other.down.sql", "SELECT 1;");

        let dups = find_duplicate_versions(dir.path(), &exts()).unwrap();
        assert_eq!(dups.len(), 1);
        let paths = &dups["001"];
        assert_eq!(paths.len(), 2);
        assert!(paths.contains(&code));
        assert!(paths.contains(&up));
    }

    #[test]
    fn test_same_name_code_and_sql_is_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "003_users.rs", "");
        write(dir.path(), "003_users.up.sql", "SELECT 1;");
        write(dir.path(), "003_users.down.sql", "SELECT 1;");

        let dups = find_duplicate_versions(dir.path(), &exts()).unwrap();
        assert_eq!(dups["003"].len(), 2);
    }

    #[test]
    fn test_missing_and_empty_directories() {
        let missing = find_duplicate_versions(Path::new("/nonexistent/tidemark"), &exts()).unwrap();
        assert!(missing.is_empty());

        let dir = tempfile::tempdir().unwrap();
        let report = discover(dir.path(), &MigrationRegistry::new(), &exts()).unwrap();
        assert!(report.definitions.is_empty());
        assert!(report.duplicates.is_empty());
        assert!(report.orphans.is_empty());
        assert!(report.ensure_runnable().is_ok());
    }

    #[test]
    fn test_sql_pairs_sorted_with_strategy() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "010_late.up.sql", "SELECT 10;");
        write(dir.path(), "010_late.down.sql", "SELECT -10;");
        write(dir.path(), "002_rebuild.up.sql", "-- Strategy: rebuild\nSELECT 2;");
        write(dir.path(), "002_rebuild.down.sql", "SELECT -2;");
        write(dir.path(), "001_first.up.sql", "SELECT 1;");
        write(dir.path(), "001_first.down.sql", "SELECT -1;");

        let report = discover(dir.path(), &MigrationRegistry::new(), &exts()).unwrap();
        let versions: Vec<&str> = report.definitions.iter().map(|d| d.version.as_str()).collect();
        assert_eq!(versions, vec!["001", "002", "010"]);
        assert_eq!(report.definitions[1].strategy, Strategy::Rebuild);
        assert_eq!(report.definitions[0].source_paths.len(), 2);
        assert!(report.ensure_runnable().is_ok());
    }

    #[test]
    fn test_orphans_reported_not_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001_only_up.up.sql", "SELECT 1;");
        write(dir.path(), "002_only_down.down.sql", "SELECT 1;");
        write(dir.path(), "no_version.up.sql", "SELECT 1;");
        write(dir.path(), "003_plain.sql", "SELECT 1;");
        write(dir.path(), "README.md", "docs");

        let report = discover(dir.path(), &MigrationRegistry::new(), &exts()).unwrap();
        assert!(report.definitions.is_empty());
        assert_eq!(report.orphans.len(), 4);
        let err = report.ensure_runnable().unwrap_err();
        assert!(matches!(err, TidemarkError::OrphanedFiles(ref files) if files.len() == 4));
    }

    #[test]
    fn test_invalid_strategy_header_blocks() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001_x.up.sql", "-- Strategy: yolo\nSELECT 1;");
        write(dir.path(), "001_x.down.sql", "SELECT 1;");

        let report = discover(dir.path(), &MigrationRegistry::new(), &exts()).unwrap();
        assert_eq!(report.invalid_headers.len(), 1);
        assert!(matches!(
            report.ensure_runnable(),
            Err(TidemarkError::InvalidStrategyHeader { ref value, .. }) if value == "yolo"
        ));
    }

    #[test]
    fn test_code_migrations_need_registration() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001_seed_roles.rs", "// seeds roles");
        write(dir.path(), "002_unknown.rs", "");

        let mut registry = MigrationRegistry::new();
        registry.register(Arc::new(Noop {
            version: "001",
            name: "seed_roles",
        }));
        registry.register(Arc::new(Noop {
            version: "005",
            name: "compiled_in",
        }));

        let report = discover(dir.path(), &registry, &exts()).unwrap();
        let labels: Vec<String> = report.definitions.iter().map(|d| d.label()).collect();
        assert_eq!(labels, vec!["001_seed_roles", "005_compiled_in"]);
        assert!(report.definitions[1].source_paths.is_empty());
        assert_eq!(report.orphans.len(), 1);
        assert!(report.orphans[0].path.ends_with("002_unknown.rs"));
    }

    #[test]
    fn test_registered_migration_colliding_with_file_is_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001_create.up.sql", "SELECT 1;");
        write(dir.path(), "001_create.down.sql", "SELECT 1;");

        let mut registry = MigrationRegistry::new();
        registry.register(Arc::new(Noop {
            version: "001",
            name: "other",
        }));

        let report = discover(dir.path(), &registry, &exts()).unwrap();
        assert!(matches!(
            report.ensure_runnable(),
            Err(TidemarkError::DuplicateVersions(ref map)) if map["001"].len() == 2
        ));
    }

    #[test]
    fn test_checksum_changes_with_down_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001_a.up.sql", "SELECT 1;");
        write(dir.path(), "001_a.down.sql", "SELECT 2;");
        let first = discover(dir.path(), &MigrationRegistry::new(), &exts()).unwrap();

        write(dir.path(), "001_a.down.sql", "SELECT 3;");
        let second = discover(dir.path(), &MigrationRegistry::new(), &exts()).unwrap();

        assert_ne!(first.definitions[0].checksum, second.definitions[0].checksum);
    }
}
