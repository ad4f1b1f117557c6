//! Migration types, filename parsing and strategy headers.
//!
//! Migrations are named `<version>_<name>.<ext>`. SQL migrations come in
//! pairs (`.up.sql` / `.down.sql`); code migrations implement [`CodeMigration`]
//! and are matched to `<version>_<name>.<code_ext>` files by version and name.

use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex_lite::Regex;
use serde::Serialize;
use tokio_postgres::Client;

use crate::error::Result;
use crate::hooks::Hook;

static FILENAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(?:\.\d+)*)_([A-Za-z0-9][A-Za-z0-9_\-]*)$").unwrap());
static STRATEGY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^--\s*strategy:\s*(.*?)\s*$").unwrap());

/// Number of leading lines searched for a strategy header.
pub const HEADER_SCAN_LINES: usize = 10;

/// A migration version such as `001`, `20240105` or `1.2`.
///
/// Purely numeric versions (optionally dotted) compare segment-wise as numbers
/// and sort before every other version, which compare as text. Equality is on
/// the raw string, so `001` and `1` are distinct versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct MigrationVersion(String);

impl MigrationVersion {
    pub fn new(raw: impl Into<String>) -> Self {
        MigrationVersion(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn segments(&self) -> Option<Vec<u64>> {
        self.0.split('.').map(|s| s.parse::<u64>().ok()).collect()
    }
}

impl Ord for MigrationVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let ord = match (self.segments(), other.segments()) {
            (Some(a), Some(b)) => {
                let max_len = a.len().max(b.len());
                (0..max_len)
                    .map(|i| {
                        a.get(i)
                            .copied()
                            .unwrap_or(0)
                            .cmp(&b.get(i).copied().unwrap_or(0))
                    })
                    .find(|o| *o != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            }
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        ord.then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for MigrationVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MigrationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a migration is meant to be deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    Incremental,
    /// The change is better deployed by rebuilding from the schema source.
    Rebuild,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Incremental => write!(f, "incremental"),
            Strategy::Rebuild => write!(f, "rebuild"),
        }
    }
}

/// Result of reading a `-- Strategy:` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyHeader {
    pub strategy: Strategy,
    pub transactional: bool,
}

impl Default for StrategyHeader {
    fn default() -> Self {
        Self {
            strategy: Strategy::Incremental,
            transactional: true,
        }
    }
}

/// Parse the strategy directive from the first lines of a SQL file.
///
/// Returns `Ok(None)` when no directive is present. `Err(value)` carries the
/// offending text when the directive is unrecognized or conflicts with an
/// earlier one.
pub fn parse_strategy_header(content: &str) -> std::result::Result<Option<StrategyHeader>, String> {
    let mut found: Option<(String, StrategyHeader)> = None;

    for line in content.lines().take(HEADER_SCAN_LINES) {
        let Some(caps) = STRATEGY_RE.captures(line.trim()) else {
            continue;
        };
        let value = caps
            .get(1)
            .map(|m| m.as_str().to_lowercase())
            .unwrap_or_default();
        let header = match value.as_str() {
            "incremental" => StrategyHeader::default(),
            "rebuild" => StrategyHeader {
                strategy: Strategy::Rebuild,
                transactional: true,
            },
            "non-transactional" | "non_transactional" => StrategyHeader {
                strategy: Strategy::Incremental,
                transactional: false,
            },
            _ => return Err(value),
        };
        match &found {
            Some((previous, existing)) if *existing != header => {
                return Err(format!("{} (conflicts with {})", value, previous));
            }
            Some(_) => {}
            None => found = Some((value, header)),
        }
    }

    Ok(found.map(|(_, header)| header))
}

/// Which half of a migration a file on disk provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    Code,
    Up,
    Down,
}

/// Identity parsed from a migration filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFilename {
    pub version: MigrationVersion,
    pub name: String,
    pub role: FileRole,
}

/// Parse `<version>_<name>.up.sql`, `<version>_<name>.down.sql` or
/// `<version>_<name>.<code_ext>`. Returns `None` when the name does not fit.
pub fn parse_filename(filename: &str, code_extensions: &[String]) -> Option<ParsedFilename> {
    let (stem, role) = if let Some(stem) = filename.strip_suffix(".up.sql") {
        (stem, FileRole::Up)
    } else if let Some(stem) = filename.strip_suffix(".down.sql") {
        (stem, FileRole::Down)
    } else {
        let (stem, ext) = filename.rsplit_once('.')?;
        if !code_extensions.iter().any(|e| e == ext) {
            return None;
        }
        (stem, FileRole::Code)
    };

    let caps = FILENAME_RE.captures(stem)?;
    Some(ParsedFilename {
        version: MigrationVersion::new(&caps[1]),
        name: caps[2].to_string(),
        role,
    })
}

/// Version and name of a `<version>_<name>.<anything>` file whose extension
/// is not a known migration kind.
pub fn parse_version_prefix(filename: &str) -> Option<(MigrationVersion, String)> {
    let (stem, _) = filename.split_once('.')?;
    FILENAME_RE
        .captures(stem)
        .map(|caps| (MigrationVersion::new(&caps[1]), caps[2].to_string()))
}

/// A migration written in Rust against the live connection.
///
/// `up` and `down` run inside the engine's transaction unless
/// `transactional()` returns false.
#[async_trait]
pub trait CodeMigration: Send + Sync {
    fn version(&self) -> &str;

    fn name(&self) -> &str;

    async fn up(&self, client: &Client) -> Result<()>;

    async fn down(&self, client: &Client) -> Result<()>;

    fn transactional(&self) -> bool {
        true
    }

    fn strategy(&self) -> Strategy {
        Strategy::Incremental
    }

    /// Hooks declared by this migration, merged with configured hooks per phase.
    fn hooks(&self) -> Vec<Arc<dyn Hook>> {
        Vec::new()
    }

    /// Extra text folded into the checksum of a migration with no file on disk.
    fn checksum_source(&self) -> Option<String> {
        None
    }
}

/// Code migrations known to this process.
#[derive(Clone, Default)]
pub struct MigrationRegistry {
    migrations: Vec<Arc<dyn CodeMigration>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, migration: Arc<dyn CodeMigration>) -> &mut Self {
        self.migrations.push(migration);
        self
    }

    pub fn find(&self, version: &str, name: &str) -> Option<&Arc<dyn CodeMigration>> {
        self.migrations
            .iter()
            .find(|m| m.version() == version && m.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn CodeMigration>> {
        self.migrations.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

impl fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.migrations.iter().map(|m| format!("{}_{}", m.version(), m.name())))
            .finish()
    }
}

/// The forward/backward bodies of a migration.
#[derive(Clone)]
pub enum MigrationKind {
    Code(Arc<dyn CodeMigration>),
    SqlPair { up_sql: String, down_sql: String },
}

impl MigrationKind {
    pub fn label(&self) -> &'static str {
        match self {
            MigrationKind::Code(_) => "code",
            MigrationKind::SqlPair { .. } => "sql",
        }
    }
}

impl fmt::Debug for MigrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationKind::Code(m) => write!(f, "Code({}_{})", m.version(), m.name()),
            MigrationKind::SqlPair { .. } => write!(f, "SqlPair"),
        }
    }
}

/// A migration discovered on disk or in the registry. Immutable for a run.
#[derive(Debug, Clone)]
pub struct MigrationDefinition {
    pub version: MigrationVersion,
    pub name: String,
    pub kind: MigrationKind,
    pub strategy: Strategy,
    pub transactional: bool,
    pub source_paths: Vec<PathBuf>,
    pub checksum: String,
}

impl MigrationDefinition {
    /// Hooks declared by the migration itself.
    pub fn declared_hooks(&self) -> Vec<Arc<dyn Hook>> {
        match &self.kind {
            MigrationKind::Code(m) => m.hooks(),
            MigrationKind::SqlPair { .. } => Vec::new(),
        }
    }

    pub fn label(&self) -> String {
        format!("{}_{}", self.version, self.name)
    }
}
