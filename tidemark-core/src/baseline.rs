//! Baseline detection: compare the live schema against committed snapshots.
//!
//! Snapshots are `<version>_<name>.sql` files holding the cumulative DDL at
//! that version. Both sides are normalized before comparison so comments,
//! case, whitespace, `IF [NOT] EXISTS` and table order do not matter.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex_lite::Regex;
use serde::Serialize;
use tokio_postgres::Client;

use crate::error::Result;
use crate::history::{NewRecord, VersionStore};
use crate::migration::{MigrationDefinition, MigrationVersion};

static BLOCK_COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());
static LINE_COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"--[^\n]*").unwrap());
static IF_NOT_EXISTS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bif\s+not\s+exists\b").unwrap());
static IF_EXISTS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bif\s+exists\b").unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static CREATE_TABLE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"create table ").unwrap());
static SNAPSHOT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(?:\.\d+)*)_(.+)\.sql$").unwrap());

/// Canonical form of DDL for structural comparison.
pub fn normalize(ddl: &str) -> String {
    let sql = BLOCK_COMMENT_RE.replace_all(ddl, " ");
    let sql = LINE_COMMENT_RE.replace_all(&sql, " ");
    let sql = sql.to_lowercase();
    let sql = IF_NOT_EXISTS_RE.replace_all(&sql, "");
    let sql = IF_EXISTS_RE.replace_all(&sql, "");
    let sql = WHITESPACE_RE.replace_all(&sql, " ");
    sort_create_table_blocks(sql.trim())
}

/// Reorder `create table` blocks by table name, keeping any leading prefix.
fn sort_create_table_blocks(sql: &str) -> String {
    let starts: Vec<usize> = CREATE_TABLE_RE.find_iter(sql).map(|m| m.start()).collect();
    if starts.is_empty() {
        return sql.to_string();
    }

    let prefix = sql[..starts[0]].trim();
    let mut blocks: Vec<&str> = starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).copied().unwrap_or(sql.len());
            sql[start..end].trim()
        })
        .collect();
    blocks.sort_by_key(|block| {
        block["create table ".len()..]
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or("")
            .to_string()
    });

    let mut parts: Vec<&str> = Vec::with_capacity(blocks.len() + 1);
    if !prefix.is_empty() {
        parts.push(prefix);
    }
    parts.extend(blocks);
    parts.join(" ")
}

/// Cumulative DDL at a given version.
#[derive(Debug, Clone, Serialize)]
pub struct BaselineSnapshot {
    pub version: String,
    pub path: PathBuf,
    #[serde(skip)]
    pub cumulative_ddl: String,
    #[serde(skip)]
    pub normalized: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotMatch {
    pub version: String,
    pub similarity: f64,
    pub exact: bool,
}

/// Result of comparing the live schema to every snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchOutcome {
    /// Exact match, or the most similar snapshot at or above the threshold.
    pub matched: Option<SnapshotMatch>,
    /// Most similar snapshot regardless of threshold.
    pub closest: Option<SnapshotMatch>,
    pub snapshots_compared: usize,
}

#[derive(Debug, Clone)]
pub struct BaselineDetector {
    snapshots_dir: PathBuf,
    similarity_threshold: f64,
}

impl BaselineDetector {
    pub fn new(snapshots_dir: impl Into<PathBuf>, similarity_threshold: f64) -> Self {
        Self {
            snapshots_dir: snapshots_dir.into(),
            similarity_threshold,
        }
    }

    pub fn snapshots_dir(&self) -> &Path {
        &self.snapshots_dir
    }

    /// Load snapshots, newest version first.
    pub fn load_snapshots(&self) -> Result<Vec<BaselineSnapshot>> {
        let mut snapshots = Vec::new();
        if !self.snapshots_dir.is_dir() {
            return Ok(snapshots);
        }

        for entry in std::fs::read_dir(&self.snapshots_dir)? {
            let path = entry?.path();
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(caps) = SNAPSHOT_RE.captures(filename) else {
                tracing::debug!(file = %filename, "Skipping file that is not a schema snapshot");
                continue;
            };
            let version = caps[1].to_string();
            let cumulative_ddl = std::fs::read_to_string(&path)?;
            let normalized = normalize(&cumulative_ddl);
            snapshots.push(BaselineSnapshot {
                version,
                path,
                cumulative_ddl,
                normalized,
            });
        }

        snapshots.sort_by(|a, b| {
            MigrationVersion::new(b.version.as_str()).cmp(&MigrationVersion::new(a.version.as_str()))
        });
        Ok(snapshots)
    }

    /// Find the snapshot matching `live_ddl`: exact first, then best similarity.
    pub fn find_matching_snapshot(&self, live_ddl: &str) -> Result<MatchOutcome> {
        let live = normalize(live_ddl);
        let snapshots = self.load_snapshots()?;
        Ok(self.match_normalized(&live, &snapshots))
    }

    fn match_normalized(&self, live: &str, snapshots: &[BaselineSnapshot]) -> MatchOutcome {
        let mut outcome = MatchOutcome {
            snapshots_compared: snapshots.len(),
            ..Default::default()
        };

        for snapshot in snapshots {
            if snapshot.normalized == live {
                let exact = SnapshotMatch {
                    version: snapshot.version.clone(),
                    similarity: 1.0,
                    exact: true,
                };
                outcome.closest = Some(exact.clone());
                outcome.matched = Some(exact);
                return outcome;
            }
            let similarity = strsim::sorensen_dice(live, &snapshot.normalized);
            let better = outcome
                .closest
                .as_ref()
                .map_or(true, |c| similarity > c.similarity);
            if better {
                outcome.closest = Some(SnapshotMatch {
                    version: snapshot.version.clone(),
                    similarity,
                    exact: false,
                });
            }
        }

        outcome.matched = outcome
            .closest
            .clone()
            .filter(|c| c.similarity >= self.similarity_threshold);
        outcome
    }
}

struct LiveColumn {
    name: String,
    pg_type: String,
    not_null: bool,
    primary_key: bool,
}

/// Render tables and columns of `schemas` as `create table` blocks.
///
/// The table named by `exclude` (schema, table) is skipped so the tracking
/// table never takes part in comparisons.
pub async fn introspect_live_schema(
    client: &Client,
    schemas: &[String],
    exclude: (&str, &str),
) -> Result<String> {
    let rows = client
        .query(
            "SELECT n.nspname, c.relname, a.attname, \
                    pg_catalog.format_type(a.atttypid, a.atttypmod), a.attnotnull, \
                    COALESCE(a.attnum = ANY(i.indkey), false) \
             FROM pg_catalog.pg_class c \
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
             JOIN pg_catalog.pg_attribute a ON a.attrelid = c.oid AND a.attnum > 0 AND NOT a.attisdropped \
             LEFT JOIN pg_catalog.pg_index i ON i.indrelid = c.oid AND i.indisprimary \
             WHERE c.relkind IN ('r', 'p') AND n.nspname = ANY($1) \
             ORDER BY n.nspname, c.relname, a.attnum",
            &[&schemas],
        )
        .await?;

    let mut tables: BTreeMap<String, Vec<LiveColumn>> = BTreeMap::new();
    for row in rows {
        let schema: String = row.get(0);
        let table: String = row.get(1);
        if schema == exclude.0 && table == exclude.1 {
            continue;
        }
        let qualified = if schema == "public" {
            table
        } else {
            format!("{}.{}", schema, table)
        };
        tables.entry(qualified).or_default().push(LiveColumn {
            name: row.get(2),
            pg_type: row.get(3),
            not_null: row.get(4),
            primary_key: row.get(5),
        });
    }

    let blocks: Vec<String> = tables
        .into_iter()
        .map(|(table, columns)| {
            let mut defs: Vec<String> = columns
                .iter()
                .map(|c| {
                    let null_clause = if c.not_null { " not null" } else { "" };
                    format!("  {} {}{}", c.name, c.pg_type, null_clause)
                })
                .collect();
            let pk: Vec<&str> = columns
                .iter()
                .filter(|c| c.primary_key)
                .map(|c| c.name.as_str())
                .collect();
            if !pk.is_empty() {
                defs.push(format!("  primary key ({})", pk.join(", ")));
            }
            format!("create table {} (\n{}\n);", table, defs.join(",\n"))
        })
        .collect();

    Ok(blocks.join("\n\n"))
}

/// Mark every definition at or below `through` (all when `None`) as applied
/// without running it.
///
/// Marking is a union: existing records are left alone. Runs on the caller's
/// transaction. Returns the versions newly marked, in order.
pub async fn mark_through(
    store: &VersionStore<'_>,
    definitions: &[MigrationDefinition],
    through: Option<&MigrationVersion>,
) -> Result<Vec<String>> {
    let applied: HashSet<String> = store.applied_versions().await?.into_iter().collect();
    let mut marked = Vec::new();

    for definition in definitions {
        if through.is_some_and(|t| definition.version > *t) {
            continue;
        }
        if applied.contains(definition.version.as_str()) {
            tracing::debug!(version = %definition.version, "Already recorded, leaving as is");
            continue;
        }
        store
            .record_applied(&NewRecord {
                version: definition.version.as_str(),
                name: &definition.name,
                checksum: &definition.checksum,
                execution_time_ms: 0,
            })
            .await?;
        tracing::info!(version = %definition.version, name = %definition.name, "Marked as applied");
        marked.push(definition.version.to_string());
    }

    Ok(marked)
}
