use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Extract the full error message from a tokio_postgres::Error,
/// including the underlying DbError details that Display hides.
pub fn format_db_error(e: &tokio_postgres::Error) -> String {
    if let Some(db_err) = e.as_db_error() {
        let mut msg = db_err.message().to_string();
        if let Some(detail) = db_err.detail() {
            msg.push_str(&format!("\n  Detail: {}", detail));
        }
        if let Some(hint) = db_err.hint() {
            msg.push_str(&format!("\n  Hint: {}", hint));
        }
        if let Some(position) = db_err.position() {
            msg.push_str(&format!("\n  Position: {:?}", position));
        }
        return msg;
    }
    let mut msg = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(s) = source {
        msg.push_str(&format!(": {}", s));
        source = s.source();
    }
    msg
}

/// Render any error as a single reason string, unwrapping driver errors.
pub fn reason_of(e: &TidemarkError) -> String {
    match e {
        TidemarkError::DatabaseError(db_err) => format_db_error(db_err),
        other => other.to_string(),
    }
}

/// Broad error families used by callers to decide retry, abort or manual repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Config,
    Discovery,
    Lock,
    Execution,
    Integrity,
    DryRun,
    Schema,
    Database,
    Io,
}

#[derive(Error, Debug)]
pub enum TidemarkError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Hook configuration error: {0}")]
    HookConfigError(String),

    #[error("Hook dependency cycle in phase {phase}: {}", hooks.join(" -> "))]
    HookCycle { phase: String, hooks: Vec<String> },

    #[error("Database error: {}", format_db_error(.0))]
    DatabaseError(#[from] tokio_postgres::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Migration parse error: {0}")]
    MigrationParseError(String),

    #[error("Duplicate migration versions found: {}", format_duplicates(.0))]
    DuplicateVersions(BTreeMap<String, Vec<PathBuf>>),

    #[error("Orphaned migration files found: {}", .0.join(", "))]
    OrphanedFiles(Vec<String>),

    #[error("Unrecognized strategy header '{value}' in {path}")]
    InvalidStrategyHeader { path: String, value: String },

    #[error("Migration run is locked: could not acquire lock {lock_id} within {timeout_secs}s")]
    LockTimeout { lock_id: i64, timeout_secs: u64 },

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Migration {version} ({name}) failed: {reason}")]
    MigrationFailed {
        version: String,
        name: String,
        reason: String,
        applied_before: Vec<String>,
        non_transactional: bool,
    },

    #[error("Rollback of migration {version} ({name}) failed: {reason}")]
    RollbackFailed {
        version: String,
        name: String,
        reason: String,
        non_transactional: bool,
    },

    #[error("Hook '{hook}' failed during {phase}: {reason}")]
    HookFailed {
        phase: String,
        hook: String,
        reason: String,
    },

    #[error("Migration {0} is already applied")]
    AlreadyApplied(String),

    #[error("Migration {0} is not applied")]
    NotApplied(String),

    #[error("Version {0} not found on disk")]
    VersionNotFound(String),

    #[error("Checksum mismatch for migration {version}: expected {expected}, found {found}")]
    ChecksumMismatch {
        version: String,
        expected: String,
        found: String,
    },

    #[error("Validation failed:\n{0}")]
    ValidationFailed(String),

    #[error("Dry run of migration {version} ({name}) failed: {reason}")]
    DryRunFailed {
        version: String,
        name: String,
        reason: String,
    },

    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("Rebuild failed: {0}")]
    RebuildFailed(String),

    #[error("Interrupted while running migration {version}")]
    Interrupted { version: String, manual_cleanup: bool },
}

fn format_duplicates(map: &BTreeMap<String, Vec<PathBuf>>) -> String {
    map.iter()
        .map(|(version, paths)| {
            let files: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
            format!("{} => [{}]", version, files.join(", "))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Structured form of an error for machine consumers.
#[derive(Debug, Serialize)]
pub struct ErrorReport {
    pub code: &'static str,
    pub category: ErrorCategory,
    pub message: String,
    pub context: BTreeMap<String, String>,
    pub hint: Option<&'static str>,
}

impl TidemarkError {
    /// Stable classification code.
    pub fn code(&self) -> &'static str {
        match self {
            TidemarkError::ConfigError(_) => "CONFIG_INVALID",
            TidemarkError::HookConfigError(_) => "CONFIG_HOOK_INVALID",
            TidemarkError::HookCycle { .. } => "CONFIG_HOOK_CYCLE",
            TidemarkError::DatabaseError(_) => "DATABASE_ERROR",
            TidemarkError::IoError(_) => "IO_ERROR",
            TidemarkError::MigrationParseError(_) => "DISCOVERY_PARSE_ERROR",
            TidemarkError::DuplicateVersions(_) => "DISCOVERY_DUPLICATE_VERSION",
            TidemarkError::OrphanedFiles(_) => "DISCOVERY_ORPHANED_FILE",
            TidemarkError::InvalidStrategyHeader { .. } => "DISCOVERY_INVALID_STRATEGY",
            TidemarkError::LockTimeout { .. } => "LOCK_TIMEOUT",
            TidemarkError::LockError(_) => "LOCK_ERROR",
            TidemarkError::MigrationFailed { .. } => "EXEC_MIGRATION_FAILED",
            TidemarkError::RollbackFailed { .. } => "EXEC_ROLLBACK_FAILED",
            TidemarkError::HookFailed { .. } => "EXEC_HOOK_FAILED",
            TidemarkError::Interrupted { .. } => "EXEC_INTERRUPTED",
            TidemarkError::AlreadyApplied(_) => "STATE_ALREADY_APPLIED",
            TidemarkError::NotApplied(_) => "STATE_NOT_APPLIED",
            TidemarkError::VersionNotFound(_) => "INTEGRITY_VERSION_NOT_FOUND",
            TidemarkError::ChecksumMismatch { .. } => "INTEGRITY_CHECKSUM_MISMATCH",
            TidemarkError::ValidationFailed(_) => "INTEGRITY_VALIDATION_FAILED",
            TidemarkError::DryRunFailed { .. } => "DRY_RUN_FAILED",
            TidemarkError::SchemaError(_) => "SCHEMA_ERROR",
            TidemarkError::RebuildFailed(_) => "SCHEMA_REBUILD_FAILED",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            TidemarkError::ConfigError(_)
            | TidemarkError::HookConfigError(_)
            | TidemarkError::HookCycle { .. } => ErrorCategory::Config,
            TidemarkError::MigrationParseError(_)
            | TidemarkError::DuplicateVersions(_)
            | TidemarkError::OrphanedFiles(_)
            | TidemarkError::InvalidStrategyHeader { .. } => ErrorCategory::Discovery,
            TidemarkError::LockTimeout { .. } | TidemarkError::LockError(_) => ErrorCategory::Lock,
            TidemarkError::MigrationFailed { .. }
            | TidemarkError::RollbackFailed { .. }
            | TidemarkError::HookFailed { .. }
            | TidemarkError::Interrupted { .. }
            | TidemarkError::AlreadyApplied(_)
            | TidemarkError::NotApplied(_) => ErrorCategory::Execution,
            TidemarkError::VersionNotFound(_)
            | TidemarkError::ChecksumMismatch { .. }
            | TidemarkError::ValidationFailed(_) => ErrorCategory::Integrity,
            TidemarkError::DryRunFailed { .. } => ErrorCategory::DryRun,
            TidemarkError::SchemaError(_) | TidemarkError::RebuildFailed(_) => ErrorCategory::Schema,
            TidemarkError::DatabaseError(_) => ErrorCategory::Database,
            TidemarkError::IoError(_) => ErrorCategory::Io,
        }
    }

    /// Process exit code: 2 config, 3 discovery, lock or migration state, 4 schema.
    /// Interrupts and everything else exit 1.
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Config => 2,
            ErrorCategory::Discovery
            | ErrorCategory::Lock
            | ErrorCategory::Execution
            | ErrorCategory::Integrity
            | ErrorCategory::DryRun => match self {
                TidemarkError::Interrupted { .. } => 1,
                _ => 3,
            },
            ErrorCategory::Schema => 4,
            ErrorCategory::Database | ErrorCategory::Io => 1,
        }
    }

    /// Contextual key/value data attached to the error.
    pub fn context(&self) -> BTreeMap<String, String> {
        let mut ctx = BTreeMap::new();
        match self {
            TidemarkError::HookCycle { phase, hooks } => {
                ctx.insert("phase".into(), phase.clone());
                ctx.insert("hooks".into(), hooks.join(","));
            }
            TidemarkError::DuplicateVersions(map) => {
                for (version, paths) in map {
                    let files: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
                    ctx.insert(format!("version.{}", version), files.join(","));
                }
            }
            TidemarkError::OrphanedFiles(files) => {
                ctx.insert("files".into(), files.join(","));
            }
            TidemarkError::InvalidStrategyHeader { path, value } => {
                ctx.insert("path".into(), path.clone());
                ctx.insert("value".into(), value.clone());
            }
            TidemarkError::LockTimeout { lock_id, timeout_secs } => {
                ctx.insert("lock_id".into(), lock_id.to_string());
                ctx.insert("timeout_secs".into(), timeout_secs.to_string());
            }
            TidemarkError::MigrationFailed {
                version,
                name,
                applied_before,
                non_transactional,
                ..
            } => {
                ctx.insert("version".into(), version.clone());
                ctx.insert("name".into(), name.clone());
                ctx.insert("applied_before".into(), applied_before.join(","));
                ctx.insert("non_transactional".into(), non_transactional.to_string());
            }
            TidemarkError::RollbackFailed {
                version,
                name,
                non_transactional,
                ..
            } => {
                ctx.insert("version".into(), version.clone());
                ctx.insert("name".into(), name.clone());
                ctx.insert("non_transactional".into(), non_transactional.to_string());
            }
            TidemarkError::HookFailed { phase, hook, .. } => {
                ctx.insert("phase".into(), phase.clone());
                ctx.insert("hook".into(), hook.clone());
            }
            TidemarkError::AlreadyApplied(v)
            | TidemarkError::NotApplied(v)
            | TidemarkError::VersionNotFound(v) => {
                ctx.insert("version".into(), v.clone());
            }
            TidemarkError::ChecksumMismatch {
                version,
                expected,
                found,
            } => {
                ctx.insert("version".into(), version.clone());
                ctx.insert("expected".into(), expected.clone());
                ctx.insert("found".into(), found.clone());
            }
            TidemarkError::DryRunFailed { version, name, .. } => {
                ctx.insert("version".into(), version.clone());
                ctx.insert("name".into(), name.clone());
            }
            TidemarkError::Interrupted {
                version,
                manual_cleanup,
            } => {
                ctx.insert("version".into(), version.clone());
                ctx.insert("manual_cleanup".into(), manual_cleanup.to_string());
            }
            TidemarkError::DatabaseError(e) => {
                if let Some(db_err) = e.as_db_error() {
                    ctx.insert("sqlstate".into(), db_err.code().code().to_string());
                }
            }
            _ => {}
        }
        ctx
    }

    /// Suggested next step for the operator, when one is known.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            TidemarkError::ConfigError(_) => {
                Some("Check tidemark.toml or set the TIDEMARK_DATABASE_URL environment variable.")
            }
            TidemarkError::HookConfigError(_) | TidemarkError::HookCycle { .. } => {
                Some("Fix the hook ids and depends_on entries so every phase forms an acyclic graph.")
            }
            TidemarkError::DatabaseError(_) => {
                Some("Verify the database is running and the connection details are correct.")
            }
            TidemarkError::DuplicateVersions(_) => {
                Some("Renumber or remove one of the conflicting migration files.")
            }
            TidemarkError::OrphanedFiles(_) => {
                Some("Name migrations <version>_<name>.up.sql with a matching .down.sql, or register the code migration.")
            }
            TidemarkError::InvalidStrategyHeader { .. } => {
                Some("Use '-- Strategy: incremental', 'rebuild' or 'non-transactional'.")
            }
            TidemarkError::LockTimeout { .. } => {
                Some("Another migration run holds the lock. Retry once it finishes.")
            }
            TidemarkError::MigrationFailed {
                non_transactional: true,
                ..
            }
            | TidemarkError::RollbackFailed {
                non_transactional: true,
                ..
            } => Some("The migration ran outside a transaction. Inspect the database and clean up manually."),
            TidemarkError::MigrationFailed { .. } => {
                Some("Fix the migration and run 'tidemark migrate up' again. Earlier versions stay applied.")
            }
            TidemarkError::Interrupted {
                manual_cleanup: true,
                ..
            } => Some("The interrupted migration was non-transactional. Inspect the database and clean up manually."),
            TidemarkError::AlreadyApplied(_) => Some("Roll the version back first, or pass --force."),
            TidemarkError::VersionNotFound(_) => {
                Some("Run 'tidemark migrate status' to list the versions present on disk.")
            }
            TidemarkError::ChecksumMismatch { .. } => {
                Some("Restore the original migration file, or re-baseline with 'tidemark migrate reinit'.")
            }
            TidemarkError::SchemaError(_) | TidemarkError::RebuildFailed(_) => {
                Some("Check the schema source directory and the live database schema.")
            }
            _ => None,
        }
    }

    pub fn to_report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code(),
            category: self.category(),
            message: reason_of(self),
            context: self.context(),
            hint: self.hint(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.to_report()).unwrap_or_else(|_| {
            serde_json::json!({ "code": self.code(), "message": self.to_string() })
        })
    }
}

pub type Result<T> = std::result::Result<T, TidemarkError>;
