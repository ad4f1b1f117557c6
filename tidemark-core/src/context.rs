use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// The command a run was started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    MigrateUp,
    MigrateDown,
    DryRun,
    Validate,
    Status,
    Baseline,
    Reinit,
    Rebuild,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::MigrateUp => "migrate_up",
            Operation::MigrateDown => "migrate_down",
            Operation::DryRun => "dry_run",
            Operation::Validate => "validate",
            Operation::Status => "status",
            Operation::Baseline => "baseline",
            Operation::Reinit => "reinit",
            Operation::Rebuild => "rebuild",
        };
        f.write_str(s)
    }
}

/// Per-invocation context, created by the facade and passed down explicitly.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub run_id: String,
    pub operation: Operation,
    pub started_at: DateTime<Utc>,
    pub force: bool,
    pub dry_run: bool,
}

impl RunContext {
    pub fn new(operation: Operation) -> Self {
        let started_at = Utc::now();
        Self {
            run_id: format!("{}-{:08x}", started_at.format("%Y%m%d%H%M%S"), fastrand::u32(..)),
            operation,
            started_at,
            force: false,
            dry_run: operation == Operation::DryRun,
        }
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}
