//! Lifecycle hooks and their priority/dependency ordering.
//!
//! Hooks run in six phases around each migration step:
//! `before_validation → before_ddl → (DDL) → after_ddl → after_validation → cleanup`,
//! with `error` run when any step fails. Within a phase the order is a
//! topological sort of `depends_on` edges, ties broken by priority and then
//! registration order. The whole plan is resolved before the first hook runs.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tokio_postgres::Client;

use crate::config::HookConfig;
use crate::context::RunContext;
use crate::db;
use crate::error::{reason_of, Result, TidemarkError};
use crate::migration::MigrationDefinition;

/// The phase at which a hook runs, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    BeforeValidation,
    BeforeDdl,
    AfterDdl,
    AfterValidation,
    Cleanup,
    Error,
}

impl HookPhase {
    pub const ALL: [HookPhase; 6] = [
        HookPhase::BeforeValidation,
        HookPhase::BeforeDdl,
        HookPhase::AfterDdl,
        HookPhase::AfterValidation,
        HookPhase::Cleanup,
        HookPhase::Error,
    ];
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HookPhase::BeforeValidation => "before_validation",
            HookPhase::BeforeDdl => "before_ddl",
            HookPhase::AfterDdl => "after_ddl",
            HookPhase::AfterValidation => "after_validation",
            HookPhase::Cleanup => "cleanup",
            HookPhase::Error => "error",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for HookPhase {
    type Err = TidemarkError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "before_validation" => Ok(HookPhase::BeforeValidation),
            "before_ddl" => Ok(HookPhase::BeforeDdl),
            "after_ddl" => Ok(HookPhase::AfterDdl),
            "after_validation" => Ok(HookPhase::AfterValidation),
            "cleanup" => Ok(HookPhase::Cleanup),
            "error" | "on_error" => Ok(HookPhase::Error),
            other => Err(TidemarkError::HookConfigError(format!(
                "Unknown hook phase '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "forward"),
            Direction::Backward => write!(f, "backward"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookDescriptor {
    pub id: String,
    pub name: String,
    /// 1..=10, lower runs first.
    pub priority: u8,
    pub depends_on: Vec<String>,
    pub phase: HookPhase,
}

impl HookDescriptor {
    pub fn new(id: &str, phase: HookPhase) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            priority: 5,
            depends_on: Vec::new(),
            phase,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// State handed to every hook of a migration step.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub run: RunContext,
    pub version: String,
    pub name: String,
    pub direction: Direction,
    /// Shared across the hooks of one migration step.
    pub stats: BTreeMap<String, serde_json::Value>,
}

impl HookContext {
    pub fn new(run: &RunContext, definition: &MigrationDefinition, direction: Direction) -> Self {
        Self {
            run: run.clone(),
            version: definition.version.to_string(),
            name: definition.name.clone(),
            direction,
            stats: BTreeMap::new(),
        }
    }
}

/// What a hook reports back.
#[derive(Debug, Clone, Default)]
pub struct HookOutcome {
    pub rows_affected: u64,
    pub stats: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HookResult {
    pub phase: HookPhase,
    pub hook_id: String,
    pub hook_name: String,
    pub rows_affected: u64,
    pub stats: BTreeMap<String, serde_json::Value>,
    pub execution_time_ms: i64,
}

/// A unit of work attached to a lifecycle phase.
///
/// Hooks run on the engine's connection, inside its transaction.
#[async_trait]
pub trait Hook: Send + Sync {
    fn descriptor(&self) -> &HookDescriptor;

    /// Whether the hook takes part in a step for this version and direction.
    fn applies_to(&self, _version: &str, _direction: Direction) -> bool {
        true
    }

    async fn execute(&self, client: &Client, ctx: &mut HookContext) -> Result<HookOutcome>;
}

/// A hook backed by a SQL file declared in configuration.
#[derive(Debug, Clone)]
pub struct SqlHook {
    descriptor: HookDescriptor,
    sql: String,
    source: PathBuf,
    versions: Vec<String>,
    directions: Vec<Direction>,
}

impl SqlHook {
    pub fn new(descriptor: HookDescriptor, sql: impl Into<String>) -> Self {
        Self {
            descriptor,
            sql: sql.into(),
            source: PathBuf::new(),
            versions: Vec::new(),
            directions: vec![Direction::Forward],
        }
    }

    pub fn from_config(config: &HookConfig) -> Result<Self> {
        let phase: HookPhase = config.phase.parse()?;
        let sql = std::fs::read_to_string(&config.file).map_err(|e| {
            TidemarkError::HookConfigError(format!(
                "Failed to read hook file '{}': {}",
                config.file.display(),
                e
            ))
        })?;
        let directions = match config.direction.to_lowercase().as_str() {
            "forward" => vec![Direction::Forward],
            "backward" => vec![Direction::Backward],
            "both" => vec![Direction::Forward, Direction::Backward],
            other => {
                return Err(TidemarkError::HookConfigError(format!(
                    "Hook '{}' has unknown direction '{}'",
                    config.id, other
                )))
            }
        };

        Ok(Self {
            descriptor: HookDescriptor {
                id: config.id.clone(),
                name: config.name.clone().unwrap_or_else(|| config.id.clone()),
                priority: config.priority,
                depends_on: config.depends_on.clone(),
                phase,
            },
            sql,
            source: config.file.clone(),
            versions: config.versions.clone(),
            directions,
        })
    }
}

#[async_trait]
impl Hook for SqlHook {
    fn descriptor(&self) -> &HookDescriptor {
        &self.descriptor
    }

    fn applies_to(&self, version: &str, direction: Direction) -> bool {
        self.directions.contains(&direction)
            && (self.versions.is_empty() || self.versions.iter().any(|v| v == version))
    }

    async fn execute(&self, client: &Client, _ctx: &mut HookContext) -> Result<HookOutcome> {
        tracing::debug!(hook = %self.descriptor.id, source = %self.source.display(), "Executing SQL hook");
        let rows_affected = db::execute_counting(client, &self.sql).await?;
        Ok(HookOutcome {
            rows_affected,
            stats: BTreeMap::new(),
        })
    }
}

/// Order one phase's hooks. Returns indices into `descriptors`.
///
/// Edges come from `depends_on` entries that name hooks in the same phase.
/// `satisfied` holds ids from earlier phases, which impose no ordering here.
pub fn resolve_phase_order(
    phase: HookPhase,
    descriptors: &[&HookDescriptor],
    satisfied: &[&str],
) -> Result<Vec<usize>> {
    let index: HashMap<&str, usize> = descriptors
        .iter()
        .enumerate()
        .map(|(i, d)| (d.id.as_str(), i))
        .collect();

    let mut indegree = vec![0usize; descriptors.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); descriptors.len()];

    for (i, d) in descriptors.iter().enumerate() {
        for dep in &d.depends_on {
            match index.get(dep.as_str()) {
                Some(&j) => {
                    dependents[j].push(i);
                    indegree[i] += 1;
                }
                None if satisfied.contains(&dep.as_str()) => {}
                None => {
                    return Err(TidemarkError::HookConfigError(format!(
                        "Hook '{}' in phase {} depends on '{}', which does not run before it",
                        d.id, phase, dep
                    )))
                }
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<(u8, usize)>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(i, _)| Reverse((descriptors[i].priority, i)))
        .collect();

    let mut order = Vec::with_capacity(descriptors.len());
    while let Some(Reverse((_, i))) = ready.pop() {
        order.push(i);
        for &next in &dependents[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(Reverse((descriptors[next].priority, next)));
            }
        }
    }

    if order.len() < descriptors.len() {
        let mut stuck: Vec<String> = indegree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| descriptors[i].id.clone())
            .collect();
        stuck.sort();
        return Err(TidemarkError::HookCycle {
            phase: phase.to_string(),
            hooks: stuck,
        });
    }

    Ok(order)
}

/// Resolved execution order for every phase of one migration step.
#[derive(Default, Clone)]
pub struct HookPlan {
    phases: BTreeMap<HookPhase, Vec<Arc<dyn Hook>>>,
}

impl HookPlan {
    pub fn hooks(&self, phase: HookPhase) -> &[Arc<dyn Hook>] {
        self.phases.get(&phase).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn ids(&self, phase: HookPhase) -> Vec<String> {
        self.hooks(phase)
            .iter()
            .map(|h| h.descriptor().id.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.values().all(Vec::is_empty)
    }
}

/// Resolves and runs hooks for migration steps.
#[derive(Clone, Default)]
pub struct HookOrchestrator {
    global: Vec<Arc<dyn Hook>>,
}

impl HookOrchestrator {
    pub fn new(global: Vec<Arc<dyn Hook>>) -> Self {
        Self { global }
    }

    /// Load `[[hooks]]` entries from configuration.
    pub fn from_config(configs: &[HookConfig]) -> Result<Self> {
        let mut global: Vec<Arc<dyn Hook>> = Vec::with_capacity(configs.len());
        for config in configs {
            global.push(Arc::new(SqlHook::from_config(config)?));
        }
        Ok(Self { global })
    }

    pub fn register(&mut self, hook: Arc<dyn Hook>) {
        self.global.push(hook);
    }

    /// Validate and order every hook that applies to this step.
    ///
    /// Fails on duplicate ids, out-of-range priorities, unknown or
    /// later-phase dependencies, and cycles. Nothing has run when it fails.
    pub fn plan(&self, definition: &MigrationDefinition, direction: Direction) -> Result<HookPlan> {
        let mut hooks: Vec<Arc<dyn Hook>> = self
            .global
            .iter()
            .filter(|h| h.applies_to(definition.version.as_str(), direction))
            .cloned()
            .collect();
        hooks.extend(
            definition
                .declared_hooks()
                .into_iter()
                .filter(|h| h.applies_to(definition.version.as_str(), direction)),
        );
        build_plan(hooks)
    }

    /// Run one phase sequentially. The first failure aborts the phase.
    pub async fn run_phase(
        &self,
        client: &Client,
        plan: &HookPlan,
        phase: HookPhase,
        ctx: &mut HookContext,
    ) -> Result<Vec<HookResult>> {
        let mut results = Vec::new();
        for hook in plan.hooks(phase) {
            let descriptor = hook.descriptor();
            tracing::info!(
                phase = %phase,
                hook = %descriptor.id,
                version = %ctx.version,
                direction = %ctx.direction,
                "Running hook"
            );
            let start = Instant::now();
            let outcome = hook.execute(client, ctx).await.map_err(|e| TidemarkError::HookFailed {
                phase: phase.to_string(),
                hook: descriptor.id.clone(),
                reason: reason_of(&e),
            })?;
            ctx.stats.insert(
                format!("{}.rows_affected", descriptor.id),
                serde_json::Value::from(outcome.rows_affected),
            );
            results.push(HookResult {
                phase,
                hook_id: descriptor.id.clone(),
                hook_name: descriptor.name.clone(),
                rows_affected: outcome.rows_affected,
                stats: outcome.stats,
                execution_time_ms: start.elapsed().as_millis() as i64,
            });
        }
        Ok(results)
    }

    /// Run the `error` phase. Failures are logged; the original error wins.
    pub async fn run_error_phase(&self, client: &Client, plan: &HookPlan, ctx: &mut HookContext) {
        for hook in plan.hooks(HookPhase::Error) {
            let id = &hook.descriptor().id;
            tracing::info!(hook = %id, version = %ctx.version, "Running error hook");
            if let Err(e) = hook.execute(client, ctx).await {
                tracing::warn!(hook = %id, error = %reason_of(&e), "Error hook failed");
            }
        }
    }
}

fn build_plan(hooks: Vec<Arc<dyn Hook>>) -> Result<HookPlan> {
    let mut seen: HashMap<&str, HookPhase> = HashMap::new();
    for hook in &hooks {
        let d = hook.descriptor();
        if !(1..=10).contains(&d.priority) {
            return Err(TidemarkError::HookConfigError(format!(
                "Hook '{}' has priority {}; priorities must be between 1 and 10",
                d.id, d.priority
            )));
        }
        if seen.insert(d.id.as_str(), d.phase).is_some() {
            return Err(TidemarkError::HookConfigError(format!(
                "Hook id '{}' is declared more than once",
                d.id
            )));
        }
    }

    let mut plan = HookPlan::default();
    for phase in HookPhase::ALL {
        let in_phase: Vec<&Arc<dyn Hook>> =
            hooks.iter().filter(|h| h.descriptor().phase == phase).collect();
        let descriptors: Vec<&HookDescriptor> = in_phase.iter().map(|h| h.descriptor()).collect();
        let satisfied: Vec<&str> = seen
            .iter()
            .filter(|(_, p)| **p < phase)
            .map(|(id, _)| *id)
            .collect();
        let order = resolve_phase_order(phase, &descriptors, &satisfied)?;
        plan.phases
            .insert(phase, order.into_iter().map(|i| in_phase[i].clone()).collect());
    }
    Ok(plan)
}
