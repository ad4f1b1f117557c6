//! Applies or rolls back one migration at a time.
//!
//! A transactional step runs as
//! `BEGIN; SAVEPOINT; hooks + DDL + bookkeeping; RELEASE; cleanup; COMMIT`.
//! Any failure rolls back to the savepoint, runs the `error` hooks and commits
//! what is left, so versions committed earlier in the run are never touched.
//! Non-transactional steps run directly on the connection and cannot be
//! undone automatically.

use std::time::Instant;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_postgres::Client;

use crate::builder::{split_statements, strip_transaction_control};
use crate::context::RunContext;
use crate::db;
use crate::error::{reason_of, Result, TidemarkError};
use crate::history::{NewRecord, VersionStore};
use crate::hooks::{Direction, HookContext, HookOrchestrator, HookPhase, HookPlan, HookResult};
use crate::migration::{MigrationDefinition, MigrationKind, Strategy};

/// What happened to one migration in one direction.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub version: String,
    pub name: String,
    pub kind: &'static str,
    pub direction: Direction,
    pub strategy: Strategy,
    pub transactional: bool,
    pub execution_time_ms: i32,
    pub hooks: Vec<HookResult>,
    pub warnings: Vec<String>,
}

impl StepReport {
    fn new(definition: &MigrationDefinition, direction: Direction) -> Self {
        Self {
            version: definition.version.to_string(),
            name: definition.name.clone(),
            kind: definition.kind.label(),
            direction,
            strategy: definition.strategy,
            transactional: definition.transactional,
            execution_time_ms: 0,
            hooks: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// Ctrl-C listener for a whole run.
///
/// Installed once before a run starts so an interrupt that arrives between
/// steps is latched and stops the next step from starting.
pub struct InterruptSignal {
    rx: watch::Receiver<bool>,
    listener: Option<JoinHandle<()>>,
}

impl InterruptSignal {
    pub fn listen() -> Self {
        let (tx, rx) = watch::channel(false);
        let listener = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received");
                let _ = tx.send(true);
            }
        });
        Self {
            rx,
            listener: Some(listener),
        }
    }

    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once an interrupt has been received.
    async fn received(&self) {
        if self.is_set() {
            return;
        }
        let mut rx = self.rx.clone();
        if rx.wait_for(|set| *set).await.is_err() {
            // Listener gone without an interrupt.
            std::future::pending::<()>().await;
        }
    }
}

impl Drop for InterruptSignal {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

pub struct ExecutionEngine<'a> {
    store: VersionStore<'a>,
    hooks: &'a HookOrchestrator,
    run: RunContext,
    interrupt: &'a InterruptSignal,
}

impl<'a> ExecutionEngine<'a> {
    pub fn new(
        store: VersionStore<'a>,
        hooks: &'a HookOrchestrator,
        run: RunContext,
        interrupt: &'a InterruptSignal,
    ) -> Self {
        Self {
            store,
            hooks,
            run,
            interrupt,
        }
    }

    pub fn store(&self) -> &VersionStore<'a> {
        &self.store
    }

    pub fn run_context(&self) -> &RunContext {
        &self.run
    }

    fn client(&self) -> &'a Client {
        self.store.client()
    }

    /// Apply a migration and record it. `applied_before` lists versions
    /// committed earlier in this run, for the failure report.
    pub async fn apply(
        &self,
        definition: &MigrationDefinition,
        applied_before: &[String],
    ) -> Result<StepReport> {
        self.step(definition, Direction::Forward, applied_before).await
    }

    /// Run the backward change and remove the tracking record.
    pub async fn rollback(&self, definition: &MigrationDefinition) -> Result<StepReport> {
        self.step(definition, Direction::Backward, &[]).await
    }

    async fn step(
        &self,
        definition: &MigrationDefinition,
        direction: Direction,
        applied_before: &[String],
    ) -> Result<StepReport> {
        if self.interrupt.is_set() {
            tracing::warn!(version = %definition.version, "Interrupted before the step started");
            return Err(TidemarkError::Interrupted {
                version: definition.version.to_string(),
                manual_cleanup: false,
            });
        }

        // Resolve every phase before anything runs.
        let plan = self.hooks.plan(definition, direction)?;

        tracing::info!(
            version = %definition.version,
            name = %definition.name,
            direction = %direction,
            transactional = definition.transactional,
            run_id = %self.run.run_id,
            "Running migration step"
        );

        tokio::select! {
            result = self.step_inner(definition, direction, &plan, applied_before) => result,
            () = self.interrupt.received() => Err(self.interrupted(definition).await),
        }
    }

    async fn step_inner(
        &self,
        definition: &MigrationDefinition,
        direction: Direction,
        plan: &HookPlan,
        applied_before: &[String],
    ) -> Result<StepReport> {
        if definition.transactional {
            self.step_in_savepoint(definition, direction, plan, applied_before)
                .await
        } else {
            self.step_direct(definition, direction, plan, applied_before)
                .await
        }
    }

    async fn step_in_savepoint(
        &self,
        definition: &MigrationDefinition,
        direction: Direction,
        plan: &HookPlan,
        applied_before: &[String],
    ) -> Result<StepReport> {
        let client = self.client();
        let savepoint = db::savepoint_name(definition.version.as_str());
        let mut ctx = HookContext::new(&self.run, definition, direction);
        let mut report = StepReport::new(definition, direction);

        db::begin(client).await?;
        if let Err(e) = db::savepoint(client, &savepoint).await {
            db::rollback_quietly(client).await;
            return Err(e);
        }

        if let Err(e) = self.main_phases(definition, direction, plan, &mut ctx, &mut report).await {
            if let Err(rb) = db::rollback_to_savepoint(client, &savepoint).await {
                tracing::warn!(error = %reason_of(&rb), "Failed to roll back to savepoint");
                db::rollback_quietly(client).await;
                return Err(self.failure(definition, direction, e, applied_before));
            }
            ctx.stats.insert("error".to_string(), serde_json::Value::from(reason_of(&e)));
            self.hooks.run_error_phase(client, plan, &mut ctx).await;
            if db::commit(client).await.is_err() {
                db::rollback_quietly(client).await;
            }
            tracing::error!(
                version = %definition.version,
                reason = %reason_of(&e),
                "Migration step failed and was rolled back"
            );
            return Err(self.failure(definition, direction, e, applied_before));
        }

        let finish = async {
            db::release_savepoint(client, &savepoint).await?;
            report.hooks.extend(
                self.hooks
                    .run_phase(client, plan, HookPhase::Cleanup, &mut ctx)
                    .await?,
            );
            db::commit(client).await
        };
        if let Err(e) = finish.await {
            // The savepoint is gone; the whole transaction only holds this step.
            db::rollback_quietly(client).await;
            ctx.stats.insert("error".to_string(), serde_json::Value::from(reason_of(&e)));
            self.hooks.run_error_phase(client, plan, &mut ctx).await;
            return Err(self.failure(definition, direction, e, applied_before));
        }

        Ok(report)
    }

    async fn step_direct(
        &self,
        definition: &MigrationDefinition,
        direction: Direction,
        plan: &HookPlan,
        applied_before: &[String],
    ) -> Result<StepReport> {
        let client = self.client();
        let mut ctx = HookContext::new(&self.run, definition, direction);
        let mut report = StepReport::new(definition, direction);

        if let Err(e) = self.main_phases(definition, direction, plan, &mut ctx, &mut report).await {
            ctx.stats.insert("error".to_string(), serde_json::Value::from(reason_of(&e)));
            self.hooks.run_error_phase(client, plan, &mut ctx).await;
            tracing::warn!(
                version = %definition.version,
                name = %definition.name,
                reason = %reason_of(&e),
                "Non-transactional migration failed; rollback is not automatic and the database may need manual cleanup"
            );
            return Err(self.failure(definition, direction, e, applied_before));
        }

        match self
            .hooks
            .run_phase(client, plan, HookPhase::Cleanup, &mut ctx)
            .await
        {
            Ok(results) => report.hooks.extend(results),
            Err(e) => {
                tracing::warn!(version = %definition.version, error = %reason_of(&e), "Cleanup hook failed");
                report.warnings.push(format!("Cleanup hook failed: {}", reason_of(&e)));
            }
        }

        Ok(report)
    }

    /// Validation and DDL hooks, the change itself, then bookkeeping.
    async fn main_phases(
        &self,
        definition: &MigrationDefinition,
        direction: Direction,
        plan: &HookPlan,
        ctx: &mut HookContext,
        report: &mut StepReport,
    ) -> Result<()> {
        let client = self.client();
        for phase in [HookPhase::BeforeValidation, HookPhase::BeforeDdl] {
            report.hooks.extend(self.hooks.run_phase(client, plan, phase, ctx).await?);
        }

        let start = Instant::now();
        execute_body(client, definition, direction, &mut report.warnings).await?;
        report.execution_time_ms = start.elapsed().as_millis() as i32;

        for phase in [HookPhase::AfterDdl, HookPhase::AfterValidation] {
            report.hooks.extend(self.hooks.run_phase(client, plan, phase, ctx).await?);
        }

        match direction {
            Direction::Forward => {
                let record = NewRecord {
                    version: definition.version.as_str(),
                    name: &definition.name,
                    checksum: &definition.checksum,
                    execution_time_ms: report.execution_time_ms,
                };
                if self.run.force {
                    self.store.upsert_applied(&record).await
                } else {
                    self.store.record_applied(&record).await
                }
            }
            Direction::Backward => {
                if self.store.remove_applied(definition.version.as_str()).await? {
                    Ok(())
                } else {
                    Err(TidemarkError::NotApplied(definition.version.to_string()))
                }
            }
        }
    }

    fn failure(
        &self,
        definition: &MigrationDefinition,
        direction: Direction,
        error: TidemarkError,
        applied_before: &[String],
    ) -> TidemarkError {
        let reason = reason_of(&error);
        let non_transactional = !definition.transactional;
        match direction {
            Direction::Forward => TidemarkError::MigrationFailed {
                version: definition.version.to_string(),
                name: definition.name.clone(),
                reason,
                applied_before: applied_before.to_vec(),
                non_transactional,
            },
            Direction::Backward => TidemarkError::RollbackFailed {
                version: definition.version.to_string(),
                name: definition.name.clone(),
                reason,
                non_transactional,
            },
        }
    }

    async fn interrupted(&self, definition: &MigrationDefinition) -> TidemarkError {
        if definition.transactional {
            tracing::warn!(version = %definition.version, "Interrupted; rolling back the open transaction");
            db::rollback_quietly(self.client()).await;
        } else {
            tracing::warn!(
                version = %definition.version,
                "Interrupted during a non-transactional migration; manual cleanup is required"
            );
        }
        TidemarkError::Interrupted {
            version: definition.version.to_string(),
            manual_cleanup: !definition.transactional,
        }
    }
}

/// Run the forward or backward body of a migration on `client`.
///
/// Top-level transaction control is removed from SQL bodies. Non-transactional
/// SQL is sent one statement at a time so the server does not wrap it in an
/// implicit transaction.
pub(crate) async fn execute_body(
    client: &Client,
    definition: &MigrationDefinition,
    direction: Direction,
    warnings: &mut Vec<String>,
) -> Result<()> {
    match &definition.kind {
        MigrationKind::Code(migration) => match direction {
            Direction::Forward => migration.up(client).await,
            Direction::Backward => migration.down(client).await,
        },
        MigrationKind::SqlPair { up_sql, down_sql } => {
            let body = match direction {
                Direction::Forward => up_sql,
                Direction::Backward => down_sql,
            };
            let (sql, stripped) = strip_transaction_control(body);
            if stripped {
                tracing::warn!(
                    version = %definition.version,
                    "Removed BEGIN/COMMIT from migration body; the engine manages the transaction"
                );
                warnings.push(format!(
                    "Removed transaction control statements from {} ({})",
                    definition.label(),
                    direction
                ));
            }
            if definition.transactional {
                client.batch_execute(&sql).await?;
            } else {
                for statement in split_statements(&sql) {
                    client.batch_execute(&statement).await?;
                }
            }
            Ok(())
        }
    }
}
