//! Run migrations inside a transaction that is always rolled back.

use std::collections::HashSet;
use std::time::Instant;

use serde::Serialize;
use tokio_postgres::Client;

use crate::context::RunContext;
use crate::db;
use crate::engine::execute_body;
use crate::error::{reason_of, Result, TidemarkError};
use crate::hooks::{Direction, HookContext, HookOrchestrator, HookPhase, HookPlan, HookResult};
use crate::migration::MigrationDefinition;

pub const CONFIDENCE_PERCENT: u8 = 85;
/// Width of the estimate band, in percent of the measured time.
const CONFIDENCE_BAND_PERCENT: i64 = 15;

const TRANSACTION_ENDED: &str =
    "the migration ended the dry-run transaction; its changes may have been committed";

/// A relation lock held by this session after a migration ran.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LockedTable {
    pub schema: String,
    pub table: String,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRunRecord {
    pub version: String,
    pub name: String,
    pub success: bool,
    pub execution_time_ms: i64,
    /// Measured time minus and plus the confidence band.
    pub estimated_production_range_ms: (i64, i64),
    pub confidence_percent: u8,
    pub locked_tables: Vec<LockedTable>,
    pub warnings: Vec<String>,
    pub hooks: Vec<HookResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub run_id: String,
    pub records: Vec<DryRunRecord>,
    pub total_execution_time_ms: i64,
}

/// Production time estimate for a measured duration.
pub fn estimate_range(measured_ms: i64) -> (i64, i64) {
    let low = measured_ms * (100 - CONFIDENCE_BAND_PERCENT) / 100;
    let high = (measured_ms * (100 + CONFIDENCE_BAND_PERCENT) + 99) / 100;
    (low, high)
}

pub struct DryRunSimulator<'a> {
    client: &'a Client,
    hooks: &'a HookOrchestrator,
    run: RunContext,
}

impl<'a> DryRunSimulator<'a> {
    pub fn new(client: &'a Client, hooks: &'a HookOrchestrator, run: RunContext) -> Self {
        Self {
            client,
            hooks,
            run: run.with_dry_run(true),
        }
    }

    /// Simulate a single migration.
    pub async fn run(&self, definition: &MigrationDefinition) -> Result<DryRunRecord> {
        let mut report = self.run_batch(std::slice::from_ref(definition)).await?;
        report.records.pop().ok_or_else(|| TidemarkError::DryRunFailed {
            version: definition.version.to_string(),
            name: definition.name.clone(),
            reason: "simulation produced no result".to_string(),
        })
    }

    /// Simulate migrations in order inside one transaction, then roll it back.
    ///
    /// The first failure stops the batch. The rollback happens either way.
    pub async fn run_batch(&self, definitions: &[MigrationDefinition]) -> Result<DryRunReport> {
        let mut plans = Vec::with_capacity(definitions.len());
        for definition in definitions {
            if !definition.transactional {
                return Err(TidemarkError::DryRunFailed {
                    version: definition.version.to_string(),
                    name: definition.name.clone(),
                    reason: "non-transactional migrations cannot run inside a rolled-back transaction"
                        .to_string(),
                });
            }
            plans.push(self.hooks.plan(definition, Direction::Forward)?);
        }

        let start = Instant::now();
        db::begin(self.client).await?;

        let mut records = Vec::with_capacity(definitions.len());
        let mut outcome = Ok(());
        match self.setup().await {
            Ok((xid, existing)) => {
                for (definition, plan) in definitions.iter().zip(&plans) {
                    let result = match self.simulate(definition, plan, &existing).await {
                        Ok(record) => match self.transaction_id().await {
                            Ok(current) if current == xid => Ok(record),
                            Ok(_) => Err(TRANSACTION_ENDED.to_string()),
                            Err(e) => Err(reason_of(&e)),
                        },
                        Err(e) => Err(reason_of(&e)),
                    };
                    match result {
                        Ok(record) => records.push(record),
                        Err(reason) => {
                            tracing::warn!(version = %definition.version, reason = %reason, "Dry run failed");
                            outcome = Err(TidemarkError::DryRunFailed {
                                version: definition.version.to_string(),
                                name: definition.name.clone(),
                                reason,
                            });
                            break;
                        }
                    }
                }
            }
            Err(e) => outcome = Err(e),
        }

        let rolled_back = self.client.batch_execute("ROLLBACK").await;
        outcome?;
        rolled_back?;

        tracing::info!(
            migrations = records.len(),
            run_id = %self.run.run_id,
            "Dry run complete; all changes rolled back"
        );

        Ok(DryRunReport {
            run_id: self.run.run_id.clone(),
            records,
            total_execution_time_ms: start.elapsed().as_millis() as i64,
        })
    }

    async fn simulate(
        &self,
        definition: &MigrationDefinition,
        plan: &HookPlan,
        existing: &HashSet<(String, String)>,
    ) -> Result<DryRunRecord> {
        let mut ctx = HookContext::new(&self.run, definition, Direction::Forward);
        let mut warnings = Vec::new();
        let mut hooks = Vec::new();
        let locks_before: HashSet<LockedTable> = self.locked_tables().await?.into_iter().collect();

        let start = Instant::now();
        for phase in [HookPhase::BeforeValidation, HookPhase::BeforeDdl] {
            hooks.extend(self.hooks.run_phase(self.client, plan, phase, &mut ctx).await?);
        }
        execute_body(self.client, definition, Direction::Forward, &mut warnings).await?;
        for phase in [HookPhase::AfterDdl, HookPhase::AfterValidation, HookPhase::Cleanup] {
            hooks.extend(self.hooks.run_phase(self.client, plan, phase, &mut ctx).await?);
        }
        let execution_time_ms = start.elapsed().as_millis() as i64;

        let locked_tables: Vec<LockedTable> = self
            .locked_tables()
            .await?
            .into_iter()
            .filter(|l| !locks_before.contains(l))
            .collect();
        for lock in &locked_tables {
            let existed = existing.contains(&(lock.schema.clone(), lock.table.clone()));
            if lock.mode == "AccessExclusiveLock" && existed {
                warnings.push(format!(
                    "{} takes an ACCESS EXCLUSIVE lock on {}.{}; reads and writes block until it commits",
                    definition.label(),
                    lock.schema,
                    lock.table
                ));
            }
        }

        tracing::debug!(
            version = %definition.version,
            execution_time_ms = execution_time_ms,
            locks = locked_tables.len(),
            "Simulated migration"
        );

        Ok(DryRunRecord {
            version: definition.version.to_string(),
            name: definition.name.clone(),
            success: true,
            execution_time_ms,
            estimated_production_range_ms: estimate_range(execution_time_ms),
            confidence_percent: CONFIDENCE_PERCENT,
            locked_tables,
            warnings,
            hooks,
        })
    }

    async fn setup(&self) -> Result<(i64, HashSet<(String, String)>)> {
        let xid = self.transaction_id().await?;
        Ok((xid, self.existing_tables().await?))
    }

    /// Id of the open transaction. A different value later means a migration
    /// committed or rolled back the dry-run transaction.
    async fn transaction_id(&self) -> Result<i64> {
        let row = self.client.query_one("SELECT txid_current()", &[]).await?;
        Ok(row.get(0))
    }

    /// User tables that existed when the simulation began.
    async fn existing_tables(&self) -> Result<HashSet<(String, String)>> {
        let rows = self
            .client
            .query(
                "SELECT n.nspname, c.relname \
                 FROM pg_catalog.pg_class c \
                 JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                 WHERE c.relkind IN ('r', 'p') \
                   AND n.nspname NOT IN ('pg_catalog', 'information_schema') \
                   AND n.nspname NOT LIKE 'pg_toast%'",
                &[],
            )
            .await?;
        Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
    }

    async fn locked_tables(&self) -> Result<Vec<LockedTable>> {
        let rows = self
            .client
            .query(
                "SELECT DISTINCT n.nspname, c.relname, l.mode \
                 FROM pg_catalog.pg_locks l \
                 JOIN pg_catalog.pg_class c ON c.oid = l.relation \
                 JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                 WHERE l.pid = pg_backend_pid() AND l.locktype = 'relation' AND l.granted \
                   AND c.relkind IN ('r', 'p') \
                   AND n.nspname NOT IN ('pg_catalog', 'information_schema') \
                 ORDER BY 1, 2, 3",
                &[],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| LockedTable {
                schema: r.get(0),
                table: r.get(1),
                mode: r.get(2),
            })
            .collect())
    }
}
