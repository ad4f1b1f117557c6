use colored::Colorize;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, ContentArrangement, Table};

use tidemark_core::engine::StepReport;
use tidemark_core::{
    BaselineReport, DryRunReport, MigrateReport, MigrationState, RebuildReport, ReinitReport,
    RollbackReport, StatusReport, ValidateReport,
};

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.into_iter().map(Cell::new).collect::<Vec<_>>());
    table
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        println!("{} {}", "WARNING:".yellow().bold(), warning);
    }
}

/// Format migration status as a colored table.
pub fn print_status(report: &StatusReport) {
    if !report.tracking_table_exists {
        println!("{}", "Tracking table does not exist yet.".dimmed());
    }

    if report.migrations.is_empty() {
        println!("{}", "No migrations found.".yellow());
    } else {
        let mut table = new_table(vec![
            "Version",
            "Name",
            "Kind",
            "Strategy",
            "State",
            "Applied At",
            "Execution Time",
        ]);

        for status in &report.migrations {
            let applied_at = status
                .applied_at
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            let exec_time = status
                .execution_time_ms
                .map(|t| format!("{}ms", t))
                .unwrap_or_default();
            let strategy = status.strategy.map(|s| s.to_string()).unwrap_or_default();

            table.add_row(vec![
                Cell::new(&status.version),
                Cell::new(&status.name),
                Cell::new(status.kind.unwrap_or("")),
                Cell::new(&strategy),
                Cell::new(format_state(status.state)),
                Cell::new(&applied_at),
                Cell::new(&exec_time),
            ]);
        }

        println!("{table}");
    }

    println!(
        "{} applied, {} pending",
        report.applied_count.to_string().green(),
        report.pending_count.to_string().yellow()
    );

    for (version, paths) in &report.duplicates {
        let files: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
        println!(
            "{} version {} is claimed by {}",
            "DUPLICATE:".red().bold(),
            version,
            files.join(", ")
        );
    }
    for orphan in &report.orphans {
        println!("{} {} ({})", "ORPHAN:".red().bold(), orphan.path.display(), orphan.reason);
    }
    for header in &report.invalid_headers {
        println!(
            "{} {}: unrecognized strategy '{}'",
            "HEADER:".red().bold(),
            header.path.display(),
            header.value
        );
    }

    if report.rebuild_recommended {
        println!("{}", "Rebuild recommended:".cyan().bold());
        for reason in &report.rebuild_reasons {
            println!("  {} {}", "→".cyan(), reason);
        }
    }
}

fn format_state(state: MigrationState) -> String {
    match state {
        MigrationState::Applied => state.to_string().green().to_string(),
        MigrationState::Pending => state.to_string().yellow().to_string(),
        MigrationState::ChecksumMismatch => state.to_string().red().bold().to_string(),
        MigrationState::Missing => state.to_string().red().to_string(),
    }
}

fn print_steps(steps: &[StepReport], marker: &str) {
    for step in steps {
        let mode = if step.transactional { "" } else { " [non-transactional]" };
        println!(
            "  {} {} {} ({}ms){}",
            marker,
            step.version,
            step.name,
            step.execution_time_ms,
            mode.dimmed()
        );
        for hook in &step.hooks {
            println!(
                "      {}",
                format!("{} {} ({}ms)", hook.phase, hook.hook_id, hook.execution_time_ms).dimmed()
            );
        }
        print_warnings(&step.warnings);
    }
}

/// Print a migration report summary.
pub fn print_migrate_summary(report: &MigrateReport) {
    if let Some(baseline) = &report.baseline {
        let kind = if baseline.exact { "exact" } else { "similar" };
        println!(
            "{}",
            format!(
                "Detected baseline {} ({} match, {:.1}% similarity); marked {} version(s)",
                baseline.snapshot_version,
                kind,
                baseline.similarity * 100.0,
                baseline.marked.len()
            )
            .cyan()
        );
    }

    print_warnings(&report.warnings);

    if report.applied.is_empty() && report.failures.is_empty() {
        println!("{}", "Schema is up to date. No migration necessary.".green());
        return;
    }

    if !report.applied.is_empty() {
        println!(
            "{}",
            format!(
                "Successfully applied {} migration(s) (execution time {}ms)",
                report.applied.len(),
                report.total_time_ms
            )
            .green()
            .bold()
        );
        print_steps(&report.applied, &"→".green().to_string());
    }

    for failure in &report.failures {
        println!(
            "  {} {} {} [{}] {}",
            "✗".red(),
            failure.version,
            failure.name,
            failure.code,
            failure.reason
        );
    }
}

pub fn print_rollback_summary(report: &RollbackReport) {
    if report.rolled_back.is_empty() {
        println!("{}", "Nothing to roll back.".green());
        return;
    }
    println!(
        "{}",
        format!(
            "Rolled back {} migration(s) (execution time {}ms)",
            report.rolled_back.len(),
            report.total_time_ms
        )
        .green()
        .bold()
    );
    print_steps(&report.rolled_back, &"←".yellow().to_string());
}

/// Print simulated timings, estimates and lock warnings.
pub fn print_dry_run(report: &DryRunReport) {
    if report.records.is_empty() {
        println!("{}", "Dry run: No pending migrations.".green());
        return;
    }

    println!(
        "{}",
        format!(
            "Dry run: {} migration(s) simulated and rolled back",
            report.records.len()
        )
        .yellow()
        .bold()
    );

    let mut table = new_table(vec!["Version", "Name", "Time", "Production Estimate", "Locks"]);
    for record in &report.records {
        let (low, high) = record.estimated_production_range_ms;
        let locks: Vec<String> = record
            .locked_tables
            .iter()
            .map(|l| format!("{}.{} ({})", l.schema, l.table, l.mode))
            .collect();
        table.add_row(vec![
            Cell::new(&record.version),
            Cell::new(&record.name),
            Cell::new(format!("{}ms", record.execution_time_ms)),
            Cell::new(format!(
                "{}-{}ms ({}% confidence)",
                low, high, record.confidence_percent
            )),
            Cell::new(locks.join("\n")),
        ]);
    }
    println!("{table}");

    for record in &report.records {
        print_warnings(&record.warnings);
    }
}

/// Print a validate report.
pub fn print_validate_result(report: &ValidateReport) {
    if report.valid {
        println!("{}", "Successfully validated all applied migrations.".green().bold());
    }

    print_warnings(&report.warnings);

    for issue in &report.issues {
        println!("{} {}", "ERROR:".red().bold(), issue);
    }
}

pub fn print_baseline_result(report: &BaselineReport) {
    if report.marked.is_empty() {
        println!(
            "{}",
            format!("Every version through {} was already recorded.", report.through).green()
        );
        return;
    }
    println!(
        "{}",
        format!(
            "Baselined through {}: marked {} version(s)",
            report.through,
            report.marked.len()
        )
        .green()
        .bold()
    );
    for version in &report.marked {
        println!("  {} {}", "✓".green(), version);
    }
}

pub fn print_reinit_result(report: &ReinitReport) {
    let through = report.through.as_deref().unwrap_or("latest");
    if report.dry_run {
        println!(
            "{}",
            format!(
                "Dry run: would remove {} tracking record(s) and mark {} version(s) through {}",
                report.records_removed,
                report.marked.len(),
                through
            )
            .yellow()
            .bold()
        );
        return;
    }
    println!(
        "{}",
        format!(
            "Reinitialized tracking: removed {} record(s), marked {} version(s) through {}",
            report.records_removed,
            report.marked.len(),
            through
        )
        .green()
        .bold()
    );
}

pub fn print_rebuild_result(report: &RebuildReport) {
    let heading = if report.dry_run {
        "Rebuild plan (dry run):".yellow().bold()
    } else {
        format!("Rebuild complete ({}ms):", report.total_execution_time_ms)
            .green()
            .bold()
    };
    println!("{}", heading);

    if !report.schemas_dropped.is_empty() {
        println!("  {} schemas dropped: {}", "✗".red(), report.schemas_dropped.join(", "));
    }
    println!("  {} DDL statements: {}", "→".green(), report.ddl_statements_executed);
    if !report.seeds_applied.is_empty() {
        println!("  {} seed files: {}", "→".green(), report.seeds_applied.len());
    }
    println!("  {} migrations marked: {}", "✓".green(), report.migrations_marked.len());
    if report.tracking_rows_backed_up > 0 {
        println!(
            "  {}",
            format!("{} previous tracking row(s) backed up", report.tracking_rows_backed_up).dimmed()
        );
    }

    print_warnings(&report.warnings);
}
