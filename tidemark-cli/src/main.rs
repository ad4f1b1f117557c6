mod output;

use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use tidemark_core::config::{CliOverrides, TidemarkConfig};
use tidemark_core::error::TidemarkError;
use tidemark_core::{MigrateOptions, RebuildOptions, RollbackTarget, Tidemark};

#[derive(Parser)]
#[command(
    name = "tidemark",
    about = "PostgreSQL migration state and execution engine",
    version = concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("GIT_HASH"), " ", env!("BUILD_TIME"), ")"
    )
)]
struct Cli {
    /// Config file path
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<String>,

    #[command(flatten)]
    overrides: OverrideArgs,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Enable verbose/debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct OverrideArgs {
    /// Database URL (overrides config)
    #[arg(long, value_name = "URL", global = true)]
    url: Option<String>,

    /// Schema holding the tracking table (overrides config)
    #[arg(long, value_name = "SCHEMA", global = true)]
    schema: Option<String>,

    /// Tracking table name (overrides config)
    #[arg(long, value_name = "TABLE", global = true)]
    table: Option<String>,

    /// Migrations directory (overrides config)
    #[arg(long, value_name = "DIR", global = true)]
    directory: Option<PathBuf>,

    /// Number of retries when connecting to the database
    #[arg(long, value_name = "N", global = true)]
    connect_retries: Option<u32>,

    /// SSL/TLS mode: disable, prefer, require
    #[arg(long, value_name = "MODE", global = true)]
    ssl_mode: Option<String>,

    /// Connection timeout in seconds (default: 30, 0 = no timeout)
    #[arg(long, value_name = "SECS", global = true)]
    connect_timeout: Option<u32>,

    /// Statement timeout in seconds (default: 0 = no limit)
    #[arg(long, value_name = "SECS", global = true)]
    statement_timeout: Option<u32>,

    /// Seconds to wait for the run lock
    #[arg(long, value_name = "SECS", global = true)]
    lock_timeout: Option<u64>,

    /// Fail instead of warn when an applied migration changed on disk
    #[arg(long, global = true)]
    strict_checksums: bool,
}

impl From<OverrideArgs> for CliOverrides {
    fn from(args: OverrideArgs) -> Self {
        CliOverrides {
            url: args.url,
            schema: args.schema,
            table: args.table,
            directory: args.directory,
            connect_retries: args.connect_retries,
            ssl_mode: args.ssl_mode,
            connect_timeout: args.connect_timeout,
            statement_timeout: args.statement_timeout,
            lock_timeout: args.lock_timeout,
            strict_checksums: args.strict_checksums.then_some(true),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Manage schema migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateCommand,
    },
}

#[derive(Subcommand)]
enum MigrateCommand {
    /// Apply pending migrations
    Up {
        /// Re-apply every migration, even ones already recorded
        #[arg(long)]
        force: bool,

        /// Simulate pending migrations and roll everything back
        #[arg(long)]
        dry_run: bool,

        /// Baseline from a matching schema snapshot when there is no history
        #[arg(long)]
        auto_detect_baseline: bool,

        /// Migrate up to this version only
        #[arg(long, value_name = "VERSION")]
        target: Option<String>,

        /// Keep going after a failed migration
        #[arg(long)]
        continue_on_error: bool,
    },

    /// Roll back applied migrations
    Down {
        /// Number of most recent migrations to roll back
        #[arg(long, value_name = "N", conflicts_with = "versions")]
        steps: Option<usize>,

        /// Specific versions to roll back (repeatable)
        #[arg(long = "version", value_name = "VERSION")]
        versions: Vec<String>,
    },

    /// Show migration status
    Status,

    /// Validate applied migrations against the files on disk
    Validate,

    /// Mark every version up to --through as applied without running it
    Baseline {
        #[arg(long, value_name = "VERSION")]
        through: String,
    },

    /// Clear the tracking table and mark versions from disk as applied
    Reinit {
        /// Only mark versions up to this one
        #[arg(long, value_name = "VERSION")]
        through: Option<String>,

        /// Confirm deleting every tracking record
        #[arg(long)]
        yes: bool,

        /// Show what would change without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Rebuild the schema from its source and baseline every migration
    Rebuild {
        /// Drop every user schema first
        #[arg(long)]
        drop_schemas: bool,

        /// Show what would change without writing
        #[arg(long)]
        dry_run: bool,

        /// Apply seed files after the schema is built
        #[arg(long)]
        apply_seeds: bool,

        /// Include the previous tracking rows in the report
        #[arg(long)]
        backup_tracking: bool,
    },
}

macro_rules! emit_json {
    ($value:expr) => {
        match serde_json::to_string_pretty(&$value) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("{} failed to serialize output: {}", "ERROR:".red().bold(), e),
        }
    };
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up logging (suppress when JSON output is requested)
    let filter = if cli.json || cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .without_time()
        .init();

    let json_output = cli.json;
    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            if json_output {
                emit_json!(e.to_json());
            } else {
                print_error(&e);
            }
            process::exit(e.exit_code());
        }
    }
}

/// Run the selected command and return the process exit code.
async fn run(cli: Cli) -> Result<i32, TidemarkError> {
    let json_output = cli.json;
    let overrides = CliOverrides::from(cli.overrides);
    let config = TidemarkConfig::load(cli.config.as_deref(), &overrides)?;
    let tm = Tidemark::new(config).await?;

    let Commands::Migrate { action } = cli.command;
    match action {
        MigrateCommand::Up {
            force,
            dry_run: true,
            target,
            ..
        } => {
            if force {
                tracing::warn!("--force has no effect on a dry run");
            }
            let report = tm.dry_run(target.as_deref()).await?;
            if json_output {
                emit_json!(report);
            } else {
                output::print_dry_run(&report);
            }
        }
        MigrateCommand::Up {
            force,
            auto_detect_baseline,
            target,
            continue_on_error,
            ..
        } => {
            let options = MigrateOptions {
                force,
                target,
                continue_on_error,
                auto_detect_baseline,
            };
            let report = tm.migrate(&options).await?;
            if json_output {
                emit_json!(report);
            } else {
                output::print_migrate_summary(&report);
            }
            if !report.failures.is_empty() {
                return Ok(3);
            }
        }
        MigrateCommand::Down { steps, versions } => {
            let target = if versions.is_empty() {
                RollbackTarget::Steps(steps.unwrap_or(1))
            } else {
                RollbackTarget::Versions(versions)
            };
            let report = tm.rollback(&target).await?;
            if json_output {
                emit_json!(report);
            } else {
                output::print_rollback_summary(&report);
            }
        }
        MigrateCommand::Status => {
            let report = tm.status().await?;
            if json_output {
                emit_json!(report);
            } else {
                output::print_status(&report);
            }
        }
        MigrateCommand::Validate => {
            let report = tm.validate().await?;
            if json_output {
                emit_json!(report);
            } else {
                output::print_validate_result(&report);
            }
        }
        MigrateCommand::Baseline { through } => {
            let report = tm.baseline(&through).await?;
            if json_output {
                emit_json!(report);
            } else {
                output::print_baseline_result(&report);
            }
        }
        MigrateCommand::Reinit {
            through,
            yes,
            dry_run,
        } => {
            let report = tm.reinit(through.as_deref(), yes, dry_run).await?;
            if json_output {
                emit_json!(report);
            } else {
                output::print_reinit_result(&report);
            }
        }
        MigrateCommand::Rebuild {
            drop_schemas,
            dry_run,
            apply_seeds,
            backup_tracking,
        } => {
            let options = RebuildOptions {
                drop_schemas,
                dry_run,
                apply_seeds,
                backup_tracking,
            };
            let report = tm.rebuild(&options).await?;
            if json_output {
                emit_json!(report);
            } else {
                output::print_rebuild_result(&report);
            }
        }
    }

    Ok(0)
}

fn print_error(error: &TidemarkError) {
    eprintln!(
        "{} {} {}",
        "ERROR:".red().bold(),
        format!("[{}]", error.code()).red(),
        error
    );

    for (key, value) in error.context() {
        eprintln!("  {} {}", format!("{}:", key).dimmed(), value);
    }

    if let Some(hint) = error.hint() {
        eprintln!("{}", format!("Hint: {}", hint).dimmed());
    }
}
