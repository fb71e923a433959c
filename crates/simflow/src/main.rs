//! simflow command line.
//!
//! With no subcommand, runs one ingestion batch against the configured root.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Color, ContentArrangement, Table};
use simflow::{
    Contracts, Coordinator, IngestConfig, RunLogEntry, SchemaValidator, StageManager, Warehouse,
};
use simflow_db::DbTimestamp;
use simflow_logging::{init_logging, LogConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "simflow", about = "Load simulation outputs into the warehouse")]
struct Cli {
    /// Config file (default: $SIMFLOW_CONFIG, then <root>/simflow.toml)
    #[arg(long, global = true, env = "SIMFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one ingestion batch (default)
    Run,

    /// Create warehouse tables and indexes, then exit
    Provision,

    /// List run log records still marked running
    Stale {
        /// Only show records opened more than this many hours ago
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            eprintln!("Error: {:?}", err);
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = IngestConfig::resolve(cli.config.as_deref()).context("Failed to load config")?;

    let log_dir = config.log_dir();
    init_logging(LogConfig {
        log_dir: &log_dir,
        verbose: cli.verbose,
    })
    .context("Failed to initialize logging")?;

    let contracts = Contracts::load(&config.column_map_path(), &config.required_columns_path())
        .context("Failed to load column contracts")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(&config, contracts),
        Commands::Provision => cmd_provision(&config, contracts),
        Commands::Stale { older_than_hours } => cmd_stale(&config, contracts, older_than_hours),
    }
}

fn open_warehouse(config: &IngestConfig, contracts: &Contracts) -> Result<Warehouse> {
    let path = config.database_path();
    Warehouse::open(&path, &contracts.required)
        .with_context(|| format!("Failed to open warehouse {}", path.display()))
}

fn cmd_run(config: &IngestConfig, contracts: Contracts) -> Result<ExitCode> {
    let warehouse = open_warehouse(config, &contracts)?;
    let coordinator = Coordinator::new(
        StageManager::new(&config.root, contracts.mapping),
        SchemaValidator::new(contracts.required),
        warehouse,
        config.settings(),
    );

    info!(root = %config.root.display(), "Starting ingestion batch");
    let report = coordinator.run_batch().context("Batch aborted")?;

    println!(
        "cleaned {}, facts {} ({} rows), metadata {}, failures {}, stale runs {}",
        report.cleaned,
        report.fact_outcomes.len(),
        report.rows_loaded(),
        report.metadata_outcomes.len(),
        report.failures.len(),
        report.stale_runs.len()
    );
    for failure in &report.failures {
        println!("  {} [{}] {}", failure.path.display(), failure.kind, failure.error);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_provision(config: &IngestConfig, contracts: Contracts) -> Result<ExitCode> {
    let warehouse = open_warehouse(config, &contracts)?;
    if warehouse.provision_schema() {
        println!("Warehouse ready at {}", config.database_path().display());
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("Provisioning failed, see {}", config.log_dir().join("error.log").display());
        Ok(ExitCode::from(1))
    }
}

fn cmd_stale(
    config: &IngestConfig,
    contracts: Contracts,
    older_than_hours: Option<u64>,
) -> Result<ExitCode> {
    let path = config.database_path();
    let warehouse = Warehouse::open_readonly(&path, &contracts.required)
        .with_context(|| format!("Failed to open warehouse {}", path.display()))?;

    let hours = older_than_hours.unwrap_or(config.stale_run_after_hours);
    let hours = i64::try_from(hours).context("--older-than-hours is too large")?;
    let entries = warehouse
        .stale_runs(chrono::Duration::hours(hours))
        .context("Failed to query run log")?;

    if entries.is_empty() {
        println!("No run log records running for more than {}h", hours);
    } else {
        print_runs(&entries);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_runs(entries: &[RunLogEntry]) {
    let now = DbTimestamp::now();
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(
        ["RUN LOG ID", "RUN", "TYPE", "STARTED", "AGE"]
            .iter()
            .map(|h| Cell::new(h).fg(Color::Cyan))
            .collect::<Vec<_>>(),
    );
    for entry in entries {
        table.add_row(vec![
            Cell::new(entry.id.as_str()),
            Cell::new(&entry.simulation_id),
            Cell::new(entry.load_type.as_str()),
            Cell::new(entry.started_at.to_rfc3339()),
            Cell::new(format!("{}h", entry.age(&now).num_hours())).fg(Color::Yellow),
        ]);
    }
    println!("{}", table);
}
