use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use card_txn_etl::config::{ConfigOverrides, PipelineConfig};
use card_txn_etl::pipeline::{Pipeline, RunSummary, StageFailure};
use card_txn_etl::storage::SqliteStore;
use card_txn_etl::{logging, metrics};

#[derive(Parser)]
#[command(name = "card_txn_etl")]
#[command(about = "Card transaction ETL: CSV extract into a deduplicated SQLite warehouse")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// TOML config file (defaults to ./etl.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Source CSV, overrides config and ETL_SOURCE_PATH
    #[arg(long, global = true)]
    source: Option<PathBuf>,

    /// SQLite database file, overrides config and ETL_DB_PATH
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Write a Prometheus textfile snapshot here when the command ends
    #[arg(long, global = true)]
    metrics_out: Option<PathBuf>,

    /// Print the run summary as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Run every stage from ingest to verification (default)
    Run,
    /// Load the source file into the raw table only
    Ingest,
    /// Transform and encode the raw table into staging
    Transform,
    /// Merge staging into the warehouse, then count it
    Merge,
    /// Count warehouse rows
    Verify,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    // Dropping the guard flushes the file log, so it outlives the error report.
    let mut log_guard = None;
    match run(&cli, &mut log_guard) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("ETL command failed: {:#}", e);
            eprintln!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, log_guard: &mut Option<WorkerGuard>) -> anyhow::Result<()> {
    let overrides = ConfigOverrides {
        source_path: cli.source.clone(),
        database_path: cli.db.clone(),
    };
    let config = PipelineConfig::load(cli.config.as_deref(), &overrides)
        .context("failed to load configuration")?;

    *log_guard = Some(logging::init_logging(&config.log_dir));
    metrics::init_metrics();

    let mut store = SqliteStore::open(&config).with_context(|| {
        format!("failed to open database {}", config.database.path.display())
    })?;

    let command = cli.command.unwrap_or(Commands::Run);
    let result = {
        let mut pipeline = Pipeline::new(&config, &mut store);
        info!(run_id = %pipeline.run_id(), "Dispatching ETL command");
        match command {
            Commands::Run => pipeline.run(),
            Commands::Ingest => pipeline.run_ingest(),
            Commands::Transform => pipeline.run_transform(),
            Commands::Merge => pipeline.run_merge(),
            Commands::Verify => pipeline.run_verify(),
        }
    };

    if let Some(path) = &cli.metrics_out {
        if let Err(e) = metrics::write_snapshot(path) {
            warn!(path = %path.display(), "Failed to write metrics snapshot: {}", e);
        }
    }

    match result {
        Ok(summary) => {
            print_summary(&summary, cli.json)?;
            Ok(())
        }
        Err(failure) => {
            report_failure(&failure, cli.json)?;
            Err(failure.into())
        }
    }
}

fn print_summary(summary: &RunSummary, json: bool) -> anyhow::Result<()> {
    info!(
        run_id = %summary.run_id,
        ingested = ?summary.ingested,
        staged = ?summary.staged,
        merged = ?summary.merged,
        warehouse_total = ?summary.warehouse_total,
        warnings = summary.warnings.len(),
        "Run summary"
    );
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("\n📊 ETL run {}", summary.run_id);
    let rows = [
        ("Ingested", summary.ingested),
        ("Fetched", summary.fetched),
        ("Transformed", summary.transformed),
        ("Staged", summary.staged),
        ("Merged (new)", summary.merged),
        ("Skipped duplicates", summary.skipped_duplicates),
        ("Skipped unkeyed", summary.skipped_unkeyed),
        ("Warehouse total", summary.warehouse_total),
    ];
    for (label, value) in rows {
        if let Some(value) = value {
            println!("   {}: {}", label, value);
        }
    }
    if let Some(line) = &summary.verification {
        println!("   {}", line);
    }
    if !summary.warnings.is_empty() {
        println!("\n⚠️  Warnings:");
        for warning in &summary.warnings {
            println!("   - {}", warning);
        }
    }
    Ok(())
}

fn report_failure(failure: &StageFailure, json: bool) -> anyhow::Result<()> {
    if json {
        let body = serde_json::json!({
            "failed_stage": failure.stage,
            "error": failure.error.to_string(),
            "summary": failure.summary,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
    }
    Ok(())
}
