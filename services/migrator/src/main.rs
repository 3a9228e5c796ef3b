//! Migrator Service - loads HR spreadsheet exports into the relational
//! employee schema.
//!
//! Responsibilities:
//! - Reconcile categorical sheet values against the reference tables,
//!   minting codes for values the tables have never seen
//! - Match sheet rows to stored employees by cedula, carnet, or ficha
//! - Apply batched set-based column updates and family-member inserts
//! - Record every run in the migration ledger
//!
//! Usage:
//!   migrator banks --file planilla.xlsx
//!   migrator run-all --file planilla.xlsx --sheet "Marzo 2024"
//!   migrator family --file beneficiarios.xlsx --dry-run
//!   migrator emails --file correos.csv --key-strategy carnet

mod matching;
mod normalize;
mod pipeline;
mod reconcile;
mod report;
mod sheet;
mod store;
mod updater;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;

use crate::matching::KeyStrategy;
use crate::pipeline::RunOptions;
use crate::report::RunSummary;

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "migrator", about = "HR spreadsheet to relational migration")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct PipelineArgs {
    /// Workbook or CSV export to load.
    #[arg(long)]
    file: PathBuf,

    /// Worksheet name; the first sheet when omitted.
    #[arg(long)]
    sheet: Option<String>,

    /// Employee identifier to join on: cedula, carnet, or ficha.
    #[arg(long, default_value = "cedula")]
    key_strategy: String,

    /// Rows per database statement.
    #[arg(long, default_value = "1000")]
    batch_size: usize,

    /// Truncate this pipeline's reference tables before loading.
    #[arg(long, default_value = "false")]
    full_reload: bool,

    /// Plan and report without writing anything.
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Beneficiary slots to scan in the family pipeline.
    #[arg(long, default_value = "8")]
    max_dependents: usize,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile banks and point employees at them.
    Banks(PipelineArgs),
    /// Reconcile job positions.
    Positions(PipelineArgs),
    /// Reconcile the five organizational levels, parents first.
    OrgLevels(PipelineArgs),
    /// Load sheet-coded cost centers, new codes and drifted descriptions.
    CostCenters(PipelineArgs),
    /// Reconcile the three MEF dimensions.
    Mef(PipelineArgs),
    /// Reconcile airports, schedules and education levels where present.
    Catalogs(PipelineArgs),
    /// Insert beneficiary slots as family members.
    Family(PipelineArgs),
    /// Clean and set institutional e-mail addresses.
    Emails(PipelineArgs),
    /// Set nationality codes and refresh last-paid dates.
    Nationality(PipelineArgs),
    /// Map and set marital-status descriptions.
    CivilStatus(PipelineArgs),
    /// Run every pipeline of the consolidated workbook in order.
    RunAll(PipelineArgs),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Banks(_) => "banks",
            Command::Positions(_) => "positions",
            Command::OrgLevels(_) => "org-levels",
            Command::CostCenters(_) => "cost-centers",
            Command::Mef(_) => "mef",
            Command::Catalogs(_) => "catalogs",
            Command::Family(_) => "family",
            Command::Emails(_) => "emails",
            Command::Nationality(_) => "nationality",
            Command::CivilStatus(_) => "civil-status",
            Command::RunAll(_) => "run-all",
        }
    }

    fn pipeline_args(&self) -> &PipelineArgs {
        match self {
            Command::Banks(args)
            | Command::Positions(args)
            | Command::OrgLevels(args)
            | Command::CostCenters(args)
            | Command::Mef(args)
            | Command::Catalogs(args)
            | Command::Family(args)
            | Command::Emails(args)
            | Command::Nationality(args)
            | Command::CivilStatus(args)
            | Command::RunAll(args) => args,
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

struct Config {
    db_url: String,
    max_connections: u32,
}

impl Config {
    fn from_env() -> Result<Config> {
        let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(5);
        Ok(Config {
            db_url,
            max_connections,
        })
    }
}

// =============================================================================
// Entry point
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env()?;

    let pipeline_args = args.command.pipeline_args();
    let options = RunOptions {
        strategy: KeyStrategy::parse(&pipeline_args.key_strategy)?,
        batch_size: pipeline_args.batch_size,
        full_reload: pipeline_args.full_reload,
        dry_run: pipeline_args.dry_run,
        max_dependents: pipeline_args.max_dependents,
    };

    println!("=== HR Migration: {} ===", args.command.name());
    println!("File: {}", pipeline_args.file.display());
    println!("Key strategy: {}", options.strategy.name());
    if options.full_reload {
        println!("Full reload: reference tables will be rebuilt");
    }
    if options.dry_run {
        println!("Dry run: no writes, no ledger entry");
    }

    let input = sheet::read_sheet(&pipeline_args.file, pipeline_args.sheet.as_deref())?;
    println!(
        "Loaded {} rows, {} columns",
        input.rows.len(),
        input.headers.len()
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.db_url)
        .await
        .context("Failed to connect to database")?;

    let run_id = if options.dry_run {
        None
    } else {
        Some(store::create_run(&pool, args.command.name()).await?)
    };

    let mut summary = RunSummary::new(args.command.name());
    let result = match &args.command {
        Command::Banks(_) => pipeline::run_banks(&pool, &input, &options, &mut summary).await,
        Command::Positions(_) => {
            pipeline::run_positions(&pool, &input, &options, &mut summary).await
        }
        Command::OrgLevels(_) => {
            pipeline::run_org_levels(&pool, &input, &options, &mut summary).await
        }
        Command::CostCenters(_) => {
            pipeline::run_cost_centers(&pool, &input, &options, &mut summary).await
        }
        Command::Mef(_) => pipeline::run_mef(&pool, &input, &options, &mut summary).await,
        Command::Catalogs(_) => pipeline::run_catalogs(&pool, &input, &options, &mut summary).await,
        Command::Family(_) => pipeline::run_family(&pool, &input, &options, &mut summary).await,
        Command::Emails(_) => pipeline::run_emails(&pool, &input, &options, &mut summary).await,
        Command::Nationality(_) => {
            pipeline::run_nationality(&pool, &input, &options, &mut summary).await
        }
        Command::CivilStatus(_) => {
            pipeline::run_civil_status(&pool, &input, &options, &mut summary).await
        }
        Command::RunAll(_) => pipeline::run_all(&pool, &input, &options, &mut summary).await,
    };

    // The summary covers whatever completed, on failure included.
    summary.print();

    if let Some(run_id) = run_id {
        let (status, error) = match &result {
            Ok(()) => ("completed", None),
            Err(e) => ("failed", Some(format!("{:#}", e))),
        };
        let detail = serde_json::to_value(&summary).unwrap_or_default();
        if let Err(ledger_error) =
            store::finish_run(&pool, run_id, status, error.as_deref(), detail).await
        {
            eprintln!("Failed to record run outcome: {:#}", ledger_error);
        }
    }

    result?;
    println!("=== Migration Complete ===");
    Ok(())
}
