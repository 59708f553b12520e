// src/main.rs
//! AgentLens maintenance CLI
//!
//! Inspects and maintains the trace database: statistics, retention
//! pruning, vacuum, online backup and JSON export of runs.

use agentlens_engine::observability::init_tracing;
use agentlens_engine::processing::ProcessingPipeline;
use agentlens_engine::storage::{Database, RunExport, RunFilter};
use agentlens_engine::utils::config::TraceConfig;
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "agentlens", version, about = "AgentLens trace database maintenance")]
struct Cli {
    /// Config file layered over defaults (TRACE_* env vars still win)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path, overriding the configuration
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show run and step counts and database size
    Stats,

    /// Delete old runs, by age and/or by database size
    Prune {
        /// Keep runs started within this many days (defaults to the config)
        #[arg(long)]
        retention_days: Option<i64>,

        /// Delete oldest runs until the database fits in this many bytes
        #[arg(long)]
        max_bytes: Option<u64>,

        /// Reclaim space afterwards
        #[arg(long)]
        vacuum: bool,
    },

    /// Reclaim unused space
    Vacuum,

    /// Snapshot the live database to a file
    Backup {
        /// Destination file
        path: PathBuf,
    },

    /// Export runs with decoded timelines as JSON
    Export(ExportArgs),

    /// Print the effective configuration
    Config,
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// Run to export
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    run_id: Option<String>,

    /// Export the most recent runs
    #[arg(long)]
    all: bool,

    /// Maximum number of runs with --all
    #[arg(long, default_value_t = 100)]
    limit: usize,

    /// Output file (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        TraceConfig::load_from(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    init_tracing(&config)?;

    let database = match cli.command {
        Command::Config => {
            println!("{}", config.to_json()?);
            return Ok(());
        }
        _ => Database::open(&config)
            .with_context(|| format!("Failed to open database {:?}", config.db_path))?,
    };

    match cli.command {
        Command::Stats => {
            let stats = database.get_stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Prune {
            retention_days,
            max_bytes,
            vacuum,
        } => {
            let by_age = database.prune_old_runs(retention_days)?;
            let by_size = match max_bytes.or(config.retention_max_bytes) {
                Some(max_bytes) => database.prune_by_size(max_bytes)?,
                None => 0,
            };
            if vacuum {
                database.vacuum()?;
            }
            info!("Pruned {} runs by age, {} by size", by_age, by_size);
            println!("pruned_by_age={} pruned_by_size={}", by_age, by_size);
        }
        Command::Vacuum => database.vacuum()?,
        Command::Backup { path } => {
            database.backup(&path)?;
            println!("Backup written to {}", path.display());
        }
        Command::Export(args) => export(&database, &config, args)?,
        Command::Config => {}
    }

    database.close();
    Ok(())
}

fn export(database: &Database, config: &TraceConfig, args: ExportArgs) -> Result<()> {
    let pipeline = ProcessingPipeline::new(config)?;

    let exports: Vec<RunExport> = match args.run_id {
        Some(run_id) => match database.export_run(&run_id, &pipeline)? {
            Some(export) => vec![export],
            None => bail!("Run not found: {}", run_id),
        },
        None => {
            let filter = RunFilter {
                limit: args.limit,
                ..Default::default()
            };
            let mut exports = Vec::new();
            for run in database.list_runs(&filter)? {
                if let Some(export) = database.export_run(&run.id, &pipeline)? {
                    exports.push(export);
                }
            }
            exports
        }
    };

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("Failed to create {:?}", path))?,
        ),
        None => Box::new(io::stdout().lock()),
    };

    if exports.len() == 1 && !args.all {
        serde_json::to_writer_pretty(&mut out, &exports[0])?;
    } else {
        serde_json::to_writer_pretty(&mut out, &exports)?;
    }
    writeln!(out)?;

    if let Some(path) = &args.output {
        info!("Exported {} runs to {:?}", exports.len(), path);
    }
    Ok(())
}
