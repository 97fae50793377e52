//! ML maintenance CLI
//!
//! Operator tool for running maintenance by hand, inspecting job status and
//! the audit log, checking tester output against acceptance thresholds, and
//! retiring a model's data.

mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{log, purge, run, score, status};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// ML maintenance CLI
#[derive(Parser)]
#[command(name = "mlmaint")]
#[command(author, version, about = "CLI for incremental ML model maintenance", long_about = None)]
pub struct Cli {
    /// Settings file (can also be set via MLMAINT_CONFIG env var)
    #[arg(long, short, env = "MLMAINT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    /// Enable verbose output
    #[arg(long, short)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run every enabled collector and trainer once
    Run,

    /// Show per-job watermarks, scores and batch caps
    Status,

    /// Show the audit log of past runs
    Log {
        /// Only the newest N entries
        #[arg(long)]
        tail: Option<usize>,
    },

    /// Check a saved tester output against acceptance thresholds
    Score {
        /// File holding the tester's output
        file: PathBuf,

        /// Minimum acceptable score (0 to 1)
        #[arg(long, default_value_t = 0.0)]
        minimum: f64,

        /// Allowed regression below the previous best
        #[arg(long, default_value_t = 0.0)]
        drop: f64,

        /// Previous best score
        #[arg(long, default_value_t = 0.0)]
        previous: f64,
    },

    /// Mark all data of a model for deletion
    Purge {
        /// Model name
        model: String,

        /// Delete marked records immediately instead of at the end of the next run
        #[arg(long)]
        now: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // score works on a file alone and needs no settings
    if let Commands::Score {
        file,
        minimum,
        drop,
        previous,
    } = &cli.command
    {
        return score::show_score(file, *minimum, *drop, *previous, cli.format);
    }

    let settings = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => run::run_once(&settings, cli.format).await?,
        Commands::Status => status::show_status(&settings, cli.format).await?,
        Commands::Log { tail } => log::show_log(&settings, tail, cli.format).await?,
        Commands::Purge { model, now } => {
            purge::purge_model(&settings, &model, now, cli.format).await?
        }
        Commands::Score { .. } => {}
    }

    Ok(())
}
