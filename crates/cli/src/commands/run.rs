//! Run the coordinator once from the command line

use anyhow::{Context, Result};
use colored::Colorize;
use maint_lib::{
    runner::{ProcessRunner, TokioProcessRunner},
    RunState, Settings, TrainingCoordinator,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::output::{color_status, print_info, print_json, print_warning, OutputFormat};

pub async fn run_once(settings: &Settings, format: OutputFormat) -> Result<()> {
    let store = config::connect(settings).await?;

    std::fs::create_dir_all(&settings.work_dir)
        .with_context(|| format!("Failed to create work dir {}", settings.work_dir.display()))?;
    let runner: Arc<dyn ProcessRunner> =
        Arc::new(TokioProcessRunner::with_working_dir(settings.work_dir.clone()));

    let mut coordinator = TrainingCoordinator::from_settings(settings, store, runner)
        .await
        .context("Failed to load coordinator status")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    if matches!(format, OutputFormat::Table) {
        print_info("Running maintenance; Ctrl-C stops after the current job");
    }

    let last_before = coordinator
        .board()
        .log()
        .tail(1)
        .first()
        .map(|entry| entry.to_string());
    let summary = coordinator.run(&cancel).await.context("Run aborted")?;

    match format {
        OutputFormat::Json => print_json(&summary),
        OutputFormat::Table => {
            let log = coordinator.board().log();
            let entries: Vec<&str> = log.entries().collect();
            let start = last_before
                .and_then(|last| entries.iter().rposition(|e| *e == last))
                .map_or(0, |i| i + 1);
            for entry in &entries[start..] {
                println!("  {}", entry);
            }
            println!();
            println!("{}", "Run Summary".bold());
            println!("{}", "=".repeat(40));
            println!("State:    {}", color_status(&summary.state.to_string()));
            println!("Started:  {}", summary.started);
            println!("Skipped:  {}", summary.skipped);
            println!("Failed:   {}", summary.failed);
            println!("Deleted:  {}", summary.deleted);
            if summary.state == RunState::Cancelled {
                print_warning("Run was cancelled before all jobs ran");
            }
        }
    }

    Ok(())
}
