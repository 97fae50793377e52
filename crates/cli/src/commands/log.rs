//! Audit log of past runs

use anyhow::{Context, Result};
use maint_lib::{RunLog, Settings, StatusBoard};

use crate::config;
use crate::output::{print_json, print_warning, OutputFormat};

/// Newest `tail` entries, oldest first; everything when `tail` is `None`
pub fn select(log: &RunLog, tail: Option<usize>) -> Vec<&str> {
    match tail {
        Some(count) => log.tail(count),
        None => log.entries().collect(),
    }
}

pub async fn show_log(settings: &Settings, tail: Option<usize>, format: OutputFormat) -> Result<()> {
    let store = config::connect(settings).await?;
    let board = StatusBoard::load(&store, settings.coordinator_id)
        .await
        .context("Failed to load coordinator status")?;
    let log = board.log();
    let entries = select(&log, tail);

    match format {
        OutputFormat::Json => print_json(&entries),
        OutputFormat::Table => {
            if entries.is_empty() {
                print_warning("Log is empty");
                return Ok(());
            }
            for entry in entries {
                println!("{}", entry);
            }
        }
    }

    Ok(())
}
