//! Retire a model's collected data

use anyhow::{Context, Result};
use maint_lib::{DataStore, Settings};
use serde::Serialize;

use crate::config;
use crate::output::{print_info, print_json, print_success, OutputFormat};

#[derive(Debug, Serialize)]
struct PurgeReport<'a> {
    model: &'a str,
    marked: u64,
    deleted: Option<u64>,
}

/// Flag every row of `model` deletable; with `now` also run the cleanup
pub async fn purge_model(settings: &Settings, model: &str, now: bool, format: OutputFormat) -> Result<()> {
    let store = config::connect(settings).await?;

    let marked = store
        .mark_model_deletable(model)
        .await
        .with_context(|| format!("Failed to mark records of {}", model))?;
    let deleted = if now {
        Some(
            store
                .delete_marked()
                .await
                .context("Failed to delete marked records")?,
        )
    } else {
        None
    };

    match format {
        OutputFormat::Json => print_json(&PurgeReport {
            model,
            marked,
            deleted,
        }),
        OutputFormat::Table => {
            print_success(&format!("Marked {} records of {} for deletion", marked, model));
            match deleted {
                Some(n) => print_success(&format!("Removed {} records marked for deletion", n)),
                None => print_info("Records are removed by the next completed run"),
            }
        }
    }

    Ok(())
}
