//! Per-job status from the persisted coordinator record

use anyhow::{Context, Result};
use colored::Colorize;
use maint_lib::{CoordinatorStatus, ServiceKind, Settings, StatusBoard};
use serde::Serialize;
use tabled::Tabled;
use uuid::Uuid;

use crate::config;
use crate::output::{format_score, print_table, print_warning, OutputFormat};

/// Row for the job status table
#[derive(Debug, Tabled, Serialize)]
pub struct JobRow {
    #[tabled(rename = "Job")]
    pub description: String,
    #[tabled(rename = "Kind")]
    pub kind: String,
    #[tabled(rename = "Model")]
    pub model: String,
    #[tabled(rename = "State")]
    pub state: String,
    #[tabled(rename = "Last Id")]
    pub last_id_processed: i64,
    #[tabled(rename = "Score")]
    pub last_score: String,
    #[tabled(rename = "Train Cap")]
    pub max_training_batch: i64,
    #[tabled(rename = "Test Cap")]
    pub max_testing_batch: i64,
}

/// Configured services first, then ids found only in the persisted record
pub fn job_rows(settings: &Settings, status: &CoordinatorStatus) -> Vec<JobRow> {
    let mut rows = Vec::new();
    let mut seen = Vec::new();

    let configured = settings
        .collectors
        .iter()
        .map(|c| (c.descriptor(), ServiceKind::DataCollector, c.default_status()))
        .chain(
            settings
                .trainers
                .iter()
                .map(|t| (t.descriptor(), ServiceKind::ModelTrainer, t.default_status())),
        );

    for (descriptor, kind, default) in configured {
        let (job, state) = match status.jobs.get(&descriptor.id) {
            Some(job) => (*job, if descriptor.enabled { "enabled" } else { "disabled" }),
            None => (default, "never run"),
        };
        seen.push(descriptor.id);
        rows.push(JobRow {
            description: descriptor.description,
            kind: kind.to_string(),
            model: descriptor.model_name,
            state: state.to_string(),
            last_id_processed: job.last_id_processed,
            last_score: score_text(kind, job.last_score),
            max_training_batch: job.max_training_batch,
            max_testing_batch: job.max_testing_batch,
        });
    }

    let mut orphans: Vec<(&Uuid, _)> = status
        .jobs
        .iter()
        .filter(|(id, _)| !seen.contains(*id))
        .collect();
    orphans.sort_by_key(|(id, _)| **id);
    for (id, job) in orphans {
        rows.push(JobRow {
            description: id.to_string(),
            kind: "-".to_string(),
            model: "-".to_string(),
            state: "unconfigured".to_string(),
            last_id_processed: job.last_id_processed,
            last_score: format_score(job.last_score),
            max_training_batch: job.max_training_batch,
            max_testing_batch: job.max_testing_batch,
        });
    }

    rows
}

fn score_text(kind: ServiceKind, score: f64) -> String {
    match kind {
        ServiceKind::DataCollector => "-".to_string(),
        ServiceKind::ModelTrainer => format_score(score),
    }
}

pub async fn show_status(settings: &Settings, format: OutputFormat) -> Result<()> {
    let store = config::connect(settings).await?;
    let board = StatusBoard::load(&store, settings.coordinator_id)
        .await
        .context("Failed to load coordinator status")?;
    let snapshot = board.snapshot();
    let rows = job_rows(settings, &snapshot);

    if matches!(format, OutputFormat::Table) {
        println!("{}", "Maintenance Status".bold());
        println!("{}", "=".repeat(60));
        println!("Instance:     {}", settings.instance_name.cyan());
        println!("Coordinator:  {}", settings.coordinator_id);
        match snapshot.log.tail(1).first() {
            Some(last) => println!("Last entry:   {}", last),
            None => print_warning("No runs recorded yet"),
        }
        println!();
    }

    print_table(&rows, format);
    Ok(())
}
