//! Evaluate a saved tester output against acceptance thresholds

use anyhow::{Context, Result};
use colored::Colorize;
use maint_lib::acceptance::parse_score;
use maint_lib::AcceptanceEvaluator;
use serde::Serialize;
use std::path::Path;

use crate::output::{color_score, print_error, print_json, print_success, OutputFormat};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreReport {
    pub score: Option<f64>,
    pub minimum_score: f64,
    pub allowable_drop: f64,
    pub previous_best: f64,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub fn evaluate(text: &str, minimum: f64, drop: f64, previous: f64) -> ScoreReport {
    let evaluator = AcceptanceEvaluator::new(minimum, drop);
    let result = evaluator.evaluate(text, previous, 0, 0);
    let reason = (!result.criteria_met).then(|| evaluator.rejection_reason(&result, previous));

    ScoreReport {
        score: parse_score(text),
        minimum_score: minimum,
        allowable_drop: drop,
        previous_best: previous,
        accepted: result.criteria_met,
        reason,
    }
}

pub fn show_score(
    file: &Path,
    minimum: f64,
    drop: f64,
    previous: f64,
    format: OutputFormat,
) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read tester output {}", file.display()))?;
    let report = evaluate(&text, minimum, drop, previous);

    match format {
        OutputFormat::Json => print_json(&report),
        OutputFormat::Table => {
            println!("{}", "Acceptance Check".bold());
            println!("{}", "=".repeat(40));
            match report.score {
                Some(score) => println!("Score:          {}", color_score(score, minimum)),
                None => println!("Score:          {}", "unreadable".red()),
            }
            println!("Minimum:        {:.4}", report.minimum_score);
            println!("Allowable drop: {:.4}", report.allowable_drop);
            println!("Previous best:  {:.4}", report.previous_best);
            println!();
            match &report.reason {
                None => print_success("Model would be accepted"),
                Some(reason) => print_error(&format!("Model would be rejected: {}", reason)),
            }
        }
    }

    Ok(())
}
