//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a table from a list of items
pub fn print_table<T: Tabled + Serialize>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("{}", "No items found".yellow());
                return;
            }
            let table = Table::new(items).with(Style::rounded()).to_string();
            println!("{}", table);
        }
        OutputFormat::Json => print_json(&items),
    }
}

/// Pretty JSON on stdout
pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    if let Ok(json) = serde_json::to_string_pretty(value) {
        println!("{}", json);
    }
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Scores are fractions; show them as percentages
pub fn format_score(score: f64) -> String {
    format!("{:.2}%", score * 100.0)
}

/// Color a run or job state
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "completed" | "published" | "accepted" | "enabled" => status.green().to_string(),
        "cancelled" | "skipped" | "disabled" => status.yellow().to_string(),
        "rejected" | "error" | "failed" => status.red().to_string(),
        _ => status.to_string(),
    }
}

/// Color a score against the acceptance minimum
pub fn color_score(score: f64, minimum: f64) -> String {
    let formatted = format_score(score);
    if score >= minimum {
        formatted.green().to_string()
    } else {
        formatted.red().to_string()
    }
}
