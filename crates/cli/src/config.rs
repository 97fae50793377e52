//! Settings and store access for the CLI

use anyhow::{Context, Result};
use maint_lib::{Settings, SqliteDataStore};
use std::path::Path;
use tracing::debug;

/// Load the same settings the agent uses
pub fn load(path: Option<&Path>) -> Result<Settings> {
    let settings = Settings::load(path).with_context(|| match path {
        Some(p) => format!("Failed to load settings from {}", p.display()),
        None => "Failed to load settings from the environment".to_string(),
    })?;
    Ok(settings)
}

/// Connect to the configured data store
pub async fn connect(settings: &Settings) -> Result<SqliteDataStore> {
    debug!(url = %settings.database.url, "Connecting to data store");
    SqliteDataStore::connect(&settings.store_config())
        .await
        .with_context(|| format!("Failed to connect to {}", settings.database.url))
}
