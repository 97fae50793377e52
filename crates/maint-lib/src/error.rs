//! Error taxonomy for the maintenance engine

use thiserror::Error;

pub type MaintenanceResult<T> = std::result::Result<T, MaintenanceError>;

#[derive(Debug, Error)]
pub enum MaintenanceError {
    /// Connection, query or timeout failure against the data store.
    /// Fatal for the current job only.
    #[error("data access error: {0}")]
    DataAccess(String),

    /// The external tool kept running out of memory until the batch cap
    /// could not shrink any further.
    #[error("{model}: batch size reduced to zero after repeated memory failures")]
    ResourceExhausted { model: String },

    /// The external tool failed for a reason other than memory.
    #[error("external tool failed (exit code {exit_code}): {message}")]
    ToolFailure { exit_code: i32, message: String },

    /// A published or seeded artifact failed to reload.
    #[error("artifact integrity check failed: {0}")]
    ArtifactIntegrity(String),

    /// Persisted status was written by a newer schema. Aborts the run.
    #[error("status record version {found} is newer than supported version {supported}")]
    ConfigurationVersion { found: u32, supported: u32 },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("notification failed: {0}")]
    Notification(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl MaintenanceError {
    /// Errors that stop the coordinator loop instead of failing one job.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, MaintenanceError::ConfigurationVersion { .. })
    }
}

impl From<sqlx::Error> for MaintenanceError {
    fn from(e: sqlx::Error) -> Self {
        MaintenanceError::DataAccess(e.to_string())
    }
}

impl From<config::ConfigError> for MaintenanceError {
    fn from(e: config::ConfigError) -> Self {
        MaintenanceError::Configuration(e.to_string())
    }
}

/// Message of the first inner cause of an error chain, or the error itself
/// when it has no source.
pub fn root_message(err: &(dyn std::error::Error + 'static)) -> String {
    match err.source() {
        Some(inner) => inner.to_string(),
        None => err.to_string(),
    }
}
