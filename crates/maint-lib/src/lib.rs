//! Incremental model maintenance engine
//!
//! This crate provides the core functionality for:
//! - Collecting labelled records into the shared `ml_data` table
//! - Batched training and testing through external command-line tools
//! - Adaptive batch-size backoff when a tool runs out of memory
//! - Score-based acceptance and safe publication of model artifacts
//! - Persisted per-job status and a bounded audit log
//! - Health checks and observability

pub mod acceptance;
pub mod audit_log;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod job;
pub mod models;
pub mod notify;
pub mod observability;
pub mod retry;
pub mod runner;
pub mod settings;
pub mod status;
pub mod store;

#[cfg(test)]
mod test_support;

pub use acceptance::AcceptanceEvaluator;
pub use audit_log::RunLog;
pub use coordinator::{CoordinatorConfig, RunState, RunSummary, TrainingCoordinator};
pub use error::{MaintenanceError, MaintenanceResult};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use job::{MaintenanceService, ServiceOutcome};
pub use models::*;
pub use observability::{MaintenanceMetrics, StructuredLogger};
pub use runner::{ProcessRunner, TokioProcessRunner};
pub use settings::Settings;
pub use status::{CoordinatorStatus, JobStatus, StatusBoard};
pub use store::{DataStore, SqliteDataStore, StoreConfig};
