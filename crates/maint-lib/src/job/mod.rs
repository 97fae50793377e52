//! Maintenance services run by the coordinator
//!
//! Two kinds exist: data collectors copy new rows into `ml_data`, model
//! trainers run a train/test cycle over them. The coordinator only sees the
//! [`MaintenanceService`] trait.

pub mod collector;
pub mod trainer;

pub use collector::{CollectorConfig, CollectorSource, DataCollector, SourceRecord, SqlCollectorSource};
pub use trainer::{ModelFlavor, ModelTrainer, TrainerConfig};

use crate::error::MaintenanceResult;
use crate::models::{ServiceDescriptor, ServiceKind};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Result of one `process` call that did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceOutcome {
    Collected { records: u64 },
    Published { score: f64, last_id_processed: i64 },
    Rejected { score: f64, reason: String },
    NothingToDo,
    Cancelled,
}

impl std::fmt::Display for ServiceOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceOutcome::Collected { records } => write!(f, "collected {} records", records),
            ServiceOutcome::Published {
                score,
                last_id_processed,
            } => write!(
                f,
                "model published (score {:.4}, last id {})",
                score, last_id_processed
            ),
            ServiceOutcome::Rejected { reason, .. } => write!(f, "model rejected: {}", reason),
            ServiceOutcome::NothingToDo => write!(f, "nothing to do"),
            ServiceOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[async_trait]
pub trait MaintenanceService: Send + Sync {
    fn descriptor(&self) -> &ServiceDescriptor;

    fn kind(&self) -> ServiceKind;

    /// Whether enough is configured for `process` to do anything
    fn is_configured(&self) -> bool;

    /// Records newer than the service's watermark
    async fn unprocessed_count(&self) -> MaintenanceResult<u64>;

    /// Run one cycle, resuming from the persisted watermark
    async fn process(&mut self, cancel: &CancellationToken) -> MaintenanceResult<ServiceOutcome>;
}
