//! Core data models for the maintenance engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One collected row of ML input as stored in `ml_data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub id: i64,
    pub model_name: String,
    pub payload: String,
    pub is_training_data: bool,
    pub can_be_deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Projection of a data record fetched into a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: i64,
    pub payload: String,
}

/// A row about to be inserted by a data collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub model_name: String,
    pub payload: String,
    pub is_training_data: bool,
}

/// Bounded batch query. `after_id` carries the caller's watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchQuery {
    pub model_name: String,
    pub is_training: bool,
    pub max_records: i64,
    pub after_id: i64,
}

/// Outcome of one test cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceResult {
    pub criteria_met: bool,
    pub first_id_processed: i64,
    pub last_id_processed: i64,
    pub score: f64,
}

/// History row written to `ml_model` when an artifact is published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedModel {
    pub model_name: String,
    pub checksum: String,
    pub score: f64,
    pub last_id_processed: i64,
    pub published_at: DateTime<Utc>,
}

/// Which of the two ordered service lists a service belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    DataCollector,
    ModelTrainer,
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceKind::DataCollector => write!(f, "data_collector"),
            ServiceKind::ModelTrainer => write!(f, "model_trainer"),
        }
    }
}

/// Configured identity of a maintenance service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: Uuid,
    pub description: String,
    pub model_name: String,
    pub enabled: bool,
}
