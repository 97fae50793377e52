//! Access to the relational store holding collected ML data
//!
//! The engine only talks to the store through [`DataStore`]. The SQLite
//! implementation issues parameterized statements; one pooled connection is
//! used per discrete operation and no transaction spans more than a single
//! statement.

mod sqlite;

#[cfg(test)]
pub(crate) mod memory;

pub use sqlite::{SqliteDataStore, StoreConfig};

use crate::error::MaintenanceResult;
use crate::models::{BatchQuery, BatchRecord, NewRecord, PublishedModel};

pub use async_trait::async_trait;

/// Trait for data store implementations
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Most recent `max_records` rows with `id > after_id` that are not marked
    /// deletable, returned ascending by id
    async fn fetch_batch(&self, query: &BatchQuery) -> MaintenanceResult<Vec<BatchRecord>>;

    /// Rows with an id above the watermark
    async fn count_unprocessed(
        &self,
        model_name: &str,
        is_training: bool,
        last_id: i64,
    ) -> MaintenanceResult<u64>;

    /// Rows at or below the watermark, counting at most `cap`
    async fn count_processed_under_cap(
        &self,
        model_name: &str,
        is_training: bool,
        last_id: i64,
        cap: i64,
    ) -> MaintenanceResult<u64>;

    /// Bulk delete every row flagged deletable. Runs without a timeout.
    async fn delete_marked(&self) -> MaintenanceResult<u64>;

    /// Insert collected rows, returning how many were written
    async fn insert_records(&self, records: &[NewRecord]) -> MaintenanceResult<u64>;

    /// Flag every row of a model as deletable
    async fn mark_model_deletable(&self, model_name: &str) -> MaintenanceResult<u64>;

    /// Append a publication to the model history
    async fn record_published_model(&self, model: &PublishedModel) -> MaintenanceResult<()>;

    /// Load a serialized status blob
    async fn load_status(&self, key: &str) -> MaintenanceResult<Option<String>>;

    /// Store a serialized status blob, replacing any previous value
    async fn save_status(&self, key: &str, blob: &str) -> MaintenanceResult<()>;
}
