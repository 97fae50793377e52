//! Data collector service
//!
//! Copies rows newer than its watermark from a source into `ml_data`. Every
//! `testing_every`-th source row (by source id) is stored as testing data,
//! the rest as training data.

use super::{MaintenanceService, ServiceOutcome};
use crate::error::MaintenanceResult;
use crate::models::{NewRecord, ServiceDescriptor, ServiceKind};
use crate::status::{JobStatus, StatusSlot};
use crate::store::{DataStore, SqliteDataStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// A row offered by a collector source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub source_id: i64,
    pub payload: String,
}

/// Where a collector reads new rows from
#[async_trait]
pub trait CollectorSource: Send + Sync {
    async fn count_new(&self, after_id: i64) -> MaintenanceResult<u64>;

    /// Up to `limit` rows with a source id above `after_id`, ascending
    async fn fetch_new(&self, after_id: i64, limit: i64) -> MaintenanceResult<Vec<SourceRecord>>;
}

/// Source defined by two operator-supplied statements run on the store's pool
///
/// `count_query` binds the watermark (`?1`) and returns one integer.
/// `select_query` binds the watermark (`?1`) and the limit (`?2`) and returns
/// `(id, payload)` rows.
pub struct SqlCollectorSource {
    store: SqliteDataStore,
    count_query: String,
    select_query: String,
}

impl SqlCollectorSource {
    pub fn new(store: SqliteDataStore, count_query: impl Into<String>, select_query: impl Into<String>) -> Self {
        Self {
            store,
            count_query: count_query.into(),
            select_query: select_query.into(),
        }
    }
}

#[async_trait]
impl CollectorSource for SqlCollectorSource {
    async fn count_new(&self, after_id: i64) -> MaintenanceResult<u64> {
        let count: i64 = self
            .store
            .timed(
                "collector count",
                sqlx::query_scalar(&self.count_query)
                    .bind(after_id)
                    .fetch_one(self.store.pool()),
            )
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn fetch_new(&self, after_id: i64, limit: i64) -> MaintenanceResult<Vec<SourceRecord>> {
        let rows = self
            .store
            .timed(
                "collector select",
                sqlx::query(&self.select_query)
                    .bind(after_id)
                    .bind(limit)
                    .fetch_all(self.store.pool()),
            )
            .await?;

        let mut records = rows
            .iter()
            .map(|row| {
                Ok(SourceRecord {
                    source_id: row.try_get(0)?,
                    payload: row.try_get(1)?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        records.sort_by_key(|r| r.source_id);
        Ok(records)
    }
}

/// Configuration of one data collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub id: Uuid,
    pub description: String,
    pub model_name: String,
    pub enabled: bool,
    pub count_query: String,
    pub select_query: String,
    /// Every n-th source id becomes testing data; 0 stores everything as training
    pub testing_every: i64,
    /// Rows copied per run
    pub batch_limit: i64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            id: Uuid::nil(),
            description: String::new(),
            model_name: String::new(),
            enabled: true,
            count_query: String::new(),
            select_query: String::new(),
            testing_every: 10,
            batch_limit: 10_000,
        }
    }
}

impl CollectorConfig {
    pub fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor {
            id: self.id,
            description: self.description.clone(),
            model_name: self.model_name.clone(),
            enabled: self.enabled,
        }
    }

    pub fn default_status(&self) -> JobStatus {
        JobStatus::new(self.batch_limit, self.batch_limit)
    }

    fn is_testing(&self, source_id: i64) -> bool {
        self.testing_every > 0 && source_id % self.testing_every == 0
    }
}

pub struct DataCollector {
    descriptor: ServiceDescriptor,
    config: CollectorConfig,
    source: Arc<dyn CollectorSource>,
    store: Arc<dyn DataStore>,
    slot: StatusSlot,
}

impl DataCollector {
    pub fn new(
        config: CollectorConfig,
        source: Arc<dyn CollectorSource>,
        store: Arc<dyn DataStore>,
        slot: StatusSlot,
    ) -> Self {
        Self {
            descriptor: config.descriptor(),
            config,
            source,
            store,
            slot,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.slot.get()
    }
}

#[async_trait]
impl MaintenanceService for DataCollector {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn kind(&self) -> ServiceKind {
        ServiceKind::DataCollector
    }

    fn is_configured(&self) -> bool {
        !self.config.model_name.trim().is_empty()
            && !self.config.count_query.trim().is_empty()
            && !self.config.select_query.trim().is_empty()
    }

    async fn unprocessed_count(&self) -> MaintenanceResult<u64> {
        self.source.count_new(self.slot.get().last_id_processed).await
    }

    async fn process(&mut self, cancel: &CancellationToken) -> MaintenanceResult<ServiceOutcome> {
        if cancel.is_cancelled() {
            return Ok(ServiceOutcome::Cancelled);
        }

        let watermark = self.slot.get().last_id_processed;
        let rows = self
            .source
            .fetch_new(watermark, self.config.batch_limit.max(1))
            .await?;
        if rows.is_empty() {
            debug!(model = %self.config.model_name, watermark, "No new source rows");
            return Ok(ServiceOutcome::NothingToDo);
        }

        let records: Vec<NewRecord> = rows
            .iter()
            .map(|row| NewRecord {
                model_name: self.config.model_name.clone(),
                payload: row.payload.clone(),
                is_training_data: !self.config.is_testing(row.source_id),
            })
            .collect();
        let inserted = self.store.insert_records(&records).await?;

        let highest = rows.iter().map(|r| r.source_id).max().unwrap_or(watermark);
        self.slot.update(|s| s.advance_watermark(highest));
        self.slot.persist(self.store.as_ref()).await?;

        info!(
            model = %self.config.model_name,
            inserted,
            watermark = highest,
            "Collected new records"
        );
        Ok(ServiceOutcome::Collected { records: inserted })
    }
}
