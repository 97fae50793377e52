//! In-memory data store used by unit tests

use super::DataStore;
use crate::error::{MaintenanceError, MaintenanceResult};
use crate::models::{BatchQuery, BatchRecord, DataRecord, NewRecord, PublishedModel};
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub(crate) struct MemoryDataStore {
    records: Mutex<Vec<DataRecord>>,
    statuses: Mutex<HashMap<String, String>>,
    published: Mutex<Vec<PublishedModel>>,
    fetches: Mutex<Vec<BatchQuery>>,
    status_saves: Mutex<Vec<String>>,
    fail_counts: Mutex<bool>,
}

impl MemoryDataStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a row with an explicit id; timestamps follow id order
    pub(crate) fn add(&self, id: i64, model: &str, training: bool) {
        self.add_with(id, model, training, false);
    }

    pub(crate) fn add_with(&self, id: i64, model: &str, training: bool, deletable: bool) {
        let created_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(id);
        self.records.lock().unwrap().push(DataRecord {
            id,
            model_name: model.to_string(),
            payload: format!("payload-{}", id),
            is_training_data: training,
            can_be_deleted: deletable,
            created_at,
        });
    }

    pub(crate) fn fetches(&self) -> Vec<BatchQuery> {
        self.fetches.lock().unwrap().clone()
    }

    pub(crate) fn published(&self) -> Vec<PublishedModel> {
        self.published.lock().unwrap().clone()
    }

    pub(crate) fn status(&self, key: &str) -> Option<String> {
        self.statuses.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn put_status(&self, key: &str, blob: &str) {
        self.statuses
            .lock()
            .unwrap()
            .insert(key.to_string(), blob.to_string());
    }

    pub(crate) fn status_saves(&self) -> Vec<String> {
        self.status_saves.lock().unwrap().clone()
    }

    pub(crate) fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub(crate) fn records(&self) -> Vec<DataRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Make count queries fail with a data access error
    pub(crate) fn fail_counts(&self) {
        *self.fail_counts.lock().unwrap() = true;
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn fetch_batch(&self, query: &BatchQuery) -> MaintenanceResult<Vec<BatchRecord>> {
        self.fetches.lock().unwrap().push(query.clone());

        let records = self.records.lock().unwrap();
        let mut matching: Vec<&DataRecord> = records
            .iter()
            .filter(|r| {
                r.model_name == query.model_name
                    && r.is_training_data == query.is_training
                    && !r.can_be_deleted
                    && r.id > query.after_id
            })
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        matching.truncate(query.max_records.max(0) as usize);

        let mut batch: Vec<BatchRecord> = matching
            .into_iter()
            .map(|r| BatchRecord {
                id: r.id,
                payload: r.payload.clone(),
            })
            .collect();
        batch.sort_by_key(|r| r.id);
        Ok(batch)
    }

    async fn count_unprocessed(
        &self,
        model_name: &str,
        is_training: bool,
        last_id: i64,
    ) -> MaintenanceResult<u64> {
        if *self.fail_counts.lock().unwrap() {
            return Err(MaintenanceError::DataAccess("connection refused".to_string()));
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| {
                r.model_name == model_name
                    && r.is_training_data == is_training
                    && !r.can_be_deleted
                    && r.id > last_id
            })
            .count() as u64)
    }

    async fn count_processed_under_cap(
        &self,
        model_name: &str,
        is_training: bool,
        last_id: i64,
        cap: i64,
    ) -> MaintenanceResult<u64> {
        let count = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| {
                r.model_name == model_name && r.is_training_data == is_training && r.id <= last_id
            })
            .count() as u64;
        Ok(count.min(cap.max(0) as u64))
    }

    async fn delete_marked(&self) -> MaintenanceResult<u64> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|r| !r.can_be_deleted);
        Ok((before - records.len()) as u64)
    }

    async fn insert_records(&self, new: &[NewRecord]) -> MaintenanceResult<u64> {
        let mut records = self.records.lock().unwrap();
        let mut next_id = records.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        for record in new {
            records.push(DataRecord {
                id: next_id,
                model_name: record.model_name.clone(),
                payload: record.payload.clone(),
                is_training_data: record.is_training_data,
                can_be_deleted: false,
                created_at: Utc::now(),
            });
            next_id += 1;
        }
        Ok(new.len() as u64)
    }

    async fn mark_model_deletable(&self, model_name: &str) -> MaintenanceResult<u64> {
        let mut records = self.records.lock().unwrap();
        let mut marked = 0;
        for record in records.iter_mut().filter(|r| r.model_name == model_name) {
            record.can_be_deleted = true;
            marked += 1;
        }
        Ok(marked)
    }

    async fn record_published_model(&self, model: &PublishedModel) -> MaintenanceResult<()> {
        self.published.lock().unwrap().push(model.clone());
        Ok(())
    }

    async fn load_status(&self, key: &str) -> MaintenanceResult<Option<String>> {
        Ok(self.status(key))
    }

    async fn save_status(&self, key: &str, blob: &str) -> MaintenanceResult<()> {
        self.status_saves.lock().unwrap().push(key.to_string());
        self.put_status(key, blob);
        Ok(())
    }
}
