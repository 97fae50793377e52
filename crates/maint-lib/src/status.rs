//! Durable per-job progress and the coordinator's status board
//!
//! Each job owns a [`JobStatus`] (watermark, last accepted score and batch
//! caps). Jobs run by the coordinator share one [`StatusBoard`] that also
//! carries the audit log; standalone jobs keep their own record. Both are
//! persisted as versioned JSON blobs through the data store.

use crate::audit_log::RunLog;
use crate::error::{MaintenanceError, MaintenanceResult};
use crate::store::DataStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// Schema version written by this build
pub const STATUS_VERSION: u32 = 1;

/// Incremental progress of one job
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub last_id_processed: i64,
    pub last_score: f64,
    pub max_training_batch: i64,
    pub max_testing_batch: i64,
}

impl JobStatus {
    pub fn new(max_training_batch: i64, max_testing_batch: i64) -> Self {
        Self {
            last_id_processed: 0,
            last_score: 0.0,
            max_training_batch,
            max_testing_batch,
        }
    }

    /// Move the watermark forward; it never moves back
    pub fn advance_watermark(&mut self, last_id: i64) {
        self.last_id_processed = self.last_id_processed.max(last_id);
    }

    pub fn to_blob(&self) -> MaintenanceResult<String> {
        Ok(serde_json::to_string(&JobStatusRecord {
            version: STATUS_VERSION,
            status: *self,
        })?)
    }

    pub fn from_blob(blob: &str) -> MaintenanceResult<Self> {
        check_version(blob)?;
        let record: JobStatusRecord = serde_json::from_str(blob)?;
        Ok(record.status)
    }
}

#[derive(Serialize, Deserialize)]
struct JobStatusRecord {
    version: u32,
    #[serde(flatten)]
    status: JobStatus,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

fn check_version(blob: &str) -> MaintenanceResult<()> {
    let probe: VersionProbe = serde_json::from_str(blob)?;
    if probe.version > STATUS_VERSION {
        return Err(MaintenanceError::ConfigurationVersion {
            found: probe.version,
            supported: STATUS_VERSION,
        });
    }
    Ok(())
}

/// Audit log plus every job's status
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoordinatorStatus {
    pub log: RunLog,
    pub jobs: HashMap<Uuid, JobStatus>,
}

#[derive(Serialize, Deserialize)]
struct CoordinatorStatusRecord {
    version: u32,
    log: String,
    per_job_status: HashMap<Uuid, JobStatus>,
}

impl CoordinatorStatus {
    pub fn to_blob(&self) -> MaintenanceResult<String> {
        Ok(serde_json::to_string(&CoordinatorStatusRecord {
            version: STATUS_VERSION,
            log: self.log.to_persisted(),
            per_job_status: self.jobs.clone(),
        })?)
    }

    pub fn from_blob(blob: &str) -> MaintenanceResult<Self> {
        check_version(blob)?;
        let record: CoordinatorStatusRecord = serde_json::from_str(blob)?;
        Ok(Self {
            log: RunLog::from_persisted(&record.log),
            jobs: record.per_job_status,
        })
    }
}

/// Shared, persistable coordinator status
#[derive(Debug)]
pub struct StatusBoard {
    id: Uuid,
    inner: Mutex<CoordinatorStatus>,
}

impl StatusBoard {
    pub fn new(id: Uuid, status: CoordinatorStatus) -> Self {
        Self {
            id,
            inner: Mutex::new(status),
        }
    }

    /// Load the board saved under `id`, or start an empty one
    pub async fn load(store: &dyn DataStore, id: Uuid) -> MaintenanceResult<Arc<Self>> {
        let status = match store.load_status(&id.to_string()).await? {
            Some(blob) => CoordinatorStatus::from_blob(&blob)?,
            None => CoordinatorStatus::default(),
        };
        Ok(Arc::new(Self::new(id, status)))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorStatus> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn job(&self, id: &Uuid) -> Option<JobStatus> {
        self.lock().jobs.get(id).copied()
    }

    /// Existing status for `id`, creating it from `default` on first sight
    pub fn ensure_job(&self, id: Uuid, default: JobStatus) -> JobStatus {
        *self.lock().jobs.entry(id).or_insert(default)
    }

    pub fn set_job(&self, id: Uuid, status: JobStatus) {
        self.lock().jobs.insert(id, status);
    }

    pub fn jobs(&self) -> HashMap<Uuid, JobStatus> {
        self.lock().jobs.clone()
    }

    pub fn append_log(&self, text: impl AsRef<str>) {
        self.lock().log.append(text);
    }

    pub fn log(&self) -> RunLog {
        self.lock().log.clone()
    }

    pub fn snapshot(&self) -> CoordinatorStatus {
        self.lock().clone()
    }

    /// Save the whole board. The blob is built before the store call so the
    /// lock is never held across an await point.
    pub async fn persist(&self, store: &dyn DataStore) -> MaintenanceResult<()> {
        let blob = self.lock().to_blob()?;
        store.save_status(&self.id.to_string(), &blob).await?;
        debug!(board = %self.id, bytes = blob.len(), "Status board persisted");
        Ok(())
    }
}

/// Where a job's status lives, fixed at construction
#[derive(Debug)]
pub enum StatusSlot {
    /// Job run on its own; persisted under the job id
    Local { id: Uuid, status: JobStatus },
    /// Job run by the coordinator; persisted with the whole board
    Attached { id: Uuid, board: Arc<StatusBoard> },
}

impl StatusSlot {
    pub fn local(id: Uuid, status: JobStatus) -> Self {
        StatusSlot::Local { id, status }
    }

    /// Load a standalone job's status, falling back to `default`
    pub async fn load_local(
        store: &dyn DataStore,
        id: Uuid,
        default: JobStatus,
    ) -> MaintenanceResult<Self> {
        let status = match store.load_status(&id.to_string()).await? {
            Some(blob) => JobStatus::from_blob(&blob)?,
            None => default,
        };
        Ok(Self::local(id, status))
    }

    /// Attach to the board, registering `default` when the job is new
    pub fn attached(id: Uuid, board: Arc<StatusBoard>, default: JobStatus) -> Self {
        board.ensure_job(id, default);
        StatusSlot::Attached { id, board }
    }

    pub fn id(&self) -> Uuid {
        match self {
            StatusSlot::Local { id, .. } | StatusSlot::Attached { id, .. } => *id,
        }
    }

    pub fn get(&self) -> JobStatus {
        match self {
            StatusSlot::Local { status, .. } => *status,
            StatusSlot::Attached { id, board } => board.job(id).unwrap_or_else(|| JobStatus::new(0, 0)),
        }
    }

    pub fn update(&mut self, f: impl FnOnce(&mut JobStatus)) {
        match self {
            StatusSlot::Local { status, .. } => f(status),
            StatusSlot::Attached { id, board } => {
                let mut status = board.job(id).unwrap_or_else(|| JobStatus::new(0, 0));
                f(&mut status);
                board.set_job(*id, status);
            }
        }
    }

    pub async fn persist(&self, store: &dyn DataStore) -> MaintenanceResult<()> {
        match self {
            StatusSlot::Local { id, status } => {
                store.save_status(&id.to_string(), &status.to_blob()?).await
            }
            StatusSlot::Attached { board, .. } => board.persist(store).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryDataStore;

    #[test]
    fn test_job_status_blob_round_trip() {
        let status = JobStatus {
            last_id_processed: 12,
            last_score: 0.8,
            max_training_batch: 70,
            max_testing_batch: 50,
        };
        let blob = status.to_blob().unwrap();
        assert!(blob.contains("\"version\":1"));
        assert_eq!(JobStatus::from_blob(&blob).unwrap(), status);
    }

    #[test]
    fn test_newer_version_is_rejected() {
        let blob = r#"{"version":2,"last_id_processed":1,"last_score":0.5,"max_training_batch":10,"max_testing_batch":10}"#;
        match JobStatus::from_blob(blob) {
            Err(MaintenanceError::ConfigurationVersion { found, supported }) => {
                assert_eq!(found, 2);
                assert_eq!(supported, STATUS_VERSION);
            }
            other => panic!("unexpected: {:?}", other),
        }

        let board = r#"{"version":7,"log":"","per_job_status":{}}"#;
        assert!(matches!(
            CoordinatorStatus::from_blob(board),
            Err(MaintenanceError::ConfigurationVersion { .. })
        ));
    }

    #[test]
    fn test_watermark_never_moves_back() {
        let mut status = JobStatus::new(10, 10);
        status.advance_watermark(12);
        status.advance_watermark(5);
        assert_eq!(status.last_id_processed, 12);
    }

    #[test]
    fn test_coordinator_status_round_trip() {
        let mut status = CoordinatorStatus::default();
        status.log.append("Invoices: starting");
        status.log.append("Invoices: done");
        let id = Uuid::new_v4();
        status.jobs.insert(id, JobStatus::new(100, 50));

        let restored = CoordinatorStatus::from_blob(&status.to_blob().unwrap()).unwrap();
        assert_eq!(restored, status);
    }

    #[tokio::test]
    async fn test_attached_slot_writes_through_board() {
        let store = MemoryDataStore::new();
        let board = StatusBoard::load(&store, Uuid::new_v4()).await.unwrap();
        let job_id = Uuid::new_v4();

        let mut slot = StatusSlot::attached(job_id, board.clone(), JobStatus::new(100, 50));
        slot.update(|s| s.advance_watermark(42));
        slot.persist(&store).await.unwrap();

        assert_eq!(board.job(&job_id).unwrap().last_id_processed, 42);

        let reloaded = StatusBoard::load(&store, board.id()).await.unwrap();
        assert_eq!(reloaded.job(&job_id).unwrap().last_id_processed, 42);
    }

    #[tokio::test]
    async fn test_attached_slot_keeps_existing_status() {
        let store = MemoryDataStore::new();
        let board = StatusBoard::load(&store, Uuid::new_v4()).await.unwrap();
        let job_id = Uuid::new_v4();
        let mut existing = JobStatus::new(70, 50);
        existing.last_id_processed = 9;
        board.set_job(job_id, existing);

        let slot = StatusSlot::attached(job_id, board, JobStatus::new(100, 100));
        assert_eq!(slot.get(), existing);
    }

    #[tokio::test]
    async fn test_local_slot_persists_under_job_id() {
        let store = MemoryDataStore::new();
        let job_id = Uuid::new_v4();

        let mut slot = StatusSlot::load_local(&store, job_id, JobStatus::new(10, 10))
            .await
            .unwrap();
        slot.update(|s| s.last_score = 0.75);
        slot.persist(&store).await.unwrap();

        let reloaded = StatusSlot::load_local(&store, job_id, JobStatus::new(1, 1))
            .await
            .unwrap();
        assert_eq!(reloaded.get().last_score, 0.75);
        assert_eq!(reloaded.get().max_training_batch, 10);
    }

    #[tokio::test]
    async fn test_board_load_fails_on_newer_version() {
        let store = MemoryDataStore::new();
        let id = Uuid::new_v4();
        store.put_status(&id.to_string(), r#"{"version":99,"log":"","per_job_status":{}}"#);

        let err = StatusBoard::load(&store, id).await.unwrap_err();
        assert!(err.is_run_fatal());
    }

    #[test]
    fn test_board_starts_empty_without_saved_record() {
        let store = MemoryDataStore::new();
        let board = tokio_test::block_on(StatusBoard::load(&store, Uuid::new_v4())).unwrap();

        assert!(board.log().is_empty());
        assert!(board.jobs().is_empty());
        tokio_test::assert_ok!(tokio_test::block_on(board.persist(&store)));
        assert_eq!(store.status_saves(), vec![board.id().to_string()]);
    }
}
