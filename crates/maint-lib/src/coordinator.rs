//! Training coordinator
//!
//! Runs every enabled service once per invocation, data collectors before
//! model trainers, strictly one at a time. Services without enough new data
//! are skipped, every decision lands in the audit log, and the status board
//! is persisted after each job and at the end of the run. Rows flagged
//! deletable are purged when a run completes without cancellation.

use crate::error::{root_message, MaintenanceResult};
use crate::job::{
    DataCollector, MaintenanceService, ModelTrainer, ServiceOutcome, SqlCollectorSource,
};
use crate::models::ServiceKind;
use crate::notify::{CommandNotifier, LogNotifier, Notifier};
use crate::observability::{MaintenanceMetrics, StructuredLogger};
use crate::runner::ProcessRunner;
use crate::settings::Settings;
use crate::status::{StatusBoard, StatusSlot};
use crate::store::{DataStore, SqliteDataStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Run-wide policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Trainers with fewer new records are skipped
    pub minimum_new_records_for_training: u64,
    /// Purge rows flagged deletable after a completed run
    pub cleanup_enabled: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            minimum_new_records_for_training: 100,
            cleanup_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Cancelled,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What one run did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub state: RunState,
    pub started: usize,
    pub skipped: usize,
    pub failed: usize,
    pub deleted: u64,
}

pub struct TrainingCoordinator {
    config: CoordinatorConfig,
    store: Arc<dyn DataStore>,
    board: Arc<StatusBoard>,
    collectors: Vec<Box<dyn MaintenanceService>>,
    trainers: Vec<Box<dyn MaintenanceService>>,
    state: RunState,
    metrics: MaintenanceMetrics,
    logger: StructuredLogger,
}

impl TrainingCoordinator {
    pub fn new(config: CoordinatorConfig, store: Arc<dyn DataStore>, board: Arc<StatusBoard>) -> Self {
        Self {
            config,
            store,
            board,
            collectors: Vec::new(),
            trainers: Vec::new(),
            state: RunState::Idle,
            metrics: MaintenanceMetrics::new(),
            logger: StructuredLogger::new("coordinator"),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Build the configured services, attaching their status to the board
    /// saved under the coordinator id
    pub async fn from_settings(
        settings: &Settings,
        store: SqliteDataStore,
        process_runner: Arc<dyn ProcessRunner>,
    ) -> MaintenanceResult<Self> {
        let shared: Arc<dyn DataStore> = Arc::new(store.clone());
        let board = StatusBoard::load(shared.as_ref(), settings.coordinator_id).await?;
        let logger = StructuredLogger::new(&settings.instance_name);

        let notifier: Arc<dyn Notifier> = match settings
            .notification
            .mail_command
            .as_ref()
            .filter(|t| !t.is_empty())
        {
            Some(template) => Arc::new(CommandNotifier::new(
                template.clone(),
                process_runner.clone(),
                settings.work_dir.clone(),
            )),
            None => Arc::new(LogNotifier),
        };

        let mut coordinator = Self::new(settings.coordinator_config(), shared.clone(), board.clone())
            .with_logger(logger.clone());

        for config in &settings.collectors {
            let slot = StatusSlot::attached(config.id, board.clone(), config.default_status());
            let source = Arc::new(SqlCollectorSource::new(
                store.clone(),
                config.count_query.clone(),
                config.select_query.clone(),
            ));
            coordinator.add_collector(Box::new(DataCollector::new(
                config.clone(),
                source,
                shared.clone(),
                slot,
            )));
        }

        for config in &settings.trainers {
            let slot = StatusSlot::attached(config.id, board.clone(), config.default_status());
            let trainer = ModelTrainer::new(config.clone(), shared.clone(), process_runner.clone(), slot)
                .with_work_dir(settings.work_dir.clone())
                .with_notifier(notifier.clone(), settings.notification.recipients.clone())
                .with_backoff_divisor(settings.backoff_significance_divisor)
                .with_logger(logger.clone());
            coordinator.add_trainer(Box::new(trainer));
        }

        info!(
            coordinator = %settings.coordinator_id,
            collectors = settings.collectors.len(),
            trainers = settings.trainers.len(),
            "Coordinator configured"
        );
        Ok(coordinator)
    }

    pub fn add_collector(&mut self, service: Box<dyn MaintenanceService>) {
        self.collectors.push(service);
    }

    pub fn add_trainer(&mut self, service: Box<dyn MaintenanceService>) {
        self.trainers.push(service);
    }

    pub fn board(&self) -> &Arc<StatusBoard> {
        &self.board
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Run every enabled service once
    ///
    /// Job failures are logged and the loop moves on; only run-fatal errors
    /// (a status record from a newer schema) abort the run.
    pub async fn run(&mut self, cancel: &CancellationToken) -> MaintenanceResult<RunSummary> {
        self.state = RunState::Running;
        let mut summary = RunSummary {
            state: RunState::Running,
            started: 0,
            skipped: 0,
            failed: 0,
            deleted: 0,
        };
        self.logger
            .log_run_started(self.collectors.len() + self.trainers.len());

        let board = &self.board;
        let store = self.store.as_ref();
        let metrics = &self.metrics;
        let logger = &self.logger;
        let minimum_for_training = self.config.minimum_new_records_for_training;

        for service in self.collectors.iter_mut().chain(self.trainers.iter_mut()) {
            if !service.descriptor().enabled {
                continue;
            }
            if cancel.is_cancelled() {
                break;
            }

            let description = service.descriptor().description.clone();

            if !service.is_configured() {
                board.append_log(format!("{}: not configured, skipped", description));
                summary.skipped += 1;
                metrics.inc_jobs_skipped();
                continue;
            }

            let count = match service.unprocessed_count().await {
                Ok(count) => count,
                Err(e) => {
                    let cause = root_message(&e);
                    board.append_log(format!("{}: error: {}", description, cause));
                    logger.log_job_error(&description, &cause);
                    summary.failed += 1;
                    metrics.inc_jobs_failed();
                    if e.is_run_fatal() {
                        board.persist(store).await?;
                        return Err(e);
                    }
                    continue;
                }
            };

            let threshold = match service.kind() {
                ServiceKind::DataCollector => 1,
                ServiceKind::ModelTrainer => minimum_for_training,
            };
            if count < threshold {
                board.append_log(format!(
                    "{}: insufficient data ({} new records)",
                    description, count
                ));
                summary.skipped += 1;
                metrics.inc_jobs_skipped();
                continue;
            }

            board.append_log(format!("{}: starting ({} new records)", description, count));
            summary.started += 1;
            metrics.inc_jobs_started();
            let started_at = Instant::now();

            match service.process(cancel).await {
                Ok(outcome) => {
                    board.append_log(format!("{}: done: {}", description, outcome));
                    logger.log_job_outcome(
                        &description,
                        &outcome.to_string(),
                        started_at.elapsed().as_secs_f64(),
                    );
                    if outcome == ServiceOutcome::Cancelled {
                        info!(service = %description, "Job stopped by cancellation");
                    }
                }
                Err(e) => {
                    let cause = root_message(&e);
                    board.append_log(format!("{}: error: {}", description, cause));
                    logger.log_job_error(&description, &cause);
                    summary.failed += 1;
                    metrics.inc_jobs_failed();
                    if e.is_run_fatal() {
                        board.persist(store).await?;
                        return Err(e);
                    }
                }
            }
            metrics.observe_job_duration(started_at.elapsed().as_secs_f64());

            if let Err(e) = board.persist(store).await {
                warn!(service = %description, error = %e, "Failed to persist status board");
            }
        }

        if cancel.is_cancelled() {
            board.append_log("Run cancelled");
            summary.state = RunState::Cancelled;
        } else {
            if self.config.cleanup_enabled {
                match store.delete_marked().await {
                    Ok(deleted) => {
                        board.append_log(format!("Removed {} records marked for deletion", deleted));
                        summary.deleted = deleted;
                        metrics.add_records_deleted(deleted);
                        logger.log_cleanup(deleted);
                    }
                    Err(e) => {
                        error!(error = %e, "Cleanup of deletable records failed");
                        board.append_log(format!("Cleanup error: {}", root_message(&e)));
                    }
                }
            }
            summary.state = RunState::Completed;
        }

        board.persist(store).await?;

        metrics.inc_runs(&summary.state.to_string());
        logger.log_run_finished(
            &summary.state.to_string(),
            summary.started,
            summary.skipped,
            summary.failed,
            summary.deleted,
        );
        self.state = summary.state;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MaintenanceError;
    use crate::job::TrainerConfig;
    use crate::models::ServiceDescriptor;
    use crate::runner::CommandTemplate;
    use crate::store::memory::MemoryDataStore;
    use crate::test_support::ScriptedRunner;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use uuid::Uuid;

    type Outcome = Box<dyn Fn() -> MaintenanceResult<ServiceOutcome> + Send + Sync>;

    struct FakeService {
        descriptor: ServiceDescriptor,
        kind: ServiceKind,
        configured: bool,
        count: Option<u64>,
        outcome: Outcome,
        cancel_on_process: Option<CancellationToken>,
        processed: Arc<Mutex<Vec<String>>>,
    }

    impl FakeService {
        fn new(name: &str, kind: ServiceKind, count: u64, processed: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                descriptor: ServiceDescriptor {
                    id: Uuid::new_v4(),
                    description: name.to_string(),
                    model_name: "Invoices".to_string(),
                    enabled: true,
                },
                kind,
                configured: true,
                count: Some(count),
                outcome: Box::new(|| Ok(ServiceOutcome::NothingToDo)),
                cancel_on_process: None,
                processed: processed.clone(),
            }
        }

        fn unconfigured(mut self) -> Self {
            self.configured = false;
            self
        }

        fn disabled(mut self) -> Self {
            self.descriptor.enabled = false;
            self
        }

        fn failing_count(mut self) -> Self {
            self.count = None;
            self
        }

        fn with_outcome(
            mut self,
            outcome: impl Fn() -> MaintenanceResult<ServiceOutcome> + Send + Sync + 'static,
        ) -> Self {
            self.outcome = Box::new(outcome);
            self
        }

        fn cancelling(mut self, token: &CancellationToken) -> Self {
            self.cancel_on_process = Some(token.clone());
            self
        }
    }

    #[async_trait]
    impl MaintenanceService for FakeService {
        fn descriptor(&self) -> &ServiceDescriptor {
            &self.descriptor
        }

        fn kind(&self) -> ServiceKind {
            self.kind
        }

        fn is_configured(&self) -> bool {
            self.configured
        }

        async fn unprocessed_count(&self) -> MaintenanceResult<u64> {
            self.count
                .ok_or_else(|| MaintenanceError::DataAccess("connection refused".to_string()))
        }

        async fn process(&mut self, _cancel: &CancellationToken) -> MaintenanceResult<ServiceOutcome> {
            self.processed
                .lock()
                .unwrap()
                .push(self.descriptor.description.clone());
            if let Some(token) = &self.cancel_on_process {
                token.cancel();
            }
            (self.outcome)()
        }
    }

    struct Harness {
        store: Arc<MemoryDataStore>,
        processed: Arc<Mutex<Vec<String>>>,
        coordinator: TrainingCoordinator,
    }

    async fn harness(config: CoordinatorConfig) -> Harness {
        let store = Arc::new(MemoryDataStore::new());
        let board = StatusBoard::load(store.as_ref(), Uuid::new_v4()).await.unwrap();
        Harness {
            coordinator: TrainingCoordinator::new(config, store.clone(), board),
            store,
            processed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn entries(coordinator: &TrainingCoordinator) -> Vec<String> {
        coordinator
            .board()
            .log()
            .entries()
            .map(str::to_string)
            .collect()
    }

    fn has_entry(coordinator: &TrainingCoordinator, text: &str) -> bool {
        coordinator.board().log().contains(text)
    }

    #[tokio::test]
    async fn test_collector_without_data_is_skipped_and_trainer_runs() {
        let mut h = harness(CoordinatorConfig::default()).await;
        h.coordinator.add_collector(Box::new(FakeService::new(
            "Invoice collector",
            ServiceKind::DataCollector,
            0,
            &h.processed,
        )));
        h.coordinator.add_trainer(Box::new(FakeService::new(
            "Invoice trainer",
            ServiceKind::ModelTrainer,
            500,
            &h.processed,
        )));

        let summary = h.coordinator.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.started, 1);
        assert_eq!(summary.skipped, 1);
        assert!(has_entry(&h.coordinator, "Invoice collector: insufficient data (0 new records)"));
        assert!(has_entry(&h.coordinator, "Invoice trainer: starting (500 new records)"));
        assert!(has_entry(&h.coordinator, "Invoice trainer: done: nothing to do"));
        assert_eq!(*h.processed.lock().unwrap(), vec!["Invoice trainer".to_string()]);
        assert_eq!(h.coordinator.state(), RunState::Completed);
    }

    #[tokio::test]
    async fn test_trainer_below_minimum_is_skipped() {
        let mut h = harness(CoordinatorConfig::default()).await;
        h.coordinator.add_collector(Box::new(FakeService::new(
            "Collector",
            ServiceKind::DataCollector,
            1,
            &h.processed,
        )));
        h.coordinator.add_trainer(Box::new(FakeService::new(
            "Trainer",
            ServiceKind::ModelTrainer,
            99,
            &h.processed,
        )));

        h.coordinator.run(&CancellationToken::new()).await.unwrap();

        assert!(has_entry(&h.coordinator, "Collector: starting (1 new records)"));
        assert!(has_entry(&h.coordinator, "Trainer: insufficient data (99 new records)"));
        // collectors always run before trainers
        assert_eq!(*h.processed.lock().unwrap(), vec!["Collector".to_string()]);
    }

    #[tokio::test]
    async fn test_cancellation_before_second_job() {
        let mut h = harness(CoordinatorConfig::default()).await;
        let cancel = CancellationToken::new();
        h.store.add_with(1, "Old", true, true);
        h.coordinator.add_trainer(Box::new(
            FakeService::new("First", ServiceKind::ModelTrainer, 500, &h.processed)
                .cancelling(&cancel)
                .with_outcome(|| Ok(ServiceOutcome::Published { score: 0.8, last_id_processed: 12 })),
        ));
        h.coordinator.add_trainer(Box::new(FakeService::new(
            "Second",
            ServiceKind::ModelTrainer,
            500,
            &h.processed,
        )));

        let summary = h.coordinator.run(&cancel).await.unwrap();

        assert_eq!(summary.state, RunState::Cancelled);
        assert!(has_entry(&h.coordinator, "First: done: model published"));
        assert!(!has_entry(&h.coordinator, "Second: starting"));
        assert!(has_entry(&h.coordinator, "Run cancelled"));
        assert_eq!(*h.processed.lock().unwrap(), vec!["First".to_string()]);

        // status saved after the first job; no cleanup on a cancelled run
        let board_key = h.coordinator.board().id().to_string();
        assert!(h.store.status_saves().iter().filter(|k| **k == board_key).count() >= 2);
        assert_eq!(h.store.record_count(), 1);
    }

    #[tokio::test]
    async fn test_unconfigured_and_disabled_services() {
        let mut h = harness(CoordinatorConfig::default()).await;
        h.coordinator.add_collector(Box::new(
            FakeService::new("Collector", ServiceKind::DataCollector, 5, &h.processed).unconfigured(),
        ));
        h.coordinator.add_trainer(Box::new(
            FakeService::new("Trainer", ServiceKind::ModelTrainer, 500, &h.processed).disabled(),
        ));

        let summary = h.coordinator.run(&CancellationToken::new()).await.unwrap();

        assert!(has_entry(&h.coordinator, "Collector: not configured, skipped"));
        assert!(!has_entry(&h.coordinator, "Trainer"));
        assert_eq!(summary.skipped, 1);
        assert!(h.processed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_job_errors_are_logged_and_loop_continues() {
        let mut h = harness(CoordinatorConfig::default()).await;
        h.coordinator.add_collector(Box::new(
            FakeService::new("Collector", ServiceKind::DataCollector, 5, &h.processed).failing_count(),
        ));
        h.coordinator.add_trainer(Box::new(
            FakeService::new("Broken", ServiceKind::ModelTrainer, 500, &h.processed).with_outcome(|| {
                Err(MaintenanceError::ToolFailure {
                    exit_code: 2,
                    message: "bad arguments".to_string(),
                })
            }),
        ));
        h.coordinator.add_trainer(Box::new(FakeService::new(
            "Healthy",
            ServiceKind::ModelTrainer,
            500,
            &h.processed,
        )));

        let summary = h.coordinator.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(summary.failed, 2);
        assert_eq!(summary.started, 2);
        assert!(has_entry(&h.coordinator, "Collector: error: data access error: connection refused"));
        assert!(has_entry(&h.coordinator, "Broken: error: external tool failed (exit code 2): bad arguments"));
        assert!(has_entry(&h.coordinator, "Healthy: done: nothing to do"));
    }

    #[tokio::test]
    async fn test_version_error_aborts_run() {
        let mut h = harness(CoordinatorConfig::default()).await;
        h.coordinator.add_trainer(Box::new(
            FakeService::new("Newer", ServiceKind::ModelTrainer, 500, &h.processed).with_outcome(|| {
                Err(MaintenanceError::ConfigurationVersion {
                    found: 2,
                    supported: 1,
                })
            }),
        ));
        h.coordinator.add_trainer(Box::new(FakeService::new(
            "Never",
            ServiceKind::ModelTrainer,
            500,
            &h.processed,
        )));

        let err = h.coordinator.run(&CancellationToken::new()).await.unwrap_err();

        assert!(err.is_run_fatal());
        assert!(!has_entry(&h.coordinator, "Never: starting"));
        assert!(has_entry(&h.coordinator, "Newer: error:"));
    }

    #[tokio::test]
    async fn test_cleanup_removes_marked_records() {
        let mut h = harness(CoordinatorConfig::default()).await;
        h.store.add_with(1, "Invoices", true, true);
        h.store.add_with(2, "Invoices", true, true);
        h.store.add(3, "Invoices", true);

        let summary = h.coordinator.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(summary.deleted, 2);
        assert_eq!(h.store.record_count(), 1);
        assert!(has_entry(&h.coordinator, "Removed 2 records marked for deletion"));

        let mut disabled = harness(CoordinatorConfig {
            cleanup_enabled: false,
            ..Default::default()
        })
        .await;
        disabled.store.add_with(1, "Invoices", true, true);
        disabled.coordinator.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(disabled.store.record_count(), 1);
    }

    #[tokio::test]
    async fn test_log_stays_bounded_across_runs() {
        let mut h = harness(CoordinatorConfig::default()).await;
        for i in 0..1000 {
            h.coordinator.board().append_log(format!("old entry {}", i));
        }
        h.coordinator.add_trainer(Box::new(FakeService::new(
            "Trainer",
            ServiceKind::ModelTrainer,
            500,
            &h.processed,
        )));

        h.coordinator.run(&CancellationToken::new()).await.unwrap();

        let log = entries(&h.coordinator);
        assert_eq!(log.len(), 1000);
        assert!(log.last().unwrap().ends_with("Removed 0 records marked for deletion"));
        assert!(!log.iter().any(|e| e.ends_with("old entry 0")));

        let saved = h.store.status(&h.coordinator.board().id().to_string()).unwrap();
        let restored = crate::status::CoordinatorStatus::from_blob(&saved).unwrap();
        assert_eq!(restored.log.len(), 1000);
    }

    #[tokio::test]
    async fn test_real_services_share_the_board() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryDataStore::new());
        for id in 10..=12 {
            store.add(id, "Invoices", true);
        }
        let board = StatusBoard::load(store.as_ref(), Uuid::new_v4()).await.unwrap();
        let mut coordinator = TrainingCoordinator::new(
            CoordinatorConfig {
                minimum_new_records_for_training: 3,
                cleanup_enabled: true,
            },
            store.clone(),
            board.clone(),
        );

        let config = TrainerConfig {
            id: Uuid::new_v4(),
            description: "Invoices".to_string(),
            model_name: "Invoices".to_string(),
            train_command: CommandTemplate::new("train <DataFile> <ModelFile>"),
            test_command: CommandTemplate::new("test <DataFile>"),
            published_model: dir.path().join("invoices.model"),
            minimum_score: 0.6,
            allowable_drop: 0.05,
            max_training_batch: 10,
            max_testing_batch: 10,
            ..Default::default()
        };
        let runner = Arc::new(
            ScriptedRunner::new()
                .then_write_arg(1, "weights", "")
                .then_ok("TOTAL: precision: 80%; recall: 80%; F1: 80%"),
        );
        let slot = StatusSlot::attached(config.id, board.clone(), config.default_status());
        let trainer_id = config.id;
        coordinator.add_trainer(Box::new(
            ModelTrainer::new(config, store.clone(), runner, slot).with_work_dir(dir.path().join("work")),
        ));

        coordinator.add_collector(Box::new(FakeService::new(
            "Invoice feed",
            ServiceKind::DataCollector,
            0,
            &Arc::new(Mutex::new(Vec::new())),
        )));

        coordinator.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(board.job(&trainer_id).unwrap().last_id_processed, 12);
        assert!(board.log().contains("Invoices: done: model published"));
        assert!(board.log().contains("Invoice feed: insufficient data (0 new records)"));

        let saved = store.status(&board.id().to_string()).unwrap();
        let restored = crate::status::CoordinatorStatus::from_blob(&saved).unwrap();
        assert_eq!(restored.jobs[&trainer_id].last_id_processed, 12);
    }
}
