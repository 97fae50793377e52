//! Model trainer service
//!
//! One cycle trains over the newest unprocessed training batch, tests the
//! result, and publishes the artifact only when it passes acceptance:
//! - `Fresh` models are written from scratch by the trainer
//! - `Incremental` models are seeded from the published artifact first
//!
//! Publication stages the artifact next to its destination (optionally
//! through an encryption command), keeps the previous file as `<name>.bak`,
//! swaps it in with a rename and re-validates it. A failed re-validation
//! restores the backup.

use super::{MaintenanceService, ServiceOutcome};
use crate::acceptance::AcceptanceEvaluator;
use crate::error::{MaintenanceError, MaintenanceResult};
use crate::models::{PublishedModel, ServiceDescriptor, ServiceKind};
use crate::notify::{ExceptionLog, LogNotifier, Notification, Notifier};
use crate::observability::{MaintenanceMetrics, StructuredLogger};
use crate::retry::{AdaptiveRetryDriver, CyclePhase, CycleRequest, RetryOutcome, DEFAULT_BACKOFF_DIVISOR};
use crate::runner::{
    BatchFormat, CommandTemplate, ExternalJobRunner, PathTags, ProcessRunner, TAG_DESTINATION,
    TAG_MODEL_FILE, TAG_PUBLISHED_MODEL, TAG_SOURCE,
};
use crate::status::{JobStatus, StatusSlot};
use crate::store::DataStore;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How the trainer produces its artifact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFlavor {
    /// Trainer writes a new model file
    #[default]
    Fresh,
    /// Trainer updates a copy of the published model in place
    Incremental,
}

/// Configuration of one model trainer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Stable identity; keys the persisted status
    pub id: Uuid,
    pub description: String,
    pub model_name: String,
    pub enabled: bool,
    pub flavor: ModelFlavor,
    pub batch_format: BatchFormat,
    /// Tags: `<DataFile>`, `<ModelFile>`, `<PublishedModel>`
    pub train_command: CommandTemplate,
    pub test_command: CommandTemplate,
    /// Tags: `<Source>`, `<Destination>`
    pub encrypt_command: Option<CommandTemplate>,
    /// Tag: `<ModelFile>`; exit 0 means the artifact loads
    pub validate_command: Option<CommandTemplate>,
    pub published_model: PathBuf,
    pub minimum_score: f64,
    pub allowable_drop: f64,
    pub max_training_batch: i64,
    pub max_testing_batch: i64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            id: Uuid::nil(),
            description: String::new(),
            model_name: String::new(),
            enabled: true,
            flavor: ModelFlavor::Fresh,
            batch_format: BatchFormat::Raw,
            train_command: CommandTemplate::default(),
            test_command: CommandTemplate::default(),
            encrypt_command: None,
            validate_command: None,
            published_model: PathBuf::new(),
            minimum_score: 0.0,
            allowable_drop: 0.0,
            max_training_batch: 10_000,
            max_testing_batch: 10_000,
        }
    }
}

impl TrainerConfig {
    pub fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor {
            id: self.id,
            description: self.description.clone(),
            model_name: self.model_name.clone(),
            enabled: self.enabled,
        }
    }

    /// Status of a trainer that has never run
    pub fn default_status(&self) -> JobStatus {
        JobStatus::new(self.max_training_batch, self.max_testing_batch)
    }
}

/// The train/test/publish service for one model
pub struct ModelTrainer {
    descriptor: ServiceDescriptor,
    config: TrainerConfig,
    store: Arc<dyn DataStore>,
    runner: ExternalJobRunner,
    notifier: Arc<dyn Notifier>,
    recipients: Vec<String>,
    slot: StatusSlot,
    work_dir: PathBuf,
    backoff_divisor: i64,
    metrics: MaintenanceMetrics,
    logger: StructuredLogger,
}

impl ModelTrainer {
    pub fn new(
        config: TrainerConfig,
        store: Arc<dyn DataStore>,
        process_runner: Arc<dyn ProcessRunner>,
        slot: StatusSlot,
    ) -> Self {
        let work_dir = std::env::temp_dir().join("mlmaint");
        Self {
            descriptor: config.descriptor(),
            runner: ExternalJobRunner::new(process_runner, work_dir.clone(), config.batch_format),
            config,
            store,
            notifier: Arc::new(LogNotifier),
            recipients: Vec::new(),
            slot,
            work_dir,
            backoff_divisor: DEFAULT_BACKOFF_DIVISOR,
            metrics: MaintenanceMetrics::new(),
            logger: StructuredLogger::new("trainer"),
        }
    }

    /// Directory for batch files, working artifacts and exception logs
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self.runner = ExternalJobRunner::new(
            self.runner.process_runner().clone(),
            self.work_dir.clone(),
            self.config.batch_format,
        );
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>, recipients: Vec<String>) -> Self {
        self.notifier = notifier;
        self.recipients = recipients;
        self
    }

    pub fn with_backoff_divisor(mut self, divisor: i64) -> Self {
        self.backoff_divisor = divisor;
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn status(&self) -> JobStatus {
        self.slot.get()
    }

    async fn run_cycle(
        &mut self,
        cycle_dir: &Path,
        exceptions: &mut ExceptionLog,
        cancel: &CancellationToken,
    ) -> MaintenanceResult<ServiceOutcome> {
        let status = self.slot.get();
        let model = self.config.model_name.clone();
        let published = self.config.published_model.clone();
        let working = cycle_dir.join(
            published
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "model.bin".into()),
        );

        if self.config.flavor == ModelFlavor::Incremental && published.exists() {
            self.check_integrity(&published).await?;
            std::fs::copy(&published, &working)?;
            debug!(model = %model, from = %published.display(), "Seeded working model");
        }

        let tags = PathTags::new()
            .with_path(TAG_MODEL_FILE, &working)
            .with_path(TAG_PUBLISHED_MODEL, &published);
        let driver = AdaptiveRetryDriver::new(self.store.as_ref(), &self.runner, self.backoff_divisor)
            .with_logger(self.logger.clone());

        let training = match driver
            .run(
                CycleRequest {
                    model_name: &model,
                    phase: CyclePhase::Training,
                    after_id: status.last_id_processed,
                    cap: status.max_training_batch,
                    template: &self.config.train_command,
                    tags: &tags,
                },
                exceptions,
                cancel,
            )
            .await?
        {
            RetryOutcome::Success(success) => success,
            RetryOutcome::Empty => return Ok(ServiceOutcome::NothingToDo),
            RetryOutcome::Cancelled => return Ok(ServiceOutcome::Cancelled),
        };
        self.slot.update(|s| s.max_training_batch = training.cap);
        info!(model = %model, records = training.records, last_id = training.last_id, "Training finished");

        let testing = match driver
            .run(
                CycleRequest {
                    model_name: &model,
                    phase: CyclePhase::Testing,
                    after_id: status.last_id_processed,
                    cap: status.max_testing_batch,
                    template: &self.config.test_command,
                    tags: &tags,
                },
                exceptions,
                cancel,
            )
            .await?
        {
            RetryOutcome::Success(success) => success,
            RetryOutcome::Empty => return Ok(ServiceOutcome::NothingToDo),
            RetryOutcome::Cancelled => return Ok(ServiceOutcome::Cancelled),
        };
        self.slot.update(|s| s.max_testing_batch = testing.cap);

        let evaluator = AcceptanceEvaluator::new(self.config.minimum_score, self.config.allowable_drop);
        let result = evaluator.evaluate(
            &testing.output.combined_text(),
            status.last_score,
            training.first_id,
            training.last_id.max(testing.last_id),
        );
        self.logger
            .log_acceptance(&model, result.score, status.last_score, result.criteria_met);

        if !result.criteria_met {
            let reason = evaluator.rejection_reason(&result, status.last_score);
            exceptions.record("acceptance", &reason);
            self.metrics.inc_rejected(&model);
            return Ok(ServiceOutcome::Rejected {
                score: result.score,
                reason,
            });
        }

        let checksum = self.publish(&working, &published).await?;
        self.slot.update(|s| {
            s.advance_watermark(result.last_id_processed);
            s.last_score = result.score;
        });
        let last_id_processed = self.slot.get().last_id_processed;

        self.store
            .record_published_model(&PublishedModel {
                model_name: model.clone(),
                checksum: checksum.clone(),
                score: result.score,
                last_id_processed,
                published_at: Utc::now(),
            })
            .await?;
        self.metrics.record_published(&model, result.score);
        self.logger.log_publication(&model, &checksum, last_id_processed);

        Ok(ServiceOutcome::Published {
            score: result.score,
            last_id_processed,
        })
    }

    /// Swap `working` into `published`, returning the new checksum
    async fn publish(&self, working: &Path, published: &Path) -> MaintenanceResult<String> {
        self.check_integrity(working).await?;

        let dir = published
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let file_name = published
            .file_name()
            .ok_or_else(|| {
                MaintenanceError::Configuration(format!(
                    "published model path {} has no file name",
                    published.display()
                ))
            })?
            .to_string_lossy()
            .into_owned();
        let staged = dir.join(format!(".{}.staged", file_name));
        let backup = dir.join(format!("{}.bak", file_name));

        match self.config.encrypt_command.as_ref().filter(|t| !t.is_empty()) {
            Some(template) => {
                let tags = PathTags::new()
                    .with_path(TAG_SOURCE, working)
                    .with_path(TAG_DESTINATION, &staged);
                let output = self.runner.process_runner().run(&template.expand(&tags)?).await?;
                if !output.success() {
                    let _ = std::fs::remove_file(&staged);
                    return Err(MaintenanceError::ToolFailure {
                        exit_code: output.exit_code,
                        message: format!("encryption failed: {}", output.error_text()),
                    });
                }
            }
            None => {
                std::fs::copy(working, &staged)?;
            }
        }

        let had_previous = published.exists();
        if had_previous {
            std::fs::copy(published, &backup)?;
        }
        std::fs::rename(&staged, published)?;

        if let Err(e) = self.check_integrity(published).await {
            warn!(path = %published.display(), error = %e, "Published model failed validation, rolling back");
            if had_previous {
                std::fs::rename(&backup, published)?;
            } else {
                std::fs::remove_file(published)?;
            }
            return Err(e);
        }

        file_checksum(published)
    }

    /// The artifact exists, is non-empty and passes the validate command
    async fn check_integrity(&self, path: &Path) -> MaintenanceResult<()> {
        let len = std::fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| MaintenanceError::ArtifactIntegrity(format!("{}: {}", path.display(), e)))?;
        if len == 0 {
            return Err(MaintenanceError::ArtifactIntegrity(format!(
                "{} is empty",
                path.display()
            )));
        }

        if let Some(template) = self.config.validate_command.as_ref().filter(|t| !t.is_empty()) {
            let command = template.expand(&PathTags::new().with_path(TAG_MODEL_FILE, path))?;
            let output = self.runner.process_runner().run(&command).await?;
            if !output.success() {
                return Err(MaintenanceError::ArtifactIntegrity(format!(
                    "{} failed validation: {}",
                    path.display(),
                    output.error_text()
                )));
            }
        }
        Ok(())
    }

    async fn notify(&self, subject: String, body: String, exceptions: &ExceptionLog) {
        if self.recipients.is_empty() {
            debug!(model = %self.config.model_name, "No recipients configured, skipping notification");
            return;
        }
        let notification = Notification {
            subject,
            body,
            recipients: self.recipients.clone(),
            attachment: (!exceptions.is_empty()).then(|| exceptions.path().to_path_buf()),
        };
        if let Err(e) = self.notifier.notify(&notification).await {
            warn!(model = %self.config.model_name, error = %e, "Failed to send notification");
        }
    }
}

fn file_checksum(path: &Path) -> MaintenanceResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

fn notifies(err: &MaintenanceError) -> bool {
    matches!(
        err,
        MaintenanceError::ToolFailure { .. }
            | MaintenanceError::ResourceExhausted { .. }
            | MaintenanceError::ArtifactIntegrity(_)
    )
}

#[async_trait]
impl MaintenanceService for ModelTrainer {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn kind(&self) -> ServiceKind {
        ServiceKind::ModelTrainer
    }

    fn is_configured(&self) -> bool {
        !self.config.train_command.is_empty()
            && !self.config.test_command.is_empty()
            && !self.config.published_model.as_os_str().is_empty()
    }

    async fn unprocessed_count(&self) -> MaintenanceResult<u64> {
        self.store
            .count_unprocessed(&self.config.model_name, true, self.slot.get().last_id_processed)
            .await
    }

    async fn process(&mut self, cancel: &CancellationToken) -> MaintenanceResult<ServiceOutcome> {
        std::fs::create_dir_all(&self.work_dir)?;
        let cycle_dir = tempfile::Builder::new()
            .prefix("cycle-")
            .tempdir_in(&self.work_dir)?;
        let mut exceptions = ExceptionLog::create(&self.work_dir, &self.config.model_name)?;

        let result = self.run_cycle(cycle_dir.path(), &mut exceptions, cancel).await;

        match &result {
            Ok(ServiceOutcome::Rejected { reason, .. }) => {
                let subject = format!("{}: model rejected", self.descriptor.description);
                self.notify(subject, reason.clone(), &exceptions).await;
            }
            Err(e) if notifies(e) => {
                if let MaintenanceError::ArtifactIntegrity(message) = e {
                    exceptions.record("publish", message);
                }
                let subject = format!("{}: training failed", self.descriptor.description);
                self.notify(subject, e.to_string(), &exceptions).await;
            }
            _ => {}
        }

        if let Err(e) = self.slot.persist(self.store.as_ref()).await {
            if result.is_ok() {
                return Err(e);
            }
            warn!(model = %self.config.model_name, error = %e, "Failed to persist status after failed cycle");
        }
        result
    }
}
