//! Adaptive batch retry around the external tool
//!
//! One training or testing cycle: fetch a batch at the working cap, run the
//! tool over it, and on a memory failure shrink the cap and try again.
//!
//! The shrink halves the increment over what was already processed under the
//! same cap when that increment is significant, otherwise it drops a fixed
//! fraction (`1 / backoff_divisor`) of the batch. The divisor is a tunable
//! heuristic, not a derived constant.

use crate::error::{MaintenanceError, MaintenanceResult};
use crate::models::BatchQuery;
use crate::notify::ExceptionLog;
use crate::observability::{MaintenanceMetrics, StructuredLogger};
use crate::runner::{CommandTemplate, ExternalJobRunner, PathTags, ProcessOutput};
use crate::store::DataStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_BACKOFF_DIVISOR: i64 = 10;

/// Which half of a training cycle is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Training,
    Testing,
}

impl CyclePhase {
    pub fn is_training(&self) -> bool {
        matches!(self, CyclePhase::Training)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CyclePhase::Training => "training",
            CyclePhase::Testing => "testing",
        }
    }
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of one cycle
#[derive(Debug, Clone, Copy)]
pub struct CycleRequest<'a> {
    pub model_name: &'a str,
    pub phase: CyclePhase,
    /// Watermark; only rows with a greater id are fetched
    pub after_id: i64,
    pub cap: i64,
    pub template: &'a CommandTemplate,
    pub tags: &'a PathTags,
}

/// A cycle whose tool run exited with 0
#[derive(Debug, Clone, PartialEq)]
pub struct CycleSuccess {
    /// Smallest id in the batch, 0 for an empty batch
    pub first_id: i64,
    /// Largest id in the batch, 0 for an empty batch
    pub last_id: i64,
    pub records: usize,
    /// Cap that succeeded; becomes the default for the next run
    pub cap: i64,
    pub output: ProcessOutput,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    Success(CycleSuccess),
    /// No new training rows
    Empty,
    Cancelled,
}

/// Cap to retry with after a memory failure on a batch of `count` rows, of
/// which `previous` had already been processed under the same cap
pub fn next_cap(count: i64, previous: i64, divisor: i64) -> i64 {
    let diff = count - previous;
    let significant = (count / divisor.max(1)).max(1);
    if diff > significant {
        count - diff / 2
    } else {
        count - significant
    }
}

/// Drives the external tool until it succeeds, fails for good, or the batch
/// cannot shrink any further
pub struct AdaptiveRetryDriver<'a> {
    store: &'a dyn DataStore,
    runner: &'a ExternalJobRunner,
    divisor: i64,
    metrics: MaintenanceMetrics,
    logger: StructuredLogger,
}

impl<'a> AdaptiveRetryDriver<'a> {
    pub fn new(store: &'a dyn DataStore, runner: &'a ExternalJobRunner, divisor: i64) -> Self {
        Self {
            store,
            runner,
            divisor,
            metrics: MaintenanceMetrics::new(),
            logger: StructuredLogger::new("retry"),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub async fn run(
        &self,
        request: CycleRequest<'_>,
        exceptions: &mut ExceptionLog,
        cancel: &CancellationToken,
    ) -> MaintenanceResult<RetryOutcome> {
        let model = request.model_name;
        let phase = request.phase;
        let mut cap = request.cap;

        loop {
            if cancel.is_cancelled() {
                debug!(model = %model, phase = %phase, "Cycle cancelled before fetch");
                return Ok(RetryOutcome::Cancelled);
            }

            let batch = self
                .store
                .fetch_batch(&BatchQuery {
                    model_name: model.to_string(),
                    is_training: phase.is_training(),
                    max_records: cap,
                    after_id: request.after_id,
                })
                .await?;

            if batch.is_empty() && phase.is_training() {
                info!(model = %model, after_id = request.after_id, "No new training records");
                return Ok(RetryOutcome::Empty);
            }

            debug!(model = %model, phase = %phase, cap = cap, records = batch.len(), "Running external tool");
            let output = match self
                .runner
                .run_batch(&batch, request.template, request.tags)
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    exceptions.record(phase.as_str(), &e.to_string());
                    return Err(e);
                }
            };

            // the process was allowed to finish; its result no longer counts
            if cancel.is_cancelled() {
                info!(model = %model, phase = %phase, exit_code = output.exit_code, "Discarding tool result after cancellation");
                return Ok(RetryOutcome::Cancelled);
            }

            if output.success() {
                return Ok(RetryOutcome::Success(CycleSuccess {
                    first_id: batch.first().map_or(0, |r| r.id),
                    last_id: batch.last().map_or(0, |r| r.id),
                    records: batch.len(),
                    cap,
                    output,
                }));
            }

            if !output.indicates_memory_exhaustion() {
                let message = output.error_text();
                exceptions.record(phase.as_str(), &message);
                warn!(model = %model, phase = %phase, exit_code = output.exit_code, error = %message, "External tool failed");
                return Err(MaintenanceError::ToolFailure {
                    exit_code: output.exit_code,
                    message,
                });
            }

            let count = batch.len() as i64;
            let previous = self
                .store
                .count_processed_under_cap(model, phase.is_training(), request.after_id, count)
                .await? as i64;
            let new_cap = next_cap(count, previous, self.divisor);

            exceptions.record(
                phase.as_str(),
                &format!(
                    "{} (batch of {} records, reducing cap to {})",
                    output.error_text(),
                    count,
                    new_cap
                ),
            );
            self.metrics.inc_memory_backoffs(model, phase.as_str());
            self.logger.log_memory_backoff(model, phase.as_str(), count, new_cap);

            if new_cap <= 0 {
                exceptions.record(phase.as_str(), "batch size reduced to zero, giving up");
                return Err(MaintenanceError::ResourceExhausted {
                    model: model.to_string(),
                });
            }
            cap = new_cap;
        }
    }
}
