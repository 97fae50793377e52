//! Observability infrastructure for the maintenance engine
//!
//! Provides:
//! - Prometheus metrics (runs, job outcomes, publications, memory backoffs, cleanup)
//! - Structured JSON logging with tracing

use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    GaugeVec, Histogram, IntCounter, IntCounterVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for job durations (in seconds); training runs are long
const JOB_DURATION_BUCKETS: &[f64] = &[
    0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<MaintenanceMetricsInner> = OnceLock::new();

struct MaintenanceMetricsInner {
    runs: IntCounterVec,
    jobs_started: IntCounter,
    jobs_failed: IntCounter,
    jobs_skipped: IntCounter,
    models_published: IntCounterVec,
    models_rejected: IntCounterVec,
    memory_backoffs: IntCounterVec,
    records_deleted: IntCounter,
    job_duration_seconds: Histogram,
    last_accepted_score: GaugeVec,
}

impl MaintenanceMetricsInner {
    fn new() -> Self {
        Self {
            runs: register_int_counter_vec!(
                "mlmaint_runs_total",
                "Coordinator runs by final state",
                &["state"]
            )
            .expect("Failed to register runs_total"),

            jobs_started: register_int_counter!(
                "mlmaint_jobs_started_total",
                "Maintenance jobs started"
            )
            .expect("Failed to register jobs_started_total"),

            jobs_failed: register_int_counter!(
                "mlmaint_jobs_failed_total",
                "Maintenance jobs that ended with an error"
            )
            .expect("Failed to register jobs_failed_total"),

            jobs_skipped: register_int_counter!(
                "mlmaint_jobs_skipped_total",
                "Maintenance jobs skipped for lack of data or configuration"
            )
            .expect("Failed to register jobs_skipped_total"),

            models_published: register_int_counter_vec!(
                "mlmaint_models_published_total",
                "Model artifacts accepted and published",
                &["model"]
            )
            .expect("Failed to register models_published_total"),

            models_rejected: register_int_counter_vec!(
                "mlmaint_models_rejected_total",
                "Trained models rejected by the acceptance test",
                &["model"]
            )
            .expect("Failed to register models_rejected_total"),

            memory_backoffs: register_int_counter_vec!(
                "mlmaint_memory_backoffs_total",
                "Batch cap reductions after the external tool ran out of memory",
                &["model", "phase"]
            )
            .expect("Failed to register memory_backoffs_total"),

            records_deleted: register_int_counter!(
                "mlmaint_records_deleted_total",
                "Data records removed by end-of-run cleanup"
            )
            .expect("Failed to register records_deleted_total"),

            job_duration_seconds: register_histogram!(
                "mlmaint_job_duration_seconds",
                "Wall time of one maintenance job",
                JOB_DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register job_duration_seconds"),

            last_accepted_score: register_gauge_vec!(
                "mlmaint_last_accepted_score",
                "Score of the most recently published model",
                &["model"]
            )
            .expect("Failed to register last_accepted_score"),
        }
    }
}

/// Maintenance metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct MaintenanceMetrics {
    _private: (),
}

impl Default for MaintenanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MaintenanceMetrics {
    /// Create a metrics handle, registering the metrics on first call
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(MaintenanceMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &MaintenanceMetricsInner {
        GLOBAL_METRICS.get_or_init(MaintenanceMetricsInner::new)
    }

    pub fn inc_runs(&self, state: &str) {
        self.inner().runs.with_label_values(&[state]).inc();
    }

    pub fn inc_jobs_started(&self) {
        self.inner().jobs_started.inc();
    }

    pub fn inc_jobs_failed(&self) {
        self.inner().jobs_failed.inc();
    }

    pub fn inc_jobs_skipped(&self) {
        self.inner().jobs_skipped.inc();
    }

    /// Record a publication and its score
    pub fn record_published(&self, model: &str, score: f64) {
        self.inner().models_published.with_label_values(&[model]).inc();
        self.inner()
            .last_accepted_score
            .with_label_values(&[model])
            .set(score);
    }

    pub fn inc_rejected(&self, model: &str) {
        self.inner().models_rejected.with_label_values(&[model]).inc();
    }

    pub fn inc_memory_backoffs(&self, model: &str, phase: &str) {
        self.inner()
            .memory_backoffs
            .with_label_values(&[model, phase])
            .inc();
    }

    pub fn add_records_deleted(&self, count: u64) {
        self.inner().records_deleted.inc_by(count);
    }

    pub fn observe_job_duration(&self, duration_secs: f64) {
        self.inner().job_duration_seconds.observe(duration_secs);
    }
}

/// Structured logger for maintenance events
///
/// Emits event-tagged records so runs, publications and backoffs can be
/// filtered out of the JSON log stream.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "agent_started",
            instance = %self.instance,
            agent_version = %version,
            "Maintenance agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Maintenance agent shutting down"
        );
    }

    pub fn log_run_started(&self, services: usize) {
        info!(
            event = "run_started",
            instance = %self.instance,
            services = services,
            "Maintenance run started"
        );
    }

    pub fn log_run_finished(
        &self,
        state: &str,
        started: usize,
        skipped: usize,
        failed: usize,
        deleted: u64,
    ) {
        info!(
            event = "run_finished",
            instance = %self.instance,
            state = %state,
            started = started,
            skipped = skipped,
            failed = failed,
            deleted = deleted,
            "Maintenance run finished"
        );
    }

    pub fn log_job_outcome(&self, description: &str, outcome: &str, duration_secs: f64) {
        info!(
            event = "job_finished",
            instance = %self.instance,
            service = %description,
            outcome = %outcome,
            duration_secs = duration_secs,
            "Maintenance job finished"
        );
    }

    pub fn log_job_error(&self, description: &str, error: &str) {
        warn!(
            event = "job_failed",
            instance = %self.instance,
            service = %description,
            error = %error,
            "Maintenance job failed"
        );
    }

    /// Log the result of an acceptance decision
    pub fn log_acceptance(&self, model: &str, score: f64, previous_best: f64, accepted: bool) {
        if accepted {
            info!(
                event = "model_accepted",
                instance = %self.instance,
                model = %model,
                score = score,
                previous_best = previous_best,
                "Model passed acceptance"
            );
        } else {
            warn!(
                event = "model_rejected",
                instance = %self.instance,
                model = %model,
                score = score,
                previous_best = previous_best,
                "Model failed acceptance, keeping published artifact"
            );
        }
    }

    pub fn log_publication(&self, model: &str, checksum: &str, last_id_processed: i64) {
        info!(
            event = "model_published",
            instance = %self.instance,
            model = %model,
            checksum = %checksum,
            last_id_processed = last_id_processed,
            "Model artifact published"
        );
    }

    pub fn log_memory_backoff(&self, model: &str, phase: &str, old_cap: i64, new_cap: i64) {
        warn!(
            event = "memory_backoff",
            instance = %self.instance,
            model = %model,
            phase = %phase,
            old_cap = old_cap,
            new_cap = new_cap,
            "External tool ran out of memory, shrinking batch"
        );
    }

    pub fn log_cleanup(&self, deleted: u64) {
        info!(
            event = "cleanup",
            instance = %self.instance,
            deleted = deleted,
            "Removed records marked for deletion"
        );
    }
}
