//! Per-cycle exception log and operator notifications
//!
//! Every backoff and terminal failure of a training cycle is appended to an
//! exception log file. When a cycle fails or its model is rejected, the file
//! is attached to a notification sent through the configured mail command.

use crate::error::{MaintenanceError, MaintenanceResult};
use crate::runner::{
    CommandTemplate, PathTags, ProcessRunner, TAG_ATTACHMENT, TAG_BODY_FILE, TAG_RECIPIENTS,
    TAG_SUBJECT,
};
use async_trait::async_trait;
use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{info, warn};

/// Scoped file collecting warnings for one training cycle
pub struct ExceptionLog {
    file: NamedTempFile,
    entries: usize,
}

impl ExceptionLog {
    /// Create an empty log in `dir`
    pub fn create(dir: &Path, model_name: &str) -> MaintenanceResult<Self> {
        std::fs::create_dir_all(dir)?;
        let file = tempfile::Builder::new()
            .prefix(&format!("exceptions-{}-", sanitize_file_component(model_name)))
            .suffix(".log")
            .tempfile_in(dir)?;
        Ok(Self { file, entries: 0 })
    }

    /// Append a warning record. Write failures are logged and swallowed so
    /// reporting never masks the failure being reported.
    pub fn record(&mut self, context: &str, message: &str) {
        let line = format!(
            "{} [WARN] {}: {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            context,
            message.trim()
        );
        match self.file.write_all(line.as_bytes()).and_then(|_| self.file.flush()) {
            Ok(()) => self.entries += 1,
            Err(e) => warn!(error = %e, "Failed to write exception log"),
        }
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn contents(&self) -> MaintenanceResult<String> {
        Ok(std::fs::read_to_string(self.file.path())?)
    }
}

fn sanitize_file_component(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// A message for operators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
    pub attachment: Option<PathBuf>,
}

/// Trait for notification transports
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> MaintenanceResult<()>;
}

/// Writes notifications to the tracing log only
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> MaintenanceResult<()> {
        info!(
            event = "notification",
            subject = %notification.subject,
            recipients = %notification.recipients.join(","),
            attachment = ?notification.attachment,
            "{}",
            notification.body
        );
        Ok(())
    }
}

/// Sends notifications through an external mail command
pub struct CommandNotifier {
    template: CommandTemplate,
    runner: Arc<dyn ProcessRunner>,
    work_dir: PathBuf,
}

impl CommandNotifier {
    pub fn new(template: CommandTemplate, runner: Arc<dyn ProcessRunner>, work_dir: PathBuf) -> Self {
        Self {
            template,
            runner,
            work_dir,
        }
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, notification: &Notification) -> MaintenanceResult<()> {
        std::fs::create_dir_all(&self.work_dir)?;
        let mut body_file = tempfile::Builder::new()
            .prefix("notification-")
            .suffix(".txt")
            .tempfile_in(&self.work_dir)?;
        body_file.write_all(notification.body.as_bytes())?;
        body_file.flush()?;

        let attachment = notification
            .attachment
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let tags = PathTags::new()
            .with(TAG_SUBJECT, notification.subject.clone())
            .with(TAG_RECIPIENTS, notification.recipients.join(","))
            .with(TAG_ATTACHMENT, attachment)
            .with_path(TAG_BODY_FILE, body_file.path());

        let command = self.template.expand(&tags)?;
        let output = self.runner.run(&command).await?;
        if !output.success() {
            return Err(MaintenanceError::Notification(format!(
                "mail command exited with {}: {}",
                output.exit_code,
                output.error_text()
            )));
        }
        Ok(())
    }
}
