//! External trainer/tester invocation
//!
//! Batches are materialized into a scoped temp file (one line per record)
//! and handed to a black-box executable through a path-tag expanded command
//! line. The process always runs to completion; cancellation never kills it.

use crate::error::{MaintenanceError, MaintenanceResult};
use crate::models::BatchRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, warn};

/// Tag replaced with the batch data file
pub const TAG_DATA_FILE: &str = "<DataFile>";
/// Tag replaced with the working model file
pub const TAG_MODEL_FILE: &str = "<ModelFile>";
/// Tag replaced with the currently published model
pub const TAG_PUBLISHED_MODEL: &str = "<PublishedModel>";
/// Tags used by publication steps
pub const TAG_SOURCE: &str = "<Source>";
pub const TAG_DESTINATION: &str = "<Destination>";
/// Tags used by the notification command
pub const TAG_SUBJECT: &str = "<Subject>";
pub const TAG_ATTACHMENT: &str = "<Attachment>";
pub const TAG_RECIPIENTS: &str = "<Recipients>";
pub const TAG_BODY_FILE: &str = "<BodyFile>";

/// Line format of the batch data file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchFormat {
    /// The payload as-is
    #[default]
    Raw,
    /// `,,` followed by the payload, for tools expecting three CSV columns
    Csv,
}

impl BatchFormat {
    pub fn format_line(&self, payload: &str) -> String {
        let flat = payload.replace("\r\n", " ").replace(['\r', '\n'], " ");
        match self {
            BatchFormat::Raw => flat,
            BatchFormat::Csv => format!(",,{}", flat),
        }
    }
}

/// Exit code and captured output of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Whether the tool reported running out of memory
    pub fn indicates_memory_exhaustion(&self) -> bool {
        self.stdout.to_lowercase().contains("memory") || self.stderr.to_lowercase().contains("memory")
    }

    /// Error text for failure reports, preferring stderr
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }

    /// Text the result parser reads
    pub fn combined_text(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Values substituted for path tags
#[derive(Debug, Clone, Default)]
pub struct PathTags {
    values: HashMap<&'static str, String>,
}

impl PathTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tag: &'static str, value: impl Into<String>) -> Self {
        self.set(tag, value);
        self
    }

    pub fn with_path(self, tag: &'static str, path: &Path) -> Self {
        self.with(tag, path.to_string_lossy().into_owned())
    }

    pub fn set(&mut self, tag: &'static str, value: impl Into<String>) {
        self.values.insert(tag, value.into());
    }
}

/// Resolved program and arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Configured command line containing path tags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate(pub String);

impl CommandTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Split into words, then substitute tags inside each word so paths with
    /// spaces stay a single argument
    pub fn expand(&self, tags: &PathTags) -> MaintenanceResult<CommandLine> {
        let mut words = split_command_line(&self.0)?.into_iter().map(|word| {
            tags.values
                .iter()
                .fold(word, |acc, (tag, value)| acc.replace(tag, value))
        });

        let program = words
            .next()
            .ok_or_else(|| MaintenanceError::Configuration("empty command line".to_string()))?;

        Ok(CommandLine {
            program,
            args: words.collect(),
        })
    }
}

/// Quote-aware whitespace split
fn split_command_line(line: &str) -> MaintenanceResult<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(MaintenanceError::Configuration(format!(
            "unterminated quote in command line: {}",
            line
        )));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Trait for running an external process to completion
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, command: &CommandLine) -> MaintenanceResult<ProcessOutput>;
}

/// [`ProcessRunner`] spawning real processes through tokio
#[derive(Debug, Clone, Default)]
pub struct TokioProcessRunner {
    working_dir: Option<PathBuf>,
}

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_working_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: Some(dir.into()),
        }
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, command: &CommandLine) -> MaintenanceResult<ProcessOutput> {
        debug!(command = %command, "Starting external process");

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|e| {
            warn!(program = %command.program, error = %e, "Failed to start external process");
            MaintenanceError::ToolFailure {
                exit_code: -1,
                message: format!("failed to start {}: {}", command.program, e),
            }
        })?;

        let result = ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        debug!(
            program = %command.program,
            exit_code = result.exit_code,
            stdout_bytes = result.stdout.len(),
            stderr_bytes = result.stderr.len(),
            "External process finished"
        );
        Ok(result)
    }
}

/// Writes batches to temp files and runs the external tool over them
#[derive(Clone)]
pub struct ExternalJobRunner {
    runner: std::sync::Arc<dyn ProcessRunner>,
    work_dir: PathBuf,
    format: BatchFormat,
}

impl ExternalJobRunner {
    pub fn new(
        runner: std::sync::Arc<dyn ProcessRunner>,
        work_dir: impl Into<PathBuf>,
        format: BatchFormat,
    ) -> Self {
        Self {
            runner,
            work_dir: work_dir.into(),
            format,
        }
    }

    pub fn format(&self) -> BatchFormat {
        self.format
    }

    pub fn process_runner(&self) -> &std::sync::Arc<dyn ProcessRunner> {
        &self.runner
    }

    /// Materialize `batch` and run `template` over it. The data file is
    /// removed when this returns.
    pub async fn run_batch(
        &self,
        batch: &[BatchRecord],
        template: &CommandTemplate,
        tags: &PathTags,
    ) -> MaintenanceResult<ProcessOutput> {
        let data_file = self.write_batch_file(batch)?;
        let tags = tags.clone().with_path(TAG_DATA_FILE, data_file.path());
        let command = template.expand(&tags)?;
        self.runner.run(&command).await
    }

    fn write_batch_file(&self, batch: &[BatchRecord]) -> MaintenanceResult<NamedTempFile> {
        std::fs::create_dir_all(&self.work_dir)?;
        let mut file = tempfile::Builder::new()
            .prefix("batch-")
            .suffix(".txt")
            .tempfile_in(&self.work_dir)?;

        for record in batch {
            writeln!(file, "{}", self.format.format_line(&record.payload))?;
        }
        file.flush()?;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Captures the data file contents at invocation time
    struct CapturingRunner {
        seen: Mutex<Vec<(CommandLine, String)>>,
    }

    #[async_trait]
    impl ProcessRunner for CapturingRunner {
        async fn run(&self, command: &CommandLine) -> MaintenanceResult<ProcessOutput> {
            let contents = std::fs::read_to_string(&command.args[0]).unwrap();
            self.seen.lock().unwrap().push((command.clone(), contents));
            Ok(ProcessOutput::default())
        }
    }

    fn records() -> Vec<BatchRecord> {
        vec![
            BatchRecord {
                id: 1,
                payload: "alpha".to_string(),
            },
            BatchRecord {
                id: 2,
                payload: "beta\r\ngamma".to_string(),
            },
        ]
    }

    #[test]
    fn test_batch_format_lines() {
        assert_eq!(BatchFormat::Raw.format_line("abc"), "abc");
        assert_eq!(BatchFormat::Csv.format_line("abc"), ",,abc");
        assert_eq!(BatchFormat::Raw.format_line("a\nb"), "a b");
    }

    #[test]
    fn test_memory_detection_is_case_insensitive() {
        let out = ProcessOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "System.OutOfMemoryException".to_string(),
        };
        assert!(out.indicates_memory_exhaustion());

        let out = ProcessOutput {
            exit_code: 1,
            stdout: "MEMORY limit".to_string(),
            stderr: String::new(),
        };
        assert!(out.indicates_memory_exhaustion());

        let out = ProcessOutput {
            exit_code: 2,
            stdout: "bad arguments".to_string(),
            stderr: String::new(),
        };
        assert!(!out.indicates_memory_exhaustion());
        assert_eq!(out.error_text(), "bad arguments");
    }

    #[test]
    fn test_expand_with_quotes_and_tags() {
        let template = CommandTemplate::new(r#"trainer --data <DataFile> --out "<ModelFile>" -v"#);
        let tags = PathTags::new()
            .with(TAG_DATA_FILE, "/tmp/batch 1.txt")
            .with(TAG_MODEL_FILE, "/tmp/my model.bin");

        let cmd = template.expand(&tags).unwrap();
        assert_eq!(cmd.program, "trainer");
        assert_eq!(
            cmd.args,
            vec!["--data", "/tmp/batch 1.txt", "--out", "/tmp/my model.bin", "-v"]
        );
    }

    #[test]
    fn test_expand_rejects_bad_templates() {
        assert!(CommandTemplate::new("   ").expand(&PathTags::new()).is_err());
        assert!(CommandTemplate::new("tool \"open").expand(&PathTags::new()).is_err());
    }

    #[tokio::test]
    async fn test_run_batch_writes_one_line_per_record() {
        let dir = TempDir::new().unwrap();
        let capturing = Arc::new(CapturingRunner {
            seen: Mutex::new(Vec::new()),
        });
        let runner = ExternalJobRunner::new(capturing.clone(), dir.path(), BatchFormat::Csv);

        runner
            .run_batch(&records(), &CommandTemplate::new("tool <DataFile>"), &PathTags::new())
            .await
            .unwrap();

        let seen = capturing.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, ",,alpha\n,,beta gamma\n");

        // scoped data file is gone after the run
        let data_path = PathBuf::from(&seen[0].0.args[0]);
        assert!(!data_path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_runner_captures_exit_and_output() {
        let runner = TokioProcessRunner::new();
        let cmd = CommandTemplate::new("sh -c 'echo out; echo err 1>&2; exit 3'")
            .expand(&PathTags::new())
            .unwrap();

        let output = runner.run(&cmd).await.unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_tokio_runner_missing_program_is_tool_failure() {
        let runner = TokioProcessRunner::new();
        let cmd = CommandLine {
            program: "/definitely/not/a/real/tool".to_string(),
            args: vec![],
        };

        match runner.run(&cmd).await {
            Err(MaintenanceError::ToolFailure { exit_code, .. }) => assert_eq!(exit_code, -1),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
