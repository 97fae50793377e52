//! Scripted process runner shared by unit tests

use crate::error::MaintenanceResult;
use crate::runner::{CommandLine, ProcessOutput, ProcessRunner};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

type Step = Box<dyn Fn(&CommandLine) -> ProcessOutput + Send + Sync>;

/// One observed invocation
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub command: CommandLine,
    /// Lines of the batch data file, when one was passed
    pub batch_lines: Option<Vec<String>>,
}

/// Replays queued responses in order; once the queue is drained every call
/// succeeds with empty output
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    steps: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<Invocation>>,
}

pub(crate) fn output(exit_code: i32, stdout: &str, stderr: &str) -> ProcessOutput {
    ProcessOutput {
        exit_code,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

impl ScriptedRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn then(self, step: impl Fn(&CommandLine) -> ProcessOutput + Send + Sync + 'static) -> Self {
        self.steps.lock().unwrap().push_back(Box::new(step));
        self
    }

    pub(crate) fn then_ok(self, stdout: &str) -> Self {
        let out = output(0, stdout, "");
        self.then(move |_| out.clone())
    }

    pub(crate) fn then_fail(self, exit_code: i32, stderr: &str) -> Self {
        let out = output(exit_code, "", stderr);
        self.then(move |_| out.clone())
    }

    /// Succeed after writing `contents` to the argument at `index`
    pub(crate) fn then_write_arg(self, index: usize, contents: &str, stdout: &str) -> Self {
        let contents = contents.to_string();
        let out = output(0, stdout, "");
        self.then(move |cmd| {
            std::fs::write(&cmd.args[index], &contents).unwrap();
            out.clone()
        })
    }

    pub(crate) fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Batch sizes seen by each invocation that received a data file
    pub(crate) fn batch_sizes(&self) -> Vec<usize> {
        self.calls()
            .into_iter()
            .filter_map(|c| c.batch_lines.map(|l| l.len()))
            .collect()
    }
}

fn read_batch(command: &CommandLine) -> Option<Vec<String>> {
    command.args.iter().find_map(|arg| {
        let name = Path::new(arg).file_name()?.to_string_lossy().into_owned();
        if !name.starts_with("batch-") {
            return None;
        }
        let text = std::fs::read_to_string(arg).ok()?;
        Some(text.lines().map(str::to_string).collect())
    })
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, command: &CommandLine) -> MaintenanceResult<ProcessOutput> {
        self.calls.lock().unwrap().push(Invocation {
            command: command.clone(),
            batch_lines: read_batch(command),
        });
        let step = self.steps.lock().unwrap().pop_front();
        Ok(match step {
            Some(step) => step(command),
            None => ProcessOutput::default(),
        })
    }
}
