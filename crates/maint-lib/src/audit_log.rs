//! Bounded audit log of coordinator runs
//!
//! The log is a ring buffer of timestamped entries. It is persisted as a
//! single string with entries separated by a blank line; loading keeps only
//! the most recent entries so storage never grows past the capacity.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Maximum number of entries retained
pub const MAX_LOG_ENTRIES: usize = 1000;

/// Delimiter between persisted entries
pub const ENTRY_DELIMITER: &str = "\n\n";

/// Ring buffer of audit log entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLog {
    entries: VecDeque<String>,
    capacity: usize,
}

impl Default for RunLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RunLog {
    pub fn new() -> Self {
        Self::with_capacity(MAX_LOG_ENTRIES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(MAX_LOG_ENTRIES)),
            capacity: capacity.max(1),
        }
    }

    /// Append an entry stamped with the current time
    pub fn append(&mut self, text: impl AsRef<str>) {
        self.append_at(Utc::now(), text);
    }

    /// Append an entry stamped with the given time
    pub fn append_at(&mut self, at: DateTime<Utc>, text: impl AsRef<str>) {
        let entry = format!("{}: {}", at.format("%Y-%m-%d %H:%M:%S"), sanitize(text.as_ref()));
        self.push_entry(entry);
    }

    fn push_entry(&mut self, entry: String) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// Most recent `count` entries, oldest first
    pub fn tail(&self, count: usize) -> Vec<&str> {
        let skip = self.entries.len().saturating_sub(count);
        self.entries.iter().skip(skip).map(String::as_str).collect()
    }

    /// Whether any entry contains the given text
    pub fn contains(&self, needle: &str) -> bool {
        self.entries.iter().any(|e| e.contains(needle))
    }

    pub fn to_persisted(&self) -> String {
        self.entries
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(ENTRY_DELIMITER)
    }

    /// Rebuild from persisted text, keeping the most recent entries in order
    pub fn from_persisted(text: &str) -> Self {
        let mut log = Self::new();
        for entry in text.split(ENTRY_DELIMITER) {
            let entry = entry.trim_matches('\n');
            if !entry.is_empty() {
                log.push_entry(entry.to_string());
            }
        }
        log
    }
}

/// Collapse blank lines so an entry never contains the delimiter
fn sanitize(text: &str) -> String {
    let mut out = text.trim_matches('\n').replace("\r\n", "\n");
    while out.contains(ENTRY_DELIMITER) {
        out = out.replace(ENTRY_DELIMITER, "\n");
    }
    out
}
