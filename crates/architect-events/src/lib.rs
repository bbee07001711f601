//! Append-only event log for the architect control plane.
//!
//! This crate is the Rust side of the shared [`EventBus`] described in
//! `SPEC_FULL.md` §4.1/§4.7: every task lifecycle transition, pattern
//! change, and webhook delivery is recorded as a [`TaskEvent`] and appended
//! to a JSONL file, in addition to being consumed in-memory by watchers and
//! the webhook dispatcher.
//!
//! # Example
//!
//! ```
//! use architect_events::{EventLog, events_path, TaskEvent};
//! use architect_types::TaskEventKind;
//! use chrono::Utc;
//!
//! let mut log = EventLog::new();
//!
//! let event = TaskEvent {
//!     timestamp: Utc::now(),
//!     task_id: 42,
//!     kind: TaskEventKind::Created,
//!     detail: serde_json::json!({ "task_type": "build" }),
//! };
//!
//! log.record(event);
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use architect_types::TaskEventKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default events file name.
pub const EVENTS_FILE: &str = "events.jsonl";

/// Get the events file path for a state directory.
pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// A single task lifecycle event, as recorded on the [`EventLog`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub timestamp: DateTime<Utc>,
    pub task_id: i64,
    pub kind: TaskEventKind,
    /// Component-specific extra context (e.g. `worker_id`, `error`).
    #[serde(default)]
    pub detail: serde_json::Value,
}

/// Append-only event log for task lifecycle transitions.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<TaskEvent>,
}

impl EventLog {
    /// Create a new empty event log.
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Record a new event.
    pub fn record(&mut self, event: TaskEvent) {
        self.events.push(event);
    }

    /// Write all recorded events to a file in JSONL format. Events are
    /// appended to the file if it already exists.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut writer = std::io::BufWriter::new(file);

        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
            writeln!(writer, "{}", line).context("failed to write event line")?;
        }

        writer.flush().context("failed to flush events file")?;

        Ok(())
    }

    /// Read all events from a JSONL file.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let reader = BufReader::new(file);
        let mut events = Vec::new();

        for line in reader.lines() {
            let line = line.with_context(|| {
                format!("failed to read line from events file {}", path.display())
            })?;
            let event: TaskEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event JSON from line: {}", line))?;
            events.push(event);
        }

        Ok(Self { events })
    }

    /// Get all events for a specific task.
    pub fn events_for_task(&self, task_id: i64) -> Vec<&TaskEvent> {
        self.events.iter().filter(|e| e.task_id == task_id).collect()
    }

    /// Get all recorded events.
    pub fn all_events(&self) -> &[TaskEvent] {
        &self.events
    }

    /// Clear all recorded events from memory.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_event(task_id: i64, kind: TaskEventKind) -> TaskEvent {
        TaskEvent { timestamp: Utc::now(), task_id, kind, detail: serde_json::Value::Null }
    }

    #[test]
    fn new_event_log_is_empty() {
        let log = EventLog::new();
        assert!(log.is_empty());
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn record_adds_event_to_log() {
        let mut log = EventLog::new();
        log.record(sample_event(1, TaskEventKind::Created));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn events_for_task_filters_correctly() {
        let mut log = EventLog::new();
        log.record(sample_event(1, TaskEventKind::Created));
        log.record(sample_event(2, TaskEventKind::Created));
        log.record(sample_event(1, TaskEventKind::Completed));

        assert_eq!(log.events_for_task(1).len(), 2);
        assert_eq!(log.events_for_task(2).len(), 1);
    }

    #[test]
    fn write_to_file_creates_jsonl_format() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("events.jsonl");

        let mut log = EventLog::new();
        log.record(sample_event(1, TaskEventKind::Created));
        log.write_to_file(&path).expect("write");

        let content = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        let _: TaskEvent = serde_json::from_str(lines[0]).expect("parse");
    }

    #[test]
    fn write_to_file_appends_to_existing_file() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("events.jsonl");

        let mut log1 = EventLog::new();
        log1.record(sample_event(1, TaskEventKind::Created));
        log1.write_to_file(&path).expect("write first");

        let mut log2 = EventLog::new();
        log2.record(sample_event(1, TaskEventKind::Started));
        log2.write_to_file(&path).expect("write second");

        let content = fs::read_to_string(&path).expect("read");
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn read_from_file_loads_all_events() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("events.jsonl");

        let mut log = EventLog::new();
        log.record(sample_event(1, TaskEventKind::Created));
        log.record(sample_event(1, TaskEventKind::Completed));
        log.write_to_file(&path).expect("write");

        let loaded = EventLog::read_from_file(&path).expect("read");
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn read_from_file_returns_empty_log_when_missing() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("nonexistent.jsonl");
        let loaded = EventLog::read_from_file(&path).expect("read");
        assert!(loaded.is_empty());
    }

    #[test]
    fn all_task_event_kinds_serialize_and_round_trip() {
        for kind in [
            TaskEventKind::Created,
            TaskEventKind::Started,
            TaskEventKind::Completed,
            TaskEventKind::Failed,
            TaskEventKind::Retrying,
            TaskEventKind::Cancelled,
            TaskEventKind::Timeout,
            TaskEventKind::Claimed,
            TaskEventKind::PriorityChanged,
            TaskEventKind::Assigned,
            TaskEventKind::Released,
        ] {
            let event = sample_event(1, kind);
            let json = serde_json::to_string(&event).expect("serialize");
            let parsed: TaskEvent = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(parsed.task_id, event.task_id);
        }
    }

    #[test]
    fn path_helper_returns_expected_path() {
        let base = PathBuf::from("x");
        assert_eq!(events_path(&base), PathBuf::from("x").join(EVENTS_FILE));
    }

    #[test]
    fn clear_removes_all_events() {
        let mut log = EventLog::new();
        log.record(sample_event(1, TaskEventKind::Created));
        log.record(sample_event(2, TaskEventKind::Created));
        assert_eq!(log.len(), 2);

        log.clear();
        assert!(log.is_empty());
    }
}
