//! # Types
//!
//! Core domain types for the architect control plane: tasks, templates,
//! batches, workers, sessions, webhooks, prompt patterns, and the shared
//! error taxonomy. These types are the contract shared by the task queue
//! (C1), the session dispatcher (C2), and the prompt auto-responder (C3).
//!
//! ## Serialization
//!
//! Every persisted type implements `Serialize`/`Deserialize`. Timestamps are
//! always UTC and serialize as RFC 3339 strings via `chrono`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An opaque JSON-shaped value. The core never interprets payload contents
/// beyond the reserved keys documented on [`Task::payload`].
pub type Payload = serde_json::Value;

/// Status of a [`Task`]. Transitions form the DAG documented in
/// `SPEC_FULL.md` §3/§4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Converted,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Cancelled
                | TaskStatus::Timeout
                | TaskStatus::Converted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
            TaskStatus::Converted => "converted",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "scheduled" => Ok(TaskStatus::Scheduled),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "timeout" => Ok(TaskStatus::Timeout),
            "converted" => Ok(TaskStatus::Converted),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// The atomic unit of deferred work. See `SPEC_FULL.md` §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub task_type: String,
    pub payload: Payload,
    pub priority: u8,
    pub status: TaskStatus,
    pub retries: u32,
    pub max_retries: u32,
    pub timeout_seconds: i64,
    pub assigned_worker: Option<String>,
    pub assigned_node: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub parent_id: Option<i64>,
    pub hierarchy_level: i64,
    pub hierarchy_path: String,
    pub child_count: i64,
    pub batch_id: Option<String>,
    pub sprint_id: Option<i64>,
}

impl Task {
    /// Clamp a requested priority into the valid `[0, 10]` range.
    pub fn clamp_priority(value: i32) -> u8 {
        value.clamp(0, 10) as u8
    }
}

/// A named, versioned recipe producing [`Task`]s by variable substitution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub id: i64,
    pub name: String,
    pub task_type: String,
    pub payload_skeleton: Payload,
    pub default_priority: u8,
    pub default_max_retries: u32,
    pub default_timeout_seconds: i64,
    pub usage_count: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
}

/// Aggregate status of a [`Batch`], derived from its children's outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Created,
    Partial,
    Failed,
    Cancelled,
    Retrying,
}

/// A grouping handle produced by expanding a [`TaskTemplate`] over a list of
/// variable bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub template_id: i64,
    pub total_requested: i64,
    pub created_count: i64,
    pub failed_count: i64,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    /// Derive `status` from the current counters, per §4.3: `failed` if
    /// nothing was created, `partial` if some items errored, else `created`.
    pub fn derive_status(&self) -> BatchStatus {
        if self.created_count == 0 {
            BatchStatus::Failed
        } else if self.failed_count > 0 {
            BatchStatus::Partial
        } else {
            BatchStatus::Created
        }
    }
}

/// Per-item outcome of `expand_batch` / `submit_bulk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemOutcome {
    Created { index: usize, id: i64 },
    Errored { index: usize, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Running,
    Draining,
    Stopped,
    Failed,
    Restarting,
}

/// A process that claims and executes tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: String,
    pub worker_type: String,
    pub status: WorkerStatus,
    pub capacity: u32,
    pub current_load: u32,
    pub active_connections: u32,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub skills: Vec<String>,
    pub weight: f64,
    pub restart_count: u32,
    pub region_id: Option<String>,
}

/// Per-session activity classification used by the dispatcher (C2) and the
/// prompt auto-responder (C3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionActivity {
    Idle,
    Busy,
    Failed,
}

/// An interactive assistant instance addressable through a terminal
/// multiplexer session name. The core owns only this addressing metadata,
/// never the underlying process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_name: String,
    pub node_id: Option<String>,
    pub activity: SessionActivity,
    pub assigned_entity: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub idle_ticks: u32,
}

/// An external URL subscribing to task lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub secret: Option<String>,
    pub events: Vec<String>,
    pub task_types: Option<Vec<String>>,
    pub retry_count: u32,
    pub timeout_seconds: u64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single audit row for a webhook delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: i64,
    pub webhook_id: i64,
    pub event: String,
    pub task_id: Option<i64>,
    pub payload: String,
    pub status_code: Option<u16>,
    pub success: bool,
    pub duration_ms: u64,
    /// Response body, truncated to 1 KB per §4.6.
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The task-lifecycle event kinds emitted onto the [`crate::EventBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    Created,
    Started,
    Completed,
    Failed,
    Retrying,
    Cancelled,
    Timeout,
    Claimed,
    PriorityChanged,
    Assigned,
    Released,
}

impl TaskEventKind {
    pub fn as_event_name(self) -> &'static str {
        match self {
            TaskEventKind::Created => "task.created",
            TaskEventKind::Started => "task.started",
            TaskEventKind::Completed => "task.completed",
            TaskEventKind::Failed => "task.failed",
            TaskEventKind::Retrying => "task.retrying",
            TaskEventKind::Cancelled => "task.cancelled",
            TaskEventKind::Timeout => "task.timeout",
            TaskEventKind::Claimed => "task.claimed",
            TaskEventKind::PriorityChanged => "task.priority_changed",
            TaskEventKind::Assigned => "task.assigned",
            TaskEventKind::Released => "task.released",
        }
    }
}

/// Truncate a string to at most `max_bytes`, respecting UTF-8 boundaries.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// The webhook payload body, matching the schema in `SPEC_FULL.md` §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub task: WebhookTaskView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTaskView {
    pub id: i64,
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: String,
    pub previous_status: Option<String>,
    pub worker_id: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub data: WebhookTaskData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTaskData {
    pub priority: u8,
    pub description: Option<String>,
    pub max_retries: u32,
    pub timeout_seconds: i64,
}

/// Risk tiers for prompt confirmations, driving the delay window in §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptRisk {
    Low,
    Medium,
    High,
}

impl PromptRisk {
    /// Inclusive delay window in milliseconds, per the risk table in §4.5.
    pub fn delay_window_ms(self) -> (u64, u64) {
        match self {
            PromptRisk::Low => (50, 200),
            PromptRisk::Medium => (300, 600),
            PromptRisk::High => (800, 1200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    PermissionPrompt,
    Status,
    Error,
}

/// A named, regex-addressed recognizer associated with a tool vendor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptPattern {
    pub id: i64,
    pub pattern_type: PatternType,
    pub pattern_name: String,
    pub pattern_regex: String,
    pub tool_name: String,
    pub description: String,
    /// `send_key:K`, `skip`, `alert:kind`, or `wait_for_options`.
    pub action: String,
    pub confidence_threshold: f64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single observation of a [`PromptPattern`] firing against a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptOccurrence {
    pub id: i64,
    pub pattern_id: i64,
    pub session_name: String,
    pub matched_text: String,
    pub context: String,
    pub timestamp: DateTime<Utc>,
    pub response_action: String,
    pub response_success: bool,
}

/// A detected shift in a pattern's behavior, surfaced to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternChange {
    pub id: i64,
    pub change_type: PatternChangeKind,
    pub pattern_id: Option<i64>,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternChangeKind {
    PatternDisappeared,
    LowSuccessRate,
    NewPatternDetected,
}

/// Immutable metadata for a revertible rollback snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackSnapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub description: String,
    pub git_commit: Option<String>,
    pub git_branch: Option<String>,
    pub db_backup_path: std::path::PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchType {
    All,
    Status,
    Comments,
    Assignment,
}

impl WatchType {
    pub fn admits(self, kind: &str) -> bool {
        match self {
            WatchType::All => true,
            WatchType::Status => matches!(kind, "status_change" | "completed"),
            WatchType::Comments => kind == "comment_added",
            WatchType::Assignment => matches!(kind, "assigned" | "unassigned"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WatchType::All => "all",
            WatchType::Status => "status",
            WatchType::Comments => "comments",
            WatchType::Assignment => "assignment",
        }
    }
}

impl std::str::FromStr for WatchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(WatchType::All),
            "status" => Ok(WatchType::Status),
            "comments" => Ok(WatchType::Comments),
            "assignment" => Ok(WatchType::Assignment),
            other => Err(format!("unknown watch type: {other}")),
        }
    }
}

/// A per-user subscription to a task's lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskWatcher {
    pub id: i64,
    pub task_id: i64,
    pub task_type: String,
    pub user_id: String,
    pub watch_type: WatchType,
    pub notify_email: bool,
    pub notify_dashboard: bool,
}

/// A recorded span of time a user spent on a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkLogEntry {
    pub id: i64,
    pub task_id: i64,
    pub user_id: String,
    pub time_spent_minutes: u32,
    pub work_date: chrono::NaiveDate,
    pub work_type: String,
    pub billable: bool,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// At most one active timer per user; see §4.3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTimer {
    pub id: i64,
    pub task_id: i64,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SprintStatus {
    Planned,
    Active,
    Completed,
    Cancelled,
}

impl SprintStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SprintStatus::Planned => "planned",
            SprintStatus::Active => "active",
            SprintStatus::Completed => "completed",
            SprintStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for SprintStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(SprintStatus::Planned),
            "active" => Ok(SprintStatus::Active),
            "completed" => Ok(SprintStatus::Completed),
            "cancelled" => Ok(SprintStatus::Cancelled),
            other => Err(format!("unknown sprint status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sprint {
    pub id: i64,
    pub name: String,
    pub goal: Option<String>,
    pub start_date: Option<chrono::NaiveDate>,
    pub end_date: Option<chrono::NaiveDate>,
    pub status: SprintStatus,
}

/// A record that a task was promoted into an external tracker entity
/// (e.g. a feature or a bug), per §4.3's board-view conversion path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConversion {
    pub id: i64,
    pub source_task_id: i64,
    pub target_reference: String,
    pub converted_at: DateTime<Utc>,
}

/// Graceful-shutdown state machine states for the dispatcher (C2), per §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownState {
    Running,
    Stopping,
    Draining,
    Cleanup,
    Terminated,
}

impl ShutdownState {
    pub fn is_shutting_down(self) -> bool {
        matches!(
            self,
            ShutdownState::Stopping | ShutdownState::Draining | ShutdownState::Cleanup
        )
    }

    pub fn should_run(self) -> bool {
        matches!(self, ShutdownState::Running)
    }
}

/// Error taxonomy shared across all components, per `SPEC_FULL.md` §7.
/// Variants map 1:1 onto the spec's named error kinds; this is the type
/// that the retry/backoff layer (`architect-retry`) dispatches on.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("state conflict: {0}")]
    StateConflict(String),
    #[error("lock timeout acquiring {name} after {waited_ms}ms")]
    LockTimeout { name: String, waited_ms: u64 },
    #[error("queue empty")]
    QueueEmpty,
    #[error("transport/io failure: {0}")]
    Transport(String),
    #[error("security failure: {0}")]
    Security(String),
}

impl CoreError {
    /// The machine-readable `code` field used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::StateConflict(_) => "STATE_CONFLICT",
            CoreError::LockTimeout { .. } => "LOCK_TIMEOUT",
            CoreError::QueueEmpty => "QUEUE_EMPTY",
            CoreError::Transport(_) => "TRANSPORT_ERROR",
            CoreError::Security(_) => "SECURITY_FAILURE",
        }
    }

    /// Whether the caller's own retry budget should attempt this again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::LockTimeout { .. } | CoreError::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trips_through_str() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Scheduled,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Timeout,
            TaskStatus::Converted,
        ] {
            let parsed: TaskStatus = s.as_str().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn terminal_statuses_are_exactly_the_documented_set() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
        assert!(TaskStatus::Converted.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Scheduled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn clamp_priority_respects_0_to_10() {
        assert_eq!(Task::clamp_priority(11), 10);
        assert_eq!(Task::clamp_priority(-1), 0);
        assert_eq!(Task::clamp_priority(7), 7);
    }

    #[test]
    fn batch_status_derivation() {
        let mut b = Batch {
            id: "b1".into(),
            template_id: 1,
            total_requested: 3,
            created_count: 0,
            failed_count: 3,
            status: BatchStatus::Pending,
            created_at: Utc::now(),
        };
        assert_eq!(b.derive_status(), BatchStatus::Failed);
        b.created_count = 2;
        b.failed_count = 1;
        assert_eq!(b.derive_status(), BatchStatus::Partial);
        b.created_count = 3;
        b.failed_count = 0;
        assert_eq!(b.derive_status(), BatchStatus::Created);
    }

    #[test]
    fn watch_type_admits_expected_kinds() {
        assert!(WatchType::Status.admits("status_change"));
        assert!(WatchType::Status.admits("completed"));
        assert!(!WatchType::Status.admits("comment_added"));
        assert!(WatchType::All.admits("anything"));
    }

    #[test]
    fn truncate_utf8_respects_char_boundaries() {
        let s = "h\u{1F600}ello"; // contains a 4-byte emoji
        let t = truncate_utf8(s, 2);
        assert!(t.len() <= 2);
        assert!(std::str::from_utf8(t.as_bytes()).is_ok());
    }

    #[test]
    fn risk_delay_windows_match_spec_table() {
        assert_eq!(PromptRisk::Low.delay_window_ms(), (50, 200));
        assert_eq!(PromptRisk::Medium.delay_window_ms(), (300, 600));
        assert_eq!(PromptRisk::High.delay_window_ms(), (800, 1200));
    }

    #[test]
    fn shutdown_state_predicates() {
        assert!(ShutdownState::Running.should_run());
        assert!(!ShutdownState::Stopping.should_run());
        assert!(ShutdownState::Draining.is_shutting_down());
        assert!(!ShutdownState::Terminated.is_shutting_down());
    }

    proptest::proptest! {
        #[test]
        fn clamp_priority_is_always_in_range(v in -1000i32..1000) {
            let c = Task::clamp_priority(v);
            proptest::prop_assert!(c <= 10);
        }

        #[test]
        fn truncate_utf8_never_panics(s in ".*", n in 0usize..64) {
            let _ = truncate_utf8(&s, n);
        }
    }
}
