//! C1: task queue and dispatch core, per `SPEC_FULL.md` §4.3.
//!
//! Wraps [`crate::storage::StorageEngine`] with the task lifecycle
//! operations the rest of the control plane calls: submission (single,
//! templated, and bulk), priority claim, completion, retry-or-fail, and
//! cancellation. Every mutating operation appends a [`TaskEventKind`] to
//! the caller-supplied [`architect_events::EventLog`] so the operator
//! surface and webhook dispatcher can react without polling the database.

use architect_events::{EventLog, TaskEvent};
use architect_types::{CoreError, ItemOutcome, Task, TaskEventKind};
use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::storage::{NewTask, NewTemplate, StorageEngine};

fn push_event(events: &mut EventLog, kind: TaskEventKind, task_id: i64, detail: serde_json::Value) {
    events.record(TaskEvent { timestamp: Utc::now(), task_id, kind, detail });
}

/// A single task submission request, per §4.3's `submit` operation.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_retries: u32,
    pub timeout_seconds: i64,
    pub parent_id: Option<i64>,
    pub batch_id: Option<String>,
    pub sprint_id: Option<i64>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl From<SubmitRequest> for NewTask {
    fn from(req: SubmitRequest) -> Self {
        NewTask {
            task_type: req.task_type,
            payload: req.payload,
            priority: Task::clamp_priority(req.priority),
            max_retries: req.max_retries.max(1),
            timeout_seconds: if req.timeout_seconds > 0 { req.timeout_seconds } else { 300 },
            parent_id: req.parent_id,
            batch_id: req.batch_id,
            sprint_id: req.sprint_id,
            scheduled_for: req.scheduled_for,
        }
    }
}

/// Outcome of `expand_batch`, per §4.3.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub batch_id: String,
    pub outcomes: Vec<ItemOutcome>,
}

/// Per-instantiation overrides for `submit_from_template`, per §4.3. Any
/// field left `None` falls back to the template's default.
#[derive(Debug, Clone, Default)]
pub struct TemplateOverrides {
    pub priority: Option<i32>,
    pub max_retries: Option<u32>,
    pub timeout_seconds: Option<i64>,
    pub parent_id: Option<i64>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

pub struct Queue {
    storage: StorageEngine,
}

impl Queue {
    pub fn new(storage: StorageEngine) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut StorageEngine {
        &mut self.storage
    }

    /// Submit a single task. Rejects an empty `task_type` and a priority
    /// request outside `[0, 10]` is silently clamped, per §4.3.
    pub fn submit(&self, req: SubmitRequest, events: &mut EventLog) -> Result<Task, CoreError> {
        if req.task_type.trim().is_empty() {
            return Err(CoreError::Validation("task_type must not be empty".into()));
        }
        let id = self.storage.insert_task(&req.into())?;
        let task = self.storage.get_task(id)?;
        push_event(events, TaskEventKind::Created, id, serde_json::json!({"task_type": task.task_type}));
        Ok(task)
    }

    /// Submit many independent tasks in one call, per §4.3's `submit_bulk`.
    /// Each item's failure is isolated: one bad request does not abort the
    /// batch, matching `expand_batch`'s partial-failure semantics.
    pub fn submit_bulk(
        &self,
        requests: Vec<SubmitRequest>,
        events: &mut EventLog,
    ) -> Result<Vec<ItemOutcome>, CoreError> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for (index, req) in requests.into_iter().enumerate() {
            match self.submit(req, events) {
                Ok(task) => outcomes.push(ItemOutcome::Created { index, id: task.id }),
                Err(e) => outcomes.push(ItemOutcome::Errored { index, error: e.to_string() }),
            }
        }
        Ok(outcomes)
    }

    /// Register a reusable template, per §4.3's "Templates" section.
    pub fn create_template(&self, template: NewTemplate) -> Result<i64, CoreError> {
        self.storage.create_template(&template)
    }

    /// Instantiate a single task from a template, per §4.3's
    /// `submit_from_template` operation. `bindings` fill the skeleton's
    /// `${var}` placeholders; `overrides` take precedence over the
    /// template's stored defaults. The usage counter bump is best-effort:
    /// its failure does not roll back the task insert.
    pub fn submit_from_template(
        &self,
        template_id: i64,
        bindings: serde_json::Map<String, serde_json::Value>,
        overrides: TemplateOverrides,
        events: &mut EventLog,
    ) -> Result<Task, CoreError> {
        let template = self.storage.get_template(template_id)?;
        let payload = substitute_variables(&template.payload_skeleton, &bindings);

        let req = SubmitRequest {
            task_type: template.task_type.clone(),
            payload,
            priority: overrides.priority.unwrap_or(template.default_priority as i32),
            max_retries: overrides.max_retries.unwrap_or(template.default_max_retries),
            timeout_seconds: overrides.timeout_seconds.unwrap_or(template.default_timeout_seconds),
            parent_id: overrides.parent_id,
            scheduled_for: overrides.scheduled_for,
            ..Default::default()
        };
        let task = self.submit(req, events)?;
        let _ = self.storage.bump_template_usage(template_id);
        Ok(task)
    }

    /// Expand a [`architect_types::TaskTemplate`] over a list of variable
    /// bindings, substituting `${var}` placeholders in the skeleton's JSON
    /// string values, per §4.3's `expand_batch` operation.
    pub fn expand_batch(
        &mut self,
        template_id: i64,
        variable_sets: Vec<serde_json::Map<String, serde_json::Value>>,
        events: &mut EventLog,
    ) -> Result<BatchResult, CoreError> {
        let (skeleton, task_type, priority, max_retries, timeout_seconds) = {
            let conn = self.storage.conn();
            conn.query_row(
                "SELECT payload_skeleton, task_type, default_priority, default_max_retries, default_timeout_seconds
                 FROM task_templates WHERE id = ?1 AND is_active = 1",
                params![template_id],
                |row| {
                    let skeleton: String = row.get(0)?;
                    Ok((skeleton, row.get::<_, String>(1)?, row.get::<_, u8>(2)?, row.get::<_, u32>(3)?, row.get::<_, i64>(4)?))
                },
            )
            .map_err(|_| CoreError::NotFound(format!("template {template_id}")))?
        };
        let skeleton: serde_json::Value = serde_json::from_str(&skeleton)
            .map_err(|e| CoreError::Validation(format!("invalid template skeleton: {e}")))?;

        let batch_id = uuid_like();
        let total = variable_sets.len() as i64;
        self.storage
            .conn()
            .execute(
                "INSERT INTO batches (id, template_id, total_requested, created_count, failed_count, status, created_at)
                 VALUES (?1, ?2, ?3, 0, 0, 'pending', ?4)",
                params![batch_id, template_id, total, Utc::now().to_rfc3339()],
            )
            .map_err(|e| CoreError::Transport(e.to_string()))?;

        let mut outcomes = Vec::with_capacity(variable_sets.len());
        let mut created = 0i64;
        let mut failed = 0i64;

        for (index, vars) in variable_sets.into_iter().enumerate() {
            let payload = substitute_variables(&skeleton, &vars);
            let req = SubmitRequest {
                task_type: task_type.clone(),
                payload,
                priority: priority as i32,
                max_retries,
                timeout_seconds,
                batch_id: Some(batch_id.clone()),
                ..Default::default()
            };
            match self.submit(req, events) {
                Ok(task) => {
                    created += 1;
                    outcomes.push(ItemOutcome::Created { index, id: task.id });
                }
                Err(e) => {
                    failed += 1;
                    outcomes.push(ItemOutcome::Errored { index, error: e.to_string() });
                }
            }
        }

        let status = if created == 0 {
            "failed"
        } else if failed > 0 {
            "partial"
        } else {
            "created"
        };
        self.storage
            .conn()
            .execute(
                "UPDATE batches SET created_count = ?1, failed_count = ?2, status = ?3 WHERE id = ?4",
                params![created, failed, status, batch_id],
            )
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        self.storage
            .conn()
            .execute(
                "UPDATE task_templates SET usage_count = usage_count + 1 WHERE id = ?1",
                params![template_id],
            )
            .map_err(|e| CoreError::Transport(e.to_string()))?;

        Ok(BatchResult { batch_id, outcomes })
    }

    /// Claim the highest-priority eligible task for `worker_id`.
    pub fn claim_next(
        &mut self,
        worker_id: &str,
        skills: &[String],
        events: &mut EventLog,
    ) -> Result<Option<Task>, CoreError> {
        let claimed = self.storage.claim_next(worker_id, skills)?;
        if let Some(task) = &claimed {
            push_event(events, TaskEventKind::Claimed, task.id, serde_json::json!({"worker_id": worker_id}));
        }
        Ok(claimed)
    }

    pub fn complete(&self, id: i64, events: &mut EventLog) -> Result<Task, CoreError> {
        self.storage.complete_task(id)?;
        let task = self.storage.get_task(id)?;
        push_event(events, TaskEventKind::Completed, id, serde_json::Value::Null);
        Ok(task)
    }

    /// Fail a running task. Releases it back to `pending` if retries
    /// remain, else marks it `failed` terminally, per §4.3.
    pub fn fail(&self, id: i64, error_message: &str, events: &mut EventLog) -> Result<Task, CoreError> {
        let status = self.storage.fail_task(id, error_message)?;
        let task = self.storage.get_task(id)?;
        let kind = if status.is_terminal() { TaskEventKind::Failed } else { TaskEventKind::Retrying };
        push_event(events, kind, id, serde_json::json!({"error": error_message}));
        Ok(task)
    }

    /// Release a claimed task back to `pending` without touching its
    /// retry budget. Used when a lease is given up through no fault of the
    /// task itself (e.g. the dispatcher failed to inject the prompt),
    /// per the Open Question resolution in `SPEC_FULL.md` §9.
    pub fn release(&self, id: i64, reason: &str, events: &mut EventLog) -> Result<Task, CoreError> {
        self.storage.release_task(id, reason)?;
        let task = self.storage.get_task(id)?;
        push_event(events, TaskEventKind::Released, id, serde_json::json!({"reason": reason}));
        Ok(task)
    }

    /// Cancel a task, cascading to every non-terminal descendant, per
    /// §4.3's hierarchy semantics.
    pub fn cancel(&mut self, id: i64, events: &mut EventLog) -> Result<Task, CoreError> {
        self.storage.cancel_task(id)?;
        let task = self.storage.get_task(id)?;
        push_event(events, TaskEventKind::Cancelled, id, serde_json::Value::Null);
        Ok(task)
    }

    /// Re-queue failed/cancelled tasks, per §4.3's `retry_failed`
    /// operation. `task_ids = None` retries every `failed`/`cancelled`
    /// task.
    pub fn retry_failed(
        &self,
        task_ids: Option<&[i64]>,
        reset_retries: bool,
        events: &mut EventLog,
    ) -> Result<Vec<i64>, CoreError> {
        let retried = self.storage.retry_failed(task_ids, reset_retries)?;
        for id in &retried {
            push_event(events, TaskEventKind::Retrying, *id, serde_json::json!({"reset_retries": reset_retries}));
        }
        Ok(retried)
    }

    /// Copy terminal tasks older than `older_than` into the archive table
    /// and remove them from the live table, per §4.3's `archive_terminal`.
    pub fn archive_terminal(&mut self, older_than: DateTime<Utc>) -> Result<i64, CoreError> {
        self.storage.archive_terminal(older_than)
    }

    /// Complete `parent_id` iff every descendant has reached a terminal
    /// state, per §4.3's hierarchy-aware auto-completion guard. Returns
    /// whether the transition happened.
    pub fn maybe_complete(&self, parent_id: i64, events: &mut EventLog) -> Result<bool, CoreError> {
        let completed = self.storage.maybe_complete(parent_id)?;
        if completed {
            push_event(events, TaskEventKind::Completed, parent_id, serde_json::Value::Null);
        }
        Ok(completed)
    }

    /// Re-queue any `running` task whose lease has expired, transitioning
    /// it to `timeout`, per §4.3's background sweeper.
    pub fn reap_timed_out(&self, events: &mut EventLog) -> Result<Vec<i64>, CoreError> {
        let reaped = self.storage.reap_timed_out()?;
        for id in &reaped {
            push_event(events, TaskEventKind::Timeout, *id, serde_json::Value::Null);
        }
        Ok(reaped)
    }

    pub fn update_priority(&self, id: i64, priority: i32, events: &mut EventLog) -> Result<Task, CoreError> {
        self.storage.update_priority(id, priority)?;
        let task = self.storage.get_task(id)?;
        push_event(events, TaskEventKind::PriorityChanged, id, serde_json::json!({"priority": task.priority}));
        Ok(task)
    }

    /// Deliver `events` to every enabled webhook subscribed to its kind,
    /// per §4.6. Each attempt's outcome is persisted to
    /// `webhook_deliveries` regardless of success, and a delivery failure
    /// never aborts the remaining fan-out.
    pub fn dispatch_webhooks(&self, client: &architect_webhook::WebhookClient, events: &EventLog) -> Result<(), CoreError> {
        for event in events.all_events() {
            let event_name = event.kind.as_event_name();
            let webhooks = self.storage.webhooks_for_event(event_name)?;
            if webhooks.is_empty() {
                continue;
            }

            let Ok(task) = self.storage.get_task(event.task_id) else { continue };
            let payload = architect_types::WebhookPayload {
                event: event_name.to_string(),
                timestamp: event.timestamp,
                task: architect_types::WebhookTaskView {
                    id: task.id,
                    task_type: task.task_type.clone(),
                    status: task.status.as_str().to_string(),
                    previous_status: None,
                    worker_id: task.assigned_worker.clone(),
                    result: None,
                    error: task.error_message.clone(),
                    data: architect_types::WebhookTaskData {
                        priority: task.priority,
                        description: None,
                        max_retries: task.max_retries,
                        timeout_seconds: task.timeout_seconds,
                    },
                },
            };
            let body = serde_json::to_string(&payload).unwrap_or_default();

            for webhook in &webhooks {
                if let Some(task_types) = &webhook.task_types {
                    if !task_types.iter().any(|t| t == &task.task_type) {
                        continue;
                    }
                }
                let delivery = client.deliver(webhook, event_name, &body);
                let _ = self.storage.record_webhook_delivery(&delivery);
            }
        }
        Ok(())
    }
}

/// Substitute `${name}` placeholders in every string leaf of `skeleton`
/// with the matching entry from `vars`. Non-string leaves and unmatched
/// placeholders pass through unchanged.
fn substitute_variables(
    skeleton: &serde_json::Value,
    vars: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Value {
    match skeleton {
        serde_json::Value::String(s) => {
            let mut out = s.clone();
            for (key, value) in vars {
                let needle = format!("${{{key}}}");
                let replacement = match value {
                    serde_json::Value::String(v) => v.clone(),
                    other => other.to_string(),
                };
                out = out.replace(&needle, &replacement);
            }
            serde_json::Value::String(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| substitute_variables(v, vars)).collect())
        }
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), substitute_variables(v, vars));
            }
            serde_json::Value::Object(out)
        }
        other => other.clone(),
    }
}

/// A locally-unique batch id. Not a cryptographic UUID: timestamp plus a
/// process-local counter is sufficient since batch ids only need to be
/// unique within one database.
fn uuid_like() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("batch-{}-{}-{}", Utc::now().timestamp_micros(), std::process::id(), n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_queue() -> (Queue, EventLog) {
        (Queue::new(StorageEngine::open_in_memory().expect("open")), EventLog::new())
    }

    fn sample_request() -> SubmitRequest {
        SubmitRequest { task_type: "build".into(), payload: serde_json::json!({}), max_retries: 3, ..Default::default() }
    }

    #[test]
    fn submit_rejects_empty_task_type() {
        let (queue, mut events) = new_queue();
        let req = SubmitRequest { task_type: String::new(), ..Default::default() };
        assert!(queue.submit(req, &mut events).is_err());
    }

    #[test]
    fn submit_records_created_event() {
        let (queue, mut events) = new_queue();
        let task = queue.submit(sample_request(), &mut events).expect("submit");
        assert_eq!(events.events_for_task(task.id).len(), 1);
    }

    #[test]
    fn submit_bulk_isolates_failures() {
        let (queue, mut events) = new_queue();
        let requests = vec![sample_request(), SubmitRequest { task_type: String::new(), ..Default::default() }];
        let outcomes = queue.submit_bulk(requests, &mut events).expect("submit_bulk");
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0], ItemOutcome::Created { .. }));
        assert!(matches!(outcomes[1], ItemOutcome::Errored { .. }));
    }

    #[test]
    fn claim_complete_round_trip_records_events() {
        let (mut queue, mut events) = new_queue();
        let task = queue.submit(sample_request(), &mut events).expect("submit");
        let claimed = queue.claim_next("w1", &[], &mut events).expect("claim").expect("some");
        assert_eq!(claimed.id, task.id);
        let completed = queue.complete(task.id, &mut events).expect("complete");
        assert_eq!(completed.status, architect_types::TaskStatus::Completed);
        assert_eq!(events.events_for_task(task.id).len(), 3);
    }

    #[test]
    fn fail_exhausts_retries_then_goes_terminal() {
        let (mut queue, mut events) = new_queue();
        let req = SubmitRequest { max_retries: 1, ..sample_request() };
        let task = queue.submit(req, &mut events).expect("submit");

        queue.claim_next("w1", &[], &mut events).unwrap();
        let retried = queue.fail(task.id, "boom", &mut events).expect("fail");
        assert_eq!(retried.status, architect_types::TaskStatus::Pending);

        queue.claim_next("w1", &[], &mut events).unwrap();
        let failed = queue.fail(task.id, "boom again", &mut events).expect("fail");
        assert_eq!(failed.status, architect_types::TaskStatus::Failed);
    }

    #[test]
    fn release_restores_pending_without_spending_a_retry() {
        let (mut queue, mut events) = new_queue();
        let req = SubmitRequest { max_retries: 1, ..sample_request() };
        let task = queue.submit(req, &mut events).expect("submit");
        queue.claim_next("w1", &[], &mut events).unwrap();

        let released = queue.release(task.id, "injection failed", &mut events).expect("release");
        assert_eq!(released.status, architect_types::TaskStatus::Pending);
        assert_eq!(released.retries, 0);
    }

    #[test]
    fn submit_from_template_binds_variables_and_bumps_usage() {
        let (queue, mut events) = new_queue();
        let template_id = queue
            .create_template(NewTemplate {
                name: "deploy".into(),
                task_type: "deploy".into(),
                payload_skeleton: serde_json::json!({"repo": "${repo}"}),
                default_priority: 5,
                default_max_retries: 3,
                default_timeout_seconds: 300,
                created_by: None,
            })
            .expect("create_template");

        let mut bindings = serde_json::Map::new();
        bindings.insert("repo".into(), serde_json::json!("acme/widgets"));

        let task = queue
            .submit_from_template(template_id, bindings, TemplateOverrides { priority: Some(9), ..Default::default() }, &mut events)
            .expect("submit_from_template");

        assert_eq!(task.task_type, "deploy");
        assert_eq!(task.payload["repo"], serde_json::json!("acme/widgets"));
        assert_eq!(task.priority, 9);

        let template = queue.storage().get_template(template_id).expect("get_template");
        assert_eq!(template.usage_count, 1);
    }

    #[test]
    fn substitute_variables_replaces_string_placeholders() {
        let skeleton = serde_json::json!({"repo": "${repo}", "branch": "main"});
        let mut vars = serde_json::Map::new();
        vars.insert("repo".into(), serde_json::json!("acme/widgets"));
        let out = substitute_variables(&skeleton, &vars);
        assert_eq!(out["repo"], serde_json::json!("acme/widgets"));
        assert_eq!(out["branch"], serde_json::json!("main"));
    }

    #[test]
    fn expand_batch_creates_one_task_per_variable_set() {
        let (mut queue, mut events) = new_queue();
        queue
            .storage()
            .conn()
            .execute(
                "INSERT INTO task_templates (name, task_type, payload_skeleton, default_priority, default_max_retries, default_timeout_seconds, usage_count, is_active, created_at)
                 VALUES ('deploy', 'deploy', '{\"target\": \"${target}\"}', 5, 3, 300, 0, 1, ?1)",
                params![Utc::now().to_rfc3339()],
            )
            .unwrap();
        let template_id = queue.storage().conn().last_insert_rowid();

        let mut vars1 = serde_json::Map::new();
        vars1.insert("target".into(), serde_json::json!("staging"));
        let mut vars2 = serde_json::Map::new();
        vars2.insert("target".into(), serde_json::json!("prod"));

        let result = queue.expand_batch(template_id, vec![vars1, vars2], &mut events).expect("expand");
        assert_eq!(result.outcomes.len(), 2);
        assert!(result.outcomes.iter().all(|o| matches!(o, ItemOutcome::Created { .. })));
    }
}
