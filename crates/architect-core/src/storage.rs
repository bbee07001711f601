//! The embedded relational storage engine, per `SPEC_FULL.md` §4.1.
//!
//! A single SQLite database (via `rusqlite`, bundled) backs every table the
//! control plane needs. The connection is opened in WAL mode with a
//! `busy_timeout` of at least 30 seconds so that concurrent readers never
//! see `SQLITE_BUSY` during a writer's transaction, and multi-statement
//! mutations open with `BEGIN IMMEDIATE` to acquire the write lock up
//! front rather than promoting a reader lock mid-transaction.

use std::path::Path;

use architect_types::{
    CoreError, Sprint, SprintStatus, Task, TaskConversion, TaskStatus, TaskTemplate, TaskTimer,
    TaskWatcher, WatchType, Webhook, WorkLogEntry,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

/// Thin wrapper around a `rusqlite::Connection` configured per §4.1.
pub struct StorageEngine {
    conn: Connection,
}

impl StorageEngine {
    /// Open (creating if necessary) the database at `path` and apply the
    /// schema migration.
    pub fn open(path: &Path) -> Result<Self, CoreError> {
        let conn = Connection::open(path)
            .map_err(|e| CoreError::Transport(format!("failed to open database: {e}")))?;
        Self::configure(&conn)?;
        let engine = Self { conn };
        engine.migrate()?;
        Ok(engine)
    }

    /// Open an in-memory database, for tests.
    pub fn open_in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CoreError::Transport(format!("failed to open database: {e}")))?;
        Self::configure(&conn)?;
        let engine = Self { conn };
        engine.migrate()?;
        Ok(engine)
    }

    fn configure(conn: &Connection) -> Result<(), CoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| CoreError::Transport(format!("failed to set WAL mode: {e}")))?;
        conn.busy_timeout(std::time::Duration::from_millis(30_000))
            .map_err(|e| CoreError::Transport(format!("failed to set busy_timeout: {e}")))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| CoreError::Transport(format!("failed to enable foreign keys: {e}")))?;
        Ok(())
    }

    fn migrate(&self) -> Result<(), CoreError> {
        self.conn
            .execute_batch(SCHEMA)
            .map_err(|e| CoreError::Transport(format!("failed to apply schema: {e}")))
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction, per §4.1's
    /// multi-statement mutation rule.
    pub fn with_immediate_transaction<T>(
        &mut self,
        f: impl FnOnce(&rusqlite::Transaction) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(|e| CoreError::Transport(format!("failed to begin transaction: {e}")))?;
        let result = f(&tx)?;
        tx.commit()
            .map_err(|e| CoreError::Transport(format!("failed to commit transaction: {e}")))?;
        Ok(result)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Insert a new task and return its assigned id.
    pub fn insert_task(&self, task: &NewTask) -> Result<i64, CoreError> {
        let hierarchy_path = match task.parent_id {
            Some(parent_id) => {
                let parent_path: String = self
                    .conn
                    .query_row(
                        "SELECT hierarchy_path FROM tasks WHERE id = ?1",
                        params![parent_id],
                        |row| row.get(0),
                    )
                    .map_err(|_| CoreError::NotFound(format!("parent task {parent_id}")))?;
                format!("{parent_path}/{parent_id}")
            }
            None => String::new(),
        };
        let hierarchy_level = hierarchy_path.split('/').filter(|s| !s.is_empty()).count() as i64;

        self.conn
            .execute(
                "INSERT INTO tasks (
                    task_type, payload, priority, status, retries, max_retries,
                    timeout_seconds, scheduled_for, created_at, parent_id,
                    hierarchy_level, hierarchy_path, child_count, batch_id, sprint_id
                ) VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?12)",
                params![
                    task.task_type,
                    task.payload.to_string(),
                    task.priority,
                    task.max_retries,
                    task.timeout_seconds,
                    task.scheduled_for.map(|t| t.to_rfc3339()),
                    Utc::now().to_rfc3339(),
                    task.parent_id,
                    hierarchy_level,
                    hierarchy_path,
                    task.batch_id,
                    task.sprint_id,
                ],
            )
            .map_err(|e| CoreError::Transport(format!("failed to insert task: {e}")))?;

        let id = self.conn.last_insert_rowid();

        if let Some(parent_id) = task.parent_id {
            self.conn
                .execute(
                    "UPDATE tasks SET child_count = child_count + 1 WHERE id = ?1",
                    params![parent_id],
                )
                .map_err(|e| CoreError::Transport(format!("failed to bump child_count: {e}")))?;
        }

        Ok(id)
    }

    pub fn get_task(&self, id: i64) -> Result<Task, CoreError> {
        self.conn
            .query_row("SELECT * FROM tasks WHERE id = ?1", params![id], row_to_task)
            .optional()
            .map_err(|e| CoreError::Transport(e.to_string()))?
            .ok_or_else(|| CoreError::NotFound(format!("task {id}")))
    }

    /// Atomically claim the highest-priority eligible pending task for a
    /// worker, per §4.3's `claim_next` operation. Tasks whose
    /// `scheduled_for` is in the future are excluded by predicate, not by
    /// mutation (resolves the Open Question in `SPEC_FULL.md` §9).
    pub fn claim_next(&mut self, worker_id: &str, skills: &[String]) -> Result<Option<Task>, CoreError> {
        self.with_immediate_transaction(|tx| {
            let now = Utc::now().to_rfc3339();
            let id: Option<i64> = if skills.is_empty() {
                tx.query_row(
                    "SELECT id FROM tasks
                     WHERE status = 'pending' AND (scheduled_for IS NULL OR scheduled_for <= ?1)
                     ORDER BY priority DESC, created_at ASC
                     LIMIT 1",
                    params![now],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| CoreError::Transport(e.to_string()))?
            } else {
                let placeholders = std::iter::repeat_n("?", skills.len()).collect::<Vec<_>>().join(", ");
                let sql = format!(
                    "SELECT id FROM tasks
                     WHERE status = 'pending' AND (scheduled_for IS NULL OR scheduled_for <= ?1)
                       AND task_type IN ({placeholders})
                     ORDER BY priority DESC, created_at ASC
                     LIMIT 1"
                );
                let mut stmt = tx.prepare(&sql).map_err(|e| CoreError::Transport(e.to_string()))?;
                let mut params: Vec<&dyn rusqlite::ToSql> = vec![&now];
                for skill in skills {
                    params.push(skill);
                }
                stmt.query_row(params.as_slice(), |row| row.get(0))
                    .optional()
                    .map_err(|e| CoreError::Transport(e.to_string()))?
            };

            let Some(id) = id else { return Ok(None) };

            tx.execute(
                "UPDATE tasks SET status = 'running', assigned_worker = ?1, started_at = ?2
                 WHERE id = ?3 AND status = 'pending'",
                params![worker_id, Utc::now().to_rfc3339(), id],
            )
            .map_err(|e| CoreError::Transport(e.to_string()))?;

            if tx.changed_row_count() == 0 {
                // Raced with another claimant; caller may retry.
                return Ok(None);
            }

            let task = tx
                .query_row("SELECT * FROM tasks WHERE id = ?1", params![id], row_to_task)
                .map_err(|e| CoreError::Transport(e.to_string()))?;
            Ok(Some(task))
        })
    }

    pub fn complete_task(&self, id: i64) -> Result<(), CoreError> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET status = 'completed', completed_at = ?1
                 WHERE id = ?2 AND status = 'running'",
                params![now, id],
            )
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        if changed == 0 {
            return Err(CoreError::StateConflict(format!(
                "task {id} is not running"
            )));
        }
        Ok(())
    }

    /// Fail a task. If `retries < max_retries`, it is released back to
    /// `pending` with `retries` incremented (the lease does not count
    /// against the budget beyond the normal increment, per the Open
    /// Question resolution in `SPEC_FULL.md` §9); otherwise it becomes
    /// `failed`.
    pub fn fail_task(&self, id: i64, error_message: &str) -> Result<TaskStatus, CoreError> {
        let task = self.get_task(id)?;
        let now = Utc::now().to_rfc3339();

        if task.retries < task.max_retries {
            self.conn
                .execute(
                    "UPDATE tasks SET status = 'pending', retries = retries + 1,
                     error_message = ?1, assigned_worker = NULL, started_at = NULL
                     WHERE id = ?2",
                    params![error_message, id],
                )
                .map_err(|e| CoreError::Transport(e.to_string()))?;
            Ok(TaskStatus::Pending)
        } else {
            self.conn
                .execute(
                    "UPDATE tasks SET status = 'failed', retries = retries + 1,
                     error_message = ?1, completed_at = ?2
                     WHERE id = ?3",
                    params![error_message, now, id],
                )
                .map_err(|e| CoreError::Transport(e.to_string()))?;
            Ok(TaskStatus::Failed)
        }
    }

    /// Release a claimed task back to `pending` without touching its
    /// retry budget, per the dispatcher-side release Open Question in
    /// `SPEC_FULL.md` §9: a prompt-injection failure is the dispatcher's
    /// fault, not the task's, so it must not count against `max_retries`.
    pub fn release_task(&self, id: i64, reason: &str) -> Result<(), CoreError> {
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET status = 'pending', error_message = ?1,
                 assigned_worker = NULL, started_at = NULL
                 WHERE id = ?2 AND status = 'running'",
                params![reason, id],
            )
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        if changed == 0 {
            return Err(CoreError::StateConflict(format!("task {id} is not running")));
        }
        Ok(())
    }

    /// Cancel `id` and cascade the cancellation to every non-terminal
    /// descendant, per §4.3's hierarchy semantics.
    pub fn cancel_task(&mut self, id: i64) -> Result<(), CoreError> {
        self.with_immediate_transaction(|tx| {
            let now = Utc::now().to_rfc3339();
            let changed = tx
                .execute(
                    "UPDATE tasks SET status = 'cancelled', completed_at = ?1
                     WHERE id = ?2 AND status IN ('pending', 'scheduled', 'running')",
                    params![now, id],
                )
                .map_err(|e| CoreError::Transport(e.to_string()))?;
            if changed == 0 {
                return Err(CoreError::StateConflict(format!(
                    "task {id} is already in a terminal state"
                )));
            }

            let pattern_exact = format!("/{id}");
            let pattern_prefix = format!("/{id}/%");
            tx.execute(
                "UPDATE tasks SET status = 'cancelled', completed_at = ?1
                 WHERE (hierarchy_path = ?2 OR hierarchy_path LIKE ?3)
                   AND status IN ('pending', 'scheduled', 'running')",
                params![now, pattern_exact, pattern_prefix],
            )
            .map_err(|e| CoreError::Transport(e.to_string()))?;
            Ok(())
        })
    }

    pub fn update_priority(&self, id: i64, priority: i32) -> Result<(), CoreError> {
        let clamped = Task::clamp_priority(priority);
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET priority = ?1 WHERE id = ?2",
                params![clamped, id],
            )
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    pub fn count_by_status(&self, status: TaskStatus) -> Result<i64, CoreError> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM tasks WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| CoreError::Transport(e.to_string()))
    }

    /// Register a new template, per §4.3's "Templates" section.
    pub fn create_template(&self, template: &NewTemplate) -> Result<i64, CoreError> {
        self.conn
            .execute(
                "INSERT INTO task_templates (
                    name, task_type, payload_skeleton, default_priority,
                    default_max_retries, default_timeout_seconds, usage_count,
                    is_active, created_at, created_by
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 1, ?7, ?8)",
                params![
                    template.name,
                    template.task_type,
                    template.payload_skeleton.to_string(),
                    template.default_priority,
                    template.default_max_retries,
                    template.default_timeout_seconds,
                    Utc::now().to_rfc3339(),
                    template.created_by,
                ],
            )
            .map_err(|e| CoreError::Transport(format!("failed to insert template: {e}")))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_template(&self, id: i64) -> Result<TaskTemplate, CoreError> {
        self.conn
            .query_row(
                "SELECT id, name, task_type, payload_skeleton, default_priority,
                        default_max_retries, default_timeout_seconds, usage_count,
                        is_active, created_at, created_by
                 FROM task_templates WHERE id = ?1 AND is_active = 1",
                params![id],
                row_to_template,
            )
            .optional()
            .map_err(|e| CoreError::Transport(e.to_string()))?
            .ok_or_else(|| CoreError::NotFound(format!("template {id}")))
    }

    /// Bump a template's usage counter. Best-effort per §4.3's failure
    /// semantics: the caller's task insert is not rolled back if this fails.
    pub fn bump_template_usage(&self, id: i64) -> Result<(), CoreError> {
        self.conn
            .execute("UPDATE task_templates SET usage_count = usage_count + 1 WHERE id = ?1", params![id])
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        Ok(())
    }

    /// Re-queue failed/cancelled tasks, per §4.3's `retry_failed` operation.
    /// When `task_ids` is `None`, every `failed`/`cancelled` task is
    /// retried. `reset_retries` zeroes the counter instead of respecting
    /// the existing budget.
    pub fn retry_failed(&self, task_ids: Option<&[i64]>, reset_retries: bool) -> Result<Vec<i64>, CoreError> {
        let retries_clause = if reset_retries { ", retries = 0" } else { "" };
        let ids: Vec<i64> = match task_ids {
            Some(ids) => ids.to_vec(),
            None => {
                let mut stmt = self
                    .conn
                    .prepare("SELECT id FROM tasks WHERE status IN ('failed', 'cancelled')")
                    .map_err(|e| CoreError::Transport(e.to_string()))?;
                stmt.query_map([], |row| row.get(0))
                    .map_err(|e| CoreError::Transport(e.to_string()))?
                    .collect::<Result<Vec<i64>, _>>()
                    .map_err(|e| CoreError::Transport(e.to_string()))?
            }
        };

        let mut retried = Vec::with_capacity(ids.len());
        for id in ids {
            let sql = format!(
                "UPDATE tasks SET status = 'pending', error_message = NULL,
                 assigned_worker = NULL, started_at = NULL, completed_at = NULL{retries_clause}
                 WHERE id = ?1 AND status IN ('failed', 'cancelled')"
            );
            let changed = self
                .conn
                .execute(&sql, params![id])
                .map_err(|e| CoreError::Transport(e.to_string()))?;
            if changed > 0 {
                retried.push(id);
            }
        }
        Ok(retried)
    }

    /// Copy terminal tasks older than `older_than` into `task_archive` and
    /// remove them from the live table, per §4.3's `archive_terminal`.
    pub fn archive_terminal(&mut self, older_than: DateTime<Utc>) -> Result<i64, CoreError> {
        self.with_immediate_transaction(|tx| {
            let cutoff = older_than.to_rfc3339();
            tx.execute(
                "INSERT INTO task_archive (id, task_type, payload, status, created_at, completed_at, archived_at)
                 SELECT id, task_type, payload, status, created_at, completed_at, ?1
                 FROM tasks
                 WHERE status IN ('completed', 'failed', 'cancelled', 'timeout', 'converted')
                   AND COALESCE(completed_at, created_at) < ?2",
                params![Utc::now().to_rfc3339(), cutoff],
            )
            .map_err(|e| CoreError::Transport(e.to_string()))?;

            let archived = tx
                .execute(
                    "DELETE FROM tasks
                     WHERE status IN ('completed', 'failed', 'cancelled', 'timeout', 'converted')
                       AND COALESCE(completed_at, created_at) < ?1",
                    params![cutoff],
                )
                .map_err(|e| CoreError::Transport(e.to_string()))?;
            Ok(archived as i64)
        })
    }

    /// Complete `parent_id` iff none of its descendants are in a
    /// non-terminal state, per §4.3's hierarchy semantics. Returns whether
    /// the transition happened.
    pub fn maybe_complete(&self, parent_id: i64) -> Result<bool, CoreError> {
        let parent = self.get_task(parent_id)?;
        if parent.status.is_terminal() {
            return Ok(false);
        }

        let pattern_exact = format!("/{parent_id}");
        let pattern_prefix = format!("/{parent_id}/%");
        let non_terminal: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM tasks
                 WHERE (hierarchy_path = ?1 OR hierarchy_path LIKE ?2)
                   AND status NOT IN ('completed', 'failed', 'cancelled', 'timeout', 'converted')",
                params![pattern_exact, pattern_prefix],
                |row| row.get(0),
            )
            .map_err(|e| CoreError::Transport(e.to_string()))?;

        if non_terminal > 0 {
            return Ok(false);
        }

        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET status = 'completed', completed_at = ?1 WHERE id = ?2 AND status = 'running'",
                params![Utc::now().to_rfc3339(), parent_id],
            )
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        Ok(changed > 0)
    }

    /// Re-queue any `running` task whose lease has expired
    /// (`started_at + timeout_seconds < now`), transitioning it to
    /// `timeout`, per §4.3's background sweeper.
    pub fn reap_timed_out(&self) -> Result<Vec<i64>, CoreError> {
        let now = Utc::now().to_rfc3339();
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id FROM tasks
                 WHERE status = 'running'
                   AND started_at IS NOT NULL
                   AND datetime(started_at, printf('%+d seconds', timeout_seconds)) < datetime(?1)",
            )
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        let ids: Vec<i64> = stmt
            .query_map(params![now], |row| row.get(0))
            .map_err(|e| CoreError::Transport(e.to_string()))?
            .collect::<Result<Vec<i64>, _>>()
            .map_err(|e| CoreError::Transport(e.to_string()))?;

        for id in &ids {
            self.conn
                .execute(
                    "UPDATE tasks SET status = 'timeout', completed_at = ?1 WHERE id = ?2 AND status = 'running'",
                    params![now, id],
                )
                .map_err(|e| CoreError::Transport(e.to_string()))?;
        }
        Ok(ids)
    }

    /// Subscribe `user_id` to `task_id`, updating the existing row's
    /// settings rather than inserting a second one on a repeat call.
    pub fn upsert_watcher(
        &self,
        task_id: i64,
        task_type: &str,
        user_id: &str,
        watch_type: WatchType,
        notify_email: bool,
        notify_dashboard: bool,
    ) -> Result<TaskWatcher, CoreError> {
        self.conn
            .execute(
                "INSERT INTO task_watchers (task_id, task_type, user_id, watch_type, notify_email, notify_dashboard)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(task_id, user_id) DO UPDATE SET
                    watch_type = excluded.watch_type,
                    notify_email = excluded.notify_email,
                    notify_dashboard = excluded.notify_dashboard",
                params![task_id, task_type, user_id, watch_type.as_str(), notify_email, notify_dashboard],
            )
            .map_err(|e| CoreError::Transport(e.to_string()))?;

        self.conn
            .query_row(
                "SELECT id, task_id, task_type, user_id, watch_type, notify_email, notify_dashboard
                 FROM task_watchers WHERE task_id = ?1 AND user_id = ?2",
                params![task_id, user_id],
                row_to_watcher,
            )
            .map_err(|e| CoreError::Transport(e.to_string()))
    }

    pub fn delete_watcher(&self, task_id: i64, user_id: &str) -> Result<(), CoreError> {
        self.conn
            .execute("DELETE FROM task_watchers WHERE task_id = ?1 AND user_id = ?2", params![task_id, user_id])
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        Ok(())
    }

    pub fn watchers_for_task(&self, task_id: i64) -> Result<Vec<TaskWatcher>, CoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, task_id, task_type, user_id, watch_type, notify_email, notify_dashboard
                 FROM task_watchers WHERE task_id = ?1",
            )
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        stmt.query_map(params![task_id], row_to_watcher)
            .map_err(|e| CoreError::Transport(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CoreError::Transport(e.to_string()))
    }

    /// Append a time-tracking entry, per §4.3's worklog.
    pub fn log_work(
        &self,
        task_id: i64,
        user_id: &str,
        time_spent_minutes: u32,
        work_date: chrono::NaiveDate,
        work_type: &str,
        billable: bool,
        description: &str,
    ) -> Result<i64, CoreError> {
        self.conn
            .execute(
                "INSERT INTO work_log (task_id, user_id, time_spent_minutes, work_date, work_type, billable, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![task_id, user_id, time_spent_minutes, work_date.to_string(), work_type, billable, description, Utc::now().to_rfc3339()],
            )
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn work_log_for_task(&self, task_id: i64) -> Result<Vec<WorkLogEntry>, CoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, task_id, user_id, time_spent_minutes, work_date, work_type, billable, description, created_at
                 FROM work_log WHERE task_id = ?1 ORDER BY created_at",
            )
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        stmt.query_map(params![task_id], row_to_work_log)
            .map_err(|e| CoreError::Transport(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CoreError::Transport(e.to_string()))
    }

    /// Start a timer for `user_id` on `task_id`. §4.3 allows at most one
    /// active timer per user, enforced by the table's `UNIQUE(user_id)`.
    pub fn start_timer(&self, task_id: i64, user_id: &str) -> Result<TaskTimer, CoreError> {
        self.conn
            .execute(
                "INSERT INTO task_timers (task_id, user_id, started_at) VALUES (?1, ?2, ?3)",
                params![task_id, user_id, Utc::now().to_rfc3339()],
            )
            .map_err(|e| CoreError::Transport(format!("failed to start timer (is one already running?): {e}")))?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, task_id, user_id, started_at FROM task_timers WHERE id = ?1",
                params![id],
                row_to_timer,
            )
            .map_err(|e| CoreError::Transport(e.to_string()))
    }

    /// Stop `user_id`'s active timer and record the elapsed span as a
    /// worklog entry.
    pub fn stop_timer(&self, user_id: &str, work_type: &str, description: &str) -> Result<WorkLogEntry, CoreError> {
        let timer = self
            .conn
            .query_row(
                "SELECT id, task_id, user_id, started_at FROM task_timers WHERE user_id = ?1",
                params![user_id],
                row_to_timer,
            )
            .map_err(|_| CoreError::NotFound(format!("no active timer for {user_id}")))?;

        let elapsed_minutes = (Utc::now() - timer.started_at).num_minutes().max(0) as u32;
        let id = self.log_work(timer.task_id, user_id, elapsed_minutes, Utc::now().date_naive(), work_type, true, description)?;
        self.conn
            .execute("DELETE FROM task_timers WHERE id = ?1", params![timer.id])
            .map_err(|e| CoreError::Transport(e.to_string()))?;

        self.conn
            .query_row(
                "SELECT id, task_id, user_id, time_spent_minutes, work_date, work_type, billable, description, created_at
                 FROM work_log WHERE id = ?1",
                params![id],
                row_to_work_log,
            )
            .map_err(|e| CoreError::Transport(e.to_string()))
    }

    /// Create a sprint, per §4.3's planning surface.
    pub fn create_sprint(&self, name: &str, goal: Option<&str>, start_date: Option<chrono::NaiveDate>, end_date: Option<chrono::NaiveDate>) -> Result<i64, CoreError> {
        self.conn
            .execute(
                "INSERT INTO sprints (name, goal, start_date, end_date, status) VALUES (?1, ?2, ?3, ?4, 'planned')",
                params![name, goal, start_date.map(|d| d.to_string()), end_date.map(|d| d.to_string())],
            )
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_sprint(&self, id: i64) -> Result<Sprint, CoreError> {
        self.conn
            .query_row(
                "SELECT id, name, goal, start_date, end_date, status FROM sprints WHERE id = ?1",
                params![id],
                row_to_sprint,
            )
            .map_err(|_| CoreError::NotFound(format!("sprint {id}")))
    }

    pub fn list_sprints(&self) -> Result<Vec<Sprint>, CoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, goal, start_date, end_date, status FROM sprints ORDER BY id")
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        stmt.query_map([], row_to_sprint)
            .map_err(|e| CoreError::Transport(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CoreError::Transport(e.to_string()))
    }

    pub fn update_sprint_status(&self, id: i64, status: SprintStatus) -> Result<(), CoreError> {
        let changed = self
            .conn
            .execute("UPDATE sprints SET status = ?1 WHERE id = ?2", params![status.as_str(), id])
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!("sprint {id}")));
        }
        Ok(())
    }

    /// Record that `source_task_id` was promoted to `target_reference`
    /// (e.g. `"feature:42"`), per §4.3's board-view conversion path.
    pub fn convert_task(&self, source_task_id: i64, target_reference: &str) -> Result<TaskConversion, CoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO task_conversions (source_task_id, target_reference, converted_at) VALUES (?1, ?2, ?3)",
                params![source_task_id, target_reference, now],
            )
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        self.conn
            .execute("UPDATE tasks SET status = 'converted' WHERE id = ?1", params![source_task_id])
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        let id = self.conn.last_insert_rowid();
        Ok(TaskConversion {
            id,
            source_task_id,
            target_reference: target_reference.to_string(),
            converted_at: DateTime::parse_from_rfc3339(&now).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
        })
    }

    pub fn conversions_for_task(&self, source_task_id: i64) -> Result<Vec<TaskConversion>, CoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, source_task_id, target_reference, converted_at FROM task_conversions WHERE source_task_id = ?1")
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        stmt.query_map(params![source_task_id], row_to_conversion)
            .map_err(|e| CoreError::Transport(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CoreError::Transport(e.to_string()))
    }

    /// Register a webhook subscription, per §4.6.
    pub fn create_webhook(
        &self,
        name: &str,
        url: &str,
        secret: Option<&str>,
        events: &[String],
        task_types: Option<&[String]>,
        retry_count: u32,
        timeout_seconds: u64,
    ) -> Result<i64, CoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO webhooks (name, url, secret, events, task_types, retry_count, timeout_seconds, enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8)",
                params![
                    name,
                    url,
                    secret,
                    serde_json::to_string(events).unwrap_or_else(|_| "[]".into()),
                    task_types.map(|t| serde_json::to_string(t).unwrap_or_else(|_| "null".into())),
                    retry_count,
                    timeout_seconds,
                    now,
                ],
            )
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_webhook(&self, id: i64) -> Result<Webhook, CoreError> {
        self.conn
            .query_row(
                "SELECT id, name, url, secret, events, task_types, retry_count, timeout_seconds, enabled, created_at, updated_at
                 FROM webhooks WHERE id = ?1",
                params![id],
                row_to_webhook,
            )
            .map_err(|_| CoreError::NotFound(format!("webhook {id}")))
    }

    pub fn list_webhooks(&self) -> Result<Vec<Webhook>, CoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, url, secret, events, task_types, retry_count, timeout_seconds, enabled, created_at, updated_at
                 FROM webhooks ORDER BY id",
            )
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        stmt.query_map([], row_to_webhook)
            .map_err(|e| CoreError::Transport(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CoreError::Transport(e.to_string()))
    }

    /// Webhooks enabled and subscribed to `event`, per §4.6's fan-out rule.
    pub fn webhooks_for_event(&self, event: &str) -> Result<Vec<Webhook>, CoreError> {
        Ok(self
            .list_webhooks()?
            .into_iter()
            .filter(|w| w.enabled && w.events.iter().any(|e| e == event))
            .collect())
    }

    pub fn delete_webhook(&self, id: i64) -> Result<(), CoreError> {
        self.conn
            .execute("DELETE FROM webhooks WHERE id = ?1", params![id])
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        Ok(())
    }

    /// Record the outcome of a webhook delivery attempt, per §4.6.
    pub fn record_webhook_delivery(&self, delivery: &architect_types::WebhookDelivery) -> Result<(), CoreError> {
        self.conn
            .execute(
                "INSERT INTO webhook_deliveries (webhook_id, event, task_id, payload, status_code, success, duration_ms, response_body, error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    delivery.webhook_id,
                    delivery.event,
                    delivery.task_id,
                    delivery.payload,
                    delivery.status_code,
                    delivery.success,
                    delivery.duration_ms as i64,
                    delivery.response_body,
                    delivery.error,
                    delivery.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        Ok(())
    }
}

/// Fields required to submit a new task, per `SPEC_FULL.md` §4.3.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: u8,
    pub max_retries: u32,
    pub timeout_seconds: i64,
    pub parent_id: Option<i64>,
    pub batch_id: Option<String>,
    pub sprint_id: Option<i64>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl Default for NewTask {
    fn default() -> Self {
        Self {
            task_type: String::new(),
            payload: serde_json::Value::Null,
            priority: 5,
            max_retries: 3,
            timeout_seconds: 300,
            parent_id: None,
            batch_id: None,
            sprint_id: None,
            scheduled_for: None,
        }
    }
}

/// Fields required to register a new template, per §4.3's "Templates".
#[derive(Debug, Clone)]
pub struct NewTemplate {
    pub name: String,
    pub task_type: String,
    pub payload_skeleton: serde_json::Value,
    pub default_priority: u8,
    pub default_max_retries: u32,
    pub default_timeout_seconds: i64,
    pub created_by: Option<String>,
}

fn row_to_template(row: &rusqlite::Row) -> rusqlite::Result<TaskTemplate> {
    let skeleton_text: String = row.get(3)?;
    let created_at: String = row.get(9)?;
    Ok(TaskTemplate {
        id: row.get(0)?,
        name: row.get(1)?,
        task_type: row.get(2)?,
        payload_skeleton: serde_json::from_str(&skeleton_text).unwrap_or(serde_json::Value::Null),
        default_priority: row.get(4)?,
        default_max_retries: row.get(5)?,
        default_timeout_seconds: row.get(6)?,
        usage_count: row.get(7)?,
        is_active: row.get::<_, i64>(8)? != 0,
        created_at: DateTime::parse_from_rfc3339(&created_at).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
        created_by: row.get(10)?,
    })
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let payload_text: String = row.get("payload")?;
    let status_text: String = row.get("status")?;
    let scheduled_for: Option<String> = row.get("scheduled_for")?;
    let started_at: Option<String> = row.get("started_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;
    let created_at: String = row.get("created_at")?;

    Ok(Task {
        id: row.get("id")?,
        task_type: row.get("task_type")?,
        payload: serde_json::from_str(&payload_text).unwrap_or(serde_json::Value::Null),
        priority: row.get("priority")?,
        status: status_text.parse().unwrap_or(TaskStatus::Pending),
        retries: row.get("retries")?,
        max_retries: row.get("max_retries")?,
        timeout_seconds: row.get("timeout_seconds")?,
        assigned_worker: row.get("assigned_worker")?,
        assigned_node: row.get("assigned_node")?,
        scheduled_for: scheduled_for.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
        created_at: DateTime::parse_from_rfc3339(&created_at).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
        started_at: started_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
        completed_at: completed_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
        error_message: row.get("error_message")?,
        parent_id: row.get("parent_id")?,
        hierarchy_level: row.get("hierarchy_level")?,
        hierarchy_path: row.get("hierarchy_path")?,
        child_count: row.get("child_count")?,
        batch_id: row.get("batch_id")?,
        sprint_id: row.get("sprint_id")?,
    })
}

fn row_to_watcher(row: &rusqlite::Row) -> rusqlite::Result<TaskWatcher> {
    let watch_type_text: String = row.get(4)?;
    Ok(TaskWatcher {
        id: row.get(0)?,
        task_id: row.get(1)?,
        task_type: row.get(2)?,
        user_id: row.get(3)?,
        watch_type: watch_type_text.parse().unwrap_or(WatchType::All),
        notify_email: row.get::<_, i64>(5)? != 0,
        notify_dashboard: row.get::<_, i64>(6)? != 0,
    })
}

fn row_to_work_log(row: &rusqlite::Row) -> rusqlite::Result<WorkLogEntry> {
    let work_date: String = row.get(4)?;
    let created_at: String = row.get(8)?;
    Ok(WorkLogEntry {
        id: row.get(0)?,
        task_id: row.get(1)?,
        user_id: row.get(2)?,
        time_spent_minutes: row.get(3)?,
        work_date: chrono::NaiveDate::parse_from_str(&work_date, "%Y-%m-%d").unwrap_or_else(|_| Utc::now().date_naive()),
        work_type: row.get(5)?,
        billable: row.get::<_, i64>(6)? != 0,
        description: row.get(7)?,
        created_at: DateTime::parse_from_rfc3339(&created_at).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_timer(row: &rusqlite::Row) -> rusqlite::Result<TaskTimer> {
    let started_at: String = row.get(3)?;
    Ok(TaskTimer {
        id: row.get(0)?,
        task_id: row.get(1)?,
        user_id: row.get(2)?,
        started_at: DateTime::parse_from_rfc3339(&started_at).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_sprint(row: &rusqlite::Row) -> rusqlite::Result<Sprint> {
    let start_date: Option<String> = row.get(3)?;
    let end_date: Option<String> = row.get(4)?;
    let status_text: String = row.get(5)?;
    Ok(Sprint {
        id: row.get(0)?,
        name: row.get(1)?,
        goal: row.get(2)?,
        start_date: start_date.and_then(|d| chrono::NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        end_date: end_date.and_then(|d| chrono::NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        status: status_text.parse().unwrap_or(SprintStatus::Planned),
    })
}

fn row_to_conversion(row: &rusqlite::Row) -> rusqlite::Result<TaskConversion> {
    let converted_at: String = row.get(3)?;
    Ok(TaskConversion {
        id: row.get(0)?,
        source_task_id: row.get(1)?,
        target_reference: row.get(2)?,
        converted_at: DateTime::parse_from_rfc3339(&converted_at).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_webhook(row: &rusqlite::Row) -> rusqlite::Result<Webhook> {
    let events_text: String = row.get(4)?;
    let task_types_text: Option<String> = row.get(5)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    Ok(Webhook {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        secret: row.get(3)?,
        events: serde_json::from_str(&events_text).unwrap_or_default(),
        task_types: task_types_text.and_then(|t| serde_json::from_str(&t).ok()),
        retry_count: row.get(6)?,
        timeout_seconds: row.get(7)?,
        enabled: row.get::<_, i64>(8)? != 0,
        created_at: DateTime::parse_from_rfc3339(&created_at).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
        updated_at: DateTime::parse_from_rfc3339(&updated_at).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
    })
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 5,
    status TEXT NOT NULL DEFAULT 'pending',
    retries INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    timeout_seconds INTEGER NOT NULL DEFAULT 300,
    assigned_worker TEXT,
    assigned_node TEXT,
    scheduled_for TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    error_message TEXT,
    parent_id INTEGER REFERENCES tasks(id),
    hierarchy_level INTEGER NOT NULL DEFAULT 0,
    hierarchy_path TEXT NOT NULL DEFAULT '',
    child_count INTEGER NOT NULL DEFAULT 0,
    batch_id TEXT,
    sprint_id INTEGER
);
CREATE INDEX IF NOT EXISTS idx_tasks_status_priority ON tasks(status, priority DESC, created_at ASC);
CREATE INDEX IF NOT EXISTS idx_tasks_batch ON tasks(batch_id);

CREATE TABLE IF NOT EXISTS task_archive (
    id INTEGER PRIMARY KEY,
    task_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    completed_at TEXT,
    archived_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_templates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    task_type TEXT NOT NULL,
    payload_skeleton TEXT NOT NULL,
    default_priority INTEGER NOT NULL DEFAULT 5,
    default_max_retries INTEGER NOT NULL DEFAULT 3,
    default_timeout_seconds INTEGER NOT NULL DEFAULT 300,
    usage_count INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    created_by TEXT
);

CREATE TABLE IF NOT EXISTS batches (
    id TEXT PRIMARY KEY,
    template_id INTEGER NOT NULL REFERENCES task_templates(id),
    total_requested INTEGER NOT NULL,
    created_count INTEGER NOT NULL DEFAULT 0,
    failed_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workers (
    worker_id TEXT PRIMARY KEY,
    worker_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    capacity INTEGER NOT NULL DEFAULT 1,
    current_load INTEGER NOT NULL DEFAULT 0,
    active_connections INTEGER NOT NULL DEFAULT 0,
    last_heartbeat TEXT NOT NULL,
    skills TEXT NOT NULL DEFAULT '[]',
    weight REAL NOT NULL DEFAULT 1.0,
    restart_count INTEGER NOT NULL DEFAULT 0,
    region_id TEXT
);

CREATE TABLE IF NOT EXISTS sessions (
    session_name TEXT PRIMARY KEY,
    node_id TEXT,
    activity TEXT NOT NULL DEFAULT 'idle',
    assigned_entity TEXT,
    last_heartbeat TEXT NOT NULL,
    cooldown_until TEXT,
    capabilities TEXT NOT NULL DEFAULT '[]',
    idle_ticks INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS webhooks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    url TEXT NOT NULL,
    secret TEXT,
    events TEXT NOT NULL DEFAULT '[]',
    task_types TEXT,
    retry_count INTEGER NOT NULL DEFAULT 3,
    timeout_seconds INTEGER NOT NULL DEFAULT 10,
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS webhook_deliveries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    webhook_id INTEGER NOT NULL REFERENCES webhooks(id),
    event TEXT NOT NULL,
    task_id INTEGER,
    payload TEXT NOT NULL,
    status_code INTEGER,
    success INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    response_body TEXT,
    error TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS prompt_patterns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pattern_type TEXT NOT NULL,
    pattern_name TEXT NOT NULL,
    pattern_regex TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    action TEXT NOT NULL,
    confidence_threshold REAL NOT NULL DEFAULT 0.6,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(pattern_name, tool_name)
);

CREATE TABLE IF NOT EXISTS prompt_occurrences (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pattern_id INTEGER NOT NULL REFERENCES prompt_patterns(id),
    session_name TEXT NOT NULL,
    matched_text TEXT NOT NULL,
    context TEXT NOT NULL DEFAULT '',
    timestamp TEXT NOT NULL,
    response_action TEXT NOT NULL,
    response_success INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_occurrences_pattern_ts ON prompt_occurrences(pattern_id, timestamp);

CREATE TABLE IF NOT EXISTS trends (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pattern_id INTEGER NOT NULL REFERENCES prompt_patterns(id),
    hour_bucket TEXT NOT NULL,
    occurrence_count INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    UNIQUE(pattern_id, hour_bucket)
);

CREATE TABLE IF NOT EXISTS pattern_changes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    change_type TEXT NOT NULL,
    pattern_id INTEGER REFERENCES prompt_patterns(id),
    description TEXT NOT NULL,
    detected_at TEXT NOT NULL,
    acknowledged INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS rollback_snapshots (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    description TEXT NOT NULL,
    git_commit TEXT,
    git_branch TEXT,
    db_backup_path TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_watchers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL,
    task_type TEXT NOT NULL,
    user_id TEXT NOT NULL,
    watch_type TEXT NOT NULL DEFAULT 'all',
    notify_email INTEGER NOT NULL DEFAULT 0,
    notify_dashboard INTEGER NOT NULL DEFAULT 1,
    UNIQUE(task_id, user_id)
);

CREATE TABLE IF NOT EXISTS work_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL,
    user_id TEXT NOT NULL,
    time_spent_minutes INTEGER NOT NULL,
    work_date TEXT NOT NULL,
    work_type TEXT NOT NULL DEFAULT 'development',
    billable INTEGER NOT NULL DEFAULT 1,
    description TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_timers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL,
    user_id TEXT NOT NULL UNIQUE,
    started_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sprints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    goal TEXT,
    start_date TEXT,
    end_date TEXT,
    status TEXT NOT NULL DEFAULT 'planned'
);

CREATE TABLE IF NOT EXISTS task_conversions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_task_id INTEGER NOT NULL,
    target_reference TEXT NOT NULL,
    converted_at TEXT NOT NULL
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> NewTask {
        NewTask { task_type: "build".to_string(), payload: serde_json::json!({"x": 1}), ..Default::default() }
    }

    #[test]
    fn open_in_memory_applies_schema() {
        let engine = StorageEngine::open_in_memory().expect("open");
        assert_eq!(engine.count_by_status(TaskStatus::Pending).unwrap(), 0);
    }

    #[test]
    fn insert_and_get_task_round_trips() {
        let engine = StorageEngine::open_in_memory().expect("open");
        let id = engine.insert_task(&sample_task()).expect("insert");
        let task = engine.get_task(id).expect("get");
        assert_eq!(task.task_type, "build");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 5);
    }

    #[test]
    fn claim_next_assigns_highest_priority_first() {
        let mut engine = StorageEngine::open_in_memory().expect("open");
        let low = NewTask { priority: 1, ..sample_task() };
        let high = NewTask { priority: 9, ..sample_task() };
        engine.insert_task(&low).unwrap();
        let high_id = engine.insert_task(&high).unwrap();

        let claimed = engine.claim_next("worker-1", &[]).expect("claim").expect("some task");
        assert_eq!(claimed.id, high_id);
        assert_eq!(claimed.status, TaskStatus::Running);
        assert_eq!(claimed.assigned_worker.as_deref(), Some("worker-1"));
    }

    #[test]
    fn claim_next_returns_none_when_empty() {
        let mut engine = StorageEngine::open_in_memory().expect("open");
        assert!(engine.claim_next("worker-1", &[]).unwrap().is_none());
    }

    #[test]
    fn claim_next_skips_future_scheduled_tasks() {
        let mut engine = StorageEngine::open_in_memory().expect("open");
        let future = NewTask {
            scheduled_for: Some(Utc::now() + chrono::Duration::hours(1)),
            ..sample_task()
        };
        engine.insert_task(&future).unwrap();
        assert!(engine.claim_next("worker-1", &[]).unwrap().is_none());
    }

    #[test]
    fn complete_task_requires_running_state() {
        let engine = StorageEngine::open_in_memory().expect("open");
        let id = engine.insert_task(&sample_task()).unwrap();
        assert!(engine.complete_task(id).is_err());
    }

    #[test]
    fn fail_task_retries_then_terminal_fails() {
        let mut engine = StorageEngine::open_in_memory().expect("open");
        let nt = NewTask { max_retries: 1, ..sample_task() };
        let id = engine.insert_task(&nt).unwrap();
        engine.claim_next("w1", &[]).unwrap();

        let status = engine.fail_task(id, "boom").unwrap();
        assert_eq!(status, TaskStatus::Pending);

        engine.claim_next("w1", &[]).unwrap();
        let status = engine.fail_task(id, "boom again").unwrap();
        assert_eq!(status, TaskStatus::Failed);
    }

    #[test]
    fn release_task_restores_pending_without_incrementing_retries() {
        let mut engine = StorageEngine::open_in_memory().expect("open");
        let id = engine.insert_task(&sample_task()).unwrap();
        engine.claim_next("w1", &[]).unwrap();

        engine.release_task(id, "injection failed").unwrap();
        let task = engine.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retries, 0);
    }

    #[test]
    fn cancel_task_rejects_terminal_state() {
        let mut engine = StorageEngine::open_in_memory().expect("open");
        let id = engine.insert_task(&sample_task()).unwrap();
        engine.cancel_task(id).expect("cancel pending");
        assert!(engine.cancel_task(id).is_err());
    }

    #[test]
    fn cancel_task_cascades_to_descendants() {
        let mut engine = StorageEngine::open_in_memory().expect("open");
        let parent_id = engine.insert_task(&sample_task()).unwrap();
        let child = NewTask { parent_id: Some(parent_id), ..sample_task() };
        let child_id = engine.insert_task(&child).unwrap();
        let grandchild = NewTask { parent_id: Some(child_id), ..sample_task() };
        let grandchild_id = engine.insert_task(&grandchild).unwrap();

        engine.cancel_task(parent_id).expect("cancel");

        assert_eq!(engine.get_task(parent_id).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(engine.get_task(child_id).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(engine.get_task(grandchild_id).unwrap().status, TaskStatus::Cancelled);
    }

    #[test]
    fn retry_failed_resets_retries_when_requested() {
        let mut engine = StorageEngine::open_in_memory().expect("open");
        let nt = NewTask { max_retries: 1, ..sample_task() };
        let id = engine.insert_task(&nt).unwrap();
        engine.claim_next("w1", &[]).unwrap();
        engine.fail_task(id, "boom").unwrap();
        engine.claim_next("w1", &[]).unwrap();
        engine.fail_task(id, "boom again").unwrap();
        assert_eq!(engine.get_task(id).unwrap().status, TaskStatus::Failed);

        let retried = engine.retry_failed(Some(&[id]), true).unwrap();
        assert_eq!(retried, vec![id]);
        let task = engine.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retries, 0);
    }

    #[test]
    fn retry_failed_without_ids_retries_all_terminal_failures() {
        let mut engine = StorageEngine::open_in_memory().expect("open");
        let id = engine.insert_task(&sample_task()).unwrap();
        engine.cancel_task(id).unwrap();

        let retried = engine.retry_failed(None, false).unwrap();
        assert_eq!(retried, vec![id]);
        assert_eq!(engine.get_task(id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn archive_terminal_moves_old_completed_tasks() {
        let mut engine = StorageEngine::open_in_memory().expect("open");
        let id = engine.insert_task(&sample_task()).unwrap();
        engine.claim_next("w1", &[]).unwrap();
        engine.complete_task(id).unwrap();

        let cutoff = Utc::now() + chrono::Duration::hours(1);
        let archived = engine.archive_terminal(cutoff).unwrap();
        assert_eq!(archived, 1);
        assert!(engine.get_task(id).is_err());
    }

    #[test]
    fn maybe_complete_waits_for_non_terminal_descendants() {
        let mut engine = StorageEngine::open_in_memory().expect("open");
        let parent_id = engine.insert_task(&sample_task()).unwrap();
        let child = NewTask { parent_id: Some(parent_id), ..sample_task() };
        let child_id = engine.insert_task(&child).unwrap();
        engine.claim_next("w1", &[]).unwrap();
        engine.claim_next("w1", &[]).unwrap();

        assert!(!engine.maybe_complete(parent_id).unwrap());

        engine.complete_task(child_id).unwrap();
        assert!(engine.maybe_complete(parent_id).unwrap());
        assert_eq!(engine.get_task(parent_id).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn reap_timed_out_transitions_expired_leases() {
        let mut engine = StorageEngine::open_in_memory().expect("open");
        let nt = NewTask { timeout_seconds: -1, ..sample_task() };
        let id = engine.insert_task(&nt).unwrap();
        engine.claim_next("w1", &[]).unwrap();

        let reaped = engine.reap_timed_out().unwrap();
        assert_eq!(reaped, vec![id]);
        assert_eq!(engine.get_task(id).unwrap().status, TaskStatus::Timeout);
    }

    #[test]
    fn create_and_get_template_round_trips() {
        let engine = StorageEngine::open_in_memory().expect("open");
        let template = NewTemplate {
            name: "deploy".to_string(),
            task_type: "deploy".to_string(),
            payload_skeleton: serde_json::json!({"target": "${target}"}),
            default_priority: 5,
            default_max_retries: 3,
            default_timeout_seconds: 300,
            created_by: Some("operator".to_string()),
        };
        let id = engine.create_template(&template).expect("create");
        let loaded = engine.get_template(id).expect("get");
        assert_eq!(loaded.name, "deploy");
        assert_eq!(loaded.usage_count, 0);
        assert!(loaded.is_active);
    }

    #[test]
    fn update_priority_clamps_out_of_range() {
        let engine = StorageEngine::open_in_memory().expect("open");
        let id = engine.insert_task(&sample_task()).unwrap();
        engine.update_priority(id, 99).unwrap();
        assert_eq!(engine.get_task(id).unwrap().priority, 10);
    }

    #[test]
    fn child_task_derives_hierarchy() {
        let engine = StorageEngine::open_in_memory().expect("open");
        let parent_id = engine.insert_task(&sample_task()).unwrap();
        let child = NewTask { parent_id: Some(parent_id), ..sample_task() };
        let child_id = engine.insert_task(&child).unwrap();

        let child_task = engine.get_task(child_id).unwrap();
        assert_eq!(child_task.hierarchy_level, 1);
        assert!(child_task.hierarchy_path.contains(&parent_id.to_string()));

        let parent_task = engine.get_task(parent_id).unwrap();
        assert_eq!(parent_task.child_count, 1);
    }
}
