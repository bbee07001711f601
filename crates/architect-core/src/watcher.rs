//! Per-user task watch subscriptions and notification fan-out, per
//! `SPEC_FULL.md` §4.7, grounded on `services/task_watchers.py`'s
//! `TaskWatcherService`.

use std::collections::HashMap;

use architect_types::{CoreError, TaskWatcher, WatchType};
use chrono::{NaiveTime, Utc};

/// Task types eligible for watching, per the original service.
pub const WATCHABLE_TASK_TYPES: &[&str] =
    &["task_queue", "feature", "bug", "milestone", "devops_task", "project"];

/// A notification emitted to one watcher for one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub user_id: String,
    pub task_id: i64,
    pub event_kind: String,
    pub notify_email: bool,
    pub notify_dashboard: bool,
}

/// Per-user auto-watch and quiet-hours preferences.
#[derive(Debug, Clone)]
pub struct WatchPreferences {
    pub auto_watch_on_create: bool,
    pub auto_watch_on_assign: bool,
    pub auto_watch_on_comment: bool,
    pub quiet_hours_start: Option<NaiveTime>,
    pub quiet_hours_end: Option<NaiveTime>,
}

impl Default for WatchPreferences {
    fn default() -> Self {
        Self {
            auto_watch_on_create: false,
            auto_watch_on_assign: true,
            auto_watch_on_comment: true,
            quiet_hours_start: None,
            quiet_hours_end: None,
        }
    }
}

impl WatchPreferences {
    /// Whether `now`'s local time falls inside the configured quiet window.
    /// A window that wraps midnight (`start > end`) is handled.
    pub fn in_quiet_hours(&self, now: NaiveTime) -> bool {
        match (self.quiet_hours_start, self.quiet_hours_end) {
            (Some(start), Some(end)) if start <= end => now >= start && now < end,
            (Some(start), Some(end)) => now >= start || now < end,
            _ => false,
        }
    }
}

/// In-memory notify-fan-out cache. Persistent subscriptions live in the
/// `task_watchers` table via [`crate::storage::StorageEngine`]'s
/// `upsert_watcher`/`delete_watcher`/`watchers_for_task`; this registry is
/// a process-local projection of that table used to compute notification
/// fan-out without a database round trip per event.
#[derive(Default)]
pub struct WatcherRegistry {
    watchers: Vec<TaskWatcher>,
    preferences: HashMap<String, WatchPreferences>,
    next_id: i64,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self { next_id: 1, ..Default::default() }
    }

    pub fn set_preferences(&mut self, user_id: &str, prefs: WatchPreferences) {
        self.preferences.insert(user_id.to_string(), prefs);
    }

    /// Subscribe `user_id` to `task_id`. Duplicate watches update the
    /// existing row's settings rather than inserting a second one, per the
    /// original service's `IntegrityError` fallback.
    pub fn watch_task(
        &mut self,
        task_id: i64,
        task_type: &str,
        user_id: &str,
        watch_type: WatchType,
        notify_email: bool,
        notify_dashboard: bool,
    ) -> Result<TaskWatcher, CoreError> {
        if !WATCHABLE_TASK_TYPES.contains(&task_type) {
            return Err(CoreError::Validation(format!("invalid task type: {task_type}")));
        }

        if let Some(existing) = self
            .watchers
            .iter_mut()
            .find(|w| w.task_id == task_id && w.user_id == user_id)
        {
            existing.watch_type = watch_type;
            existing.notify_email = notify_email;
            existing.notify_dashboard = notify_dashboard;
            return Ok(existing.clone());
        }

        let watcher = TaskWatcher {
            id: self.next_id,
            task_id,
            task_type: task_type.to_string(),
            user_id: user_id.to_string(),
            watch_type,
            notify_email,
            notify_dashboard,
        };
        self.next_id += 1;
        self.watchers.push(watcher.clone());
        Ok(watcher)
    }

    pub fn unwatch_task(&mut self, task_id: i64, user_id: &str) {
        self.watchers.retain(|w| !(w.task_id == task_id && w.user_id == user_id));
    }

    pub fn watchers_for(&self, task_id: i64) -> Vec<&TaskWatcher> {
        self.watchers.iter().filter(|w| w.task_id == task_id).collect()
    }

    /// Build the notification fan-out for an event, excluding the
    /// triggering actor by default and honoring each recipient's watch
    /// type filter and quiet hours.
    pub fn notify(
        &self,
        task_id: i64,
        event_kind: &str,
        actor: Option<&str>,
        exclude_actor: bool,
        now: NaiveTime,
    ) -> Vec<Notification> {
        self.watchers_for(task_id)
            .into_iter()
            .filter(|w| !(exclude_actor && actor.is_some_and(|a| a == w.user_id)))
            .filter(|w| w.watch_type.admits(event_kind))
            .map(|w| {
                let quiet = self
                    .preferences
                    .get(&w.user_id)
                    .map(|p| p.in_quiet_hours(now))
                    .unwrap_or(false);
                Notification {
                    user_id: w.user_id.clone(),
                    task_id,
                    event_kind: event_kind.to_string(),
                    notify_email: w.notify_email && !quiet,
                    notify_dashboard: w.notify_dashboard,
                }
            })
            .collect()
    }

    /// Auto-subscribe `user_id` to `task_id` if their preferences call for
    /// it on `trigger` ("create" | "assign" | "comment").
    pub fn maybe_auto_watch(&mut self, task_id: i64, task_type: &str, user_id: &str, trigger: &str) {
        let should = match self.preferences.get(user_id) {
            Some(prefs) => match trigger {
                "create" => prefs.auto_watch_on_create,
                "assign" => prefs.auto_watch_on_assign,
                "comment" => prefs.auto_watch_on_comment,
                _ => false,
            },
            None => false,
        };
        if should {
            let _ = self.watch_task(task_id, task_type, user_id, WatchType::All, false, true);
        }
    }
}

#[allow(dead_code)]
fn now_utc_time() -> NaiveTime {
    Utc::now().time()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_task_rejects_invalid_task_type() {
        let mut reg = WatcherRegistry::new();
        assert!(reg.watch_task(1, "not-a-type", "u1", WatchType::All, false, true).is_err());
    }

    #[test]
    fn watch_task_is_idempotent_per_user() {
        let mut reg = WatcherRegistry::new();
        reg.watch_task(1, "feature", "u1", WatchType::All, false, true).unwrap();
        reg.watch_task(1, "feature", "u1", WatchType::Status, true, false).unwrap();
        assert_eq!(reg.watchers_for(1).len(), 1);
        assert_eq!(reg.watchers_for(1)[0].watch_type, WatchType::Status);
    }

    #[test]
    fn notify_excludes_actor_by_default() {
        let mut reg = WatcherRegistry::new();
        reg.watch_task(1, "feature", "actor", WatchType::All, false, true).unwrap();
        reg.watch_task(1, "feature", "other", WatchType::All, false, true).unwrap();
        let notifications = reg.notify(1, "status_change", Some("actor"), true, NaiveTime::from_hms_opt(12, 0, 0).unwrap());
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].user_id, "other");
    }

    #[test]
    fn notify_respects_watch_type_filter() {
        let mut reg = WatcherRegistry::new();
        reg.watch_task(1, "feature", "u1", WatchType::Comments, false, true).unwrap();
        let notifications = reg.notify(1, "status_change", None, true, NaiveTime::from_hms_opt(12, 0, 0).unwrap());
        assert!(notifications.is_empty());
    }

    #[test]
    fn notify_suppresses_email_during_quiet_hours() {
        let mut reg = WatcherRegistry::new();
        reg.watch_task(1, "feature", "u1", WatchType::All, true, true).unwrap();
        reg.set_preferences(
            "u1",
            WatchPreferences {
                quiet_hours_start: Some(NaiveTime::from_hms_opt(22, 0, 0).unwrap()),
                quiet_hours_end: Some(NaiveTime::from_hms_opt(7, 0, 0).unwrap()),
                ..Default::default()
            },
        );
        let notifications = reg.notify(1, "status_change", None, true, NaiveTime::from_hms_opt(23, 0, 0).unwrap());
        assert!(!notifications[0].notify_email);
        assert!(notifications[0].notify_dashboard);
    }

    #[test]
    fn in_quiet_hours_handles_midnight_wrap() {
        let prefs = WatchPreferences {
            quiet_hours_start: Some(NaiveTime::from_hms_opt(22, 0, 0).unwrap()),
            quiet_hours_end: Some(NaiveTime::from_hms_opt(7, 0, 0).unwrap()),
            ..Default::default()
        };
        assert!(prefs.in_quiet_hours(NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(prefs.in_quiet_hours(NaiveTime::from_hms_opt(3, 0, 0).unwrap()));
        assert!(!prefs.in_quiet_hours(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn maybe_auto_watch_respects_preferences() {
        let mut reg = WatcherRegistry::new();
        reg.set_preferences("u1", WatchPreferences { auto_watch_on_create: true, ..Default::default() });
        reg.maybe_auto_watch(5, "bug", "u1", "create");
        assert_eq!(reg.watchers_for(5).len(), 1);

        reg.maybe_auto_watch(6, "bug", "u1", "comment");
        assert_eq!(reg.watchers_for(6).len(), 1); // default auto_watch_on_comment is true
    }

    #[test]
    fn unwatch_task_removes_subscription() {
        let mut reg = WatcherRegistry::new();
        reg.watch_task(1, "feature", "u1", WatchType::All, false, true).unwrap();
        reg.unwatch_task(1, "u1");
        assert!(reg.watchers_for(1).is_empty());
    }
}
