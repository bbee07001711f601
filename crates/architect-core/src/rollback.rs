//! Point-in-time rollback snapshots, per `SPEC_FULL.md` §4.8.
//!
//! Captures `{git commit, branch, DB file copy, timestamp, description}`
//! into a snapshot directory, persists metadata JSON, and maintains an
//! append-only history log. Git state is captured by shelling out through
//! [`architect_process::run_command`], the same subprocess idiom the rest
//! of this workspace uses for external tools.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use architect_process::run_command_in_dir;
use architect_types::RollbackSnapshot;
use chrono::Utc;
use serde::{Deserialize, Serialize};

const METADATA_FILE: &str = "metadata.json";
const HISTORY_FILE: &str = "history.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotRecord {
    id: String,
    created_at: chrono::DateTime<Utc>,
    description: String,
    git_commit: Option<String>,
    git_branch: Option<String>,
    db_backup_path: PathBuf,
}

impl From<SnapshotRecord> for RollbackSnapshot {
    fn from(r: SnapshotRecord) -> Self {
        RollbackSnapshot {
            id: r.id,
            created_at: r.created_at,
            description: r.description,
            git_commit: r.git_commit,
            git_branch: r.git_branch,
            db_backup_path: r.db_backup_path,
        }
    }
}

/// A single append-only history entry: either a snapshot creation or a
/// restore attempt (recorded even when it fails).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum HistoryEntry {
    Created { snapshot_id: String, at: chrono::DateTime<Utc> },
    Restored { snapshot_id: String, at: chrono::DateTime<Utc>, success: bool, reason: Option<String> },
}

/// Manages a directory of snapshots for one database file.
pub struct RollbackManager {
    snapshot_dir: PathBuf,
    db_path: PathBuf,
}

impl RollbackManager {
    pub fn new(snapshot_dir: &Path, db_path: &Path) -> Self {
        Self { snapshot_dir: snapshot_dir.to_path_buf(), db_path: db_path.to_path_buf() }
    }

    fn metadata_path(&self) -> PathBuf {
        self.snapshot_dir.join(METADATA_FILE)
    }

    fn history_path(&self) -> PathBuf {
        self.snapshot_dir.join(HISTORY_FILE)
    }

    /// Capture a snapshot: git commit/branch (best-effort, `None` outside a
    /// repo or if `git` is unavailable) plus a DB file copy.
    pub fn create_snapshot(&self, description: &str, repo_dir: &Path) -> Result<RollbackSnapshot> {
        fs::create_dir_all(&self.snapshot_dir)
            .with_context(|| format!("failed to create snapshot dir {}", self.snapshot_dir.display()))?;

        let id = format!("snap-{}", Utc::now().format("%Y%m%dT%H%M%S%.f"));
        let backup_path = self.snapshot_dir.join(format!("{id}.db"));
        fs::copy(&self.db_path, &backup_path)
            .with_context(|| format!("failed to copy db to {}", backup_path.display()))?;

        let git_commit = git_rev_parse(repo_dir);
        let git_branch = git_current_branch(repo_dir);

        let record = SnapshotRecord {
            id: id.clone(),
            created_at: Utc::now(),
            description: description.to_string(),
            git_commit,
            git_branch,
            db_backup_path: backup_path,
        };

        self.append_metadata(&record)?;
        self.append_history(HistoryEntry::Created { snapshot_id: id, at: Utc::now() })?;

        Ok(record.into())
    }

    pub fn list_snapshots(&self) -> Result<Vec<RollbackSnapshot>> {
        Ok(self.read_metadata()?.into_iter().map(Into::into).collect())
    }

    /// Restore the database from `snapshot_id`'s backup file. Idempotent
    /// against a missing target: returns an error rather than partially
    /// applying, per §4.8.
    pub fn restore(&self, snapshot_id: &str) -> Result<()> {
        let records = self.read_metadata()?;
        let Some(record) = records.into_iter().find(|r| r.id == snapshot_id) else {
            self.append_history(HistoryEntry::Restored {
                snapshot_id: snapshot_id.to_string(),
                at: Utc::now(),
                success: false,
                reason: Some("snapshot not found".to_string()),
            })?;
            bail!("snapshot {snapshot_id} not found");
        };

        if !record.db_backup_path.exists() {
            self.append_history(HistoryEntry::Restored {
                snapshot_id: snapshot_id.to_string(),
                at: Utc::now(),
                success: false,
                reason: Some("backup file missing".to_string()),
            })?;
            bail!("backup file missing for snapshot {snapshot_id}");
        }

        fs::copy(&record.db_backup_path, &self.db_path)
            .with_context(|| format!("failed to restore db from {}", record.db_backup_path.display()))?;

        self.append_history(HistoryEntry::Restored {
            snapshot_id: snapshot_id.to_string(),
            at: Utc::now(),
            success: true,
            reason: None,
        })?;
        Ok(())
    }

    /// Keep only the `keep_count` most recent snapshots, deleting older
    /// backup files and metadata entries.
    pub fn prune(&self, keep_count: usize) -> Result<Vec<String>> {
        let mut records = self.read_metadata()?;
        records.sort_by_key(|r| r.created_at);
        let mut pruned = Vec::new();
        while records.len() > keep_count {
            let record = records.remove(0);
            let _ = fs::remove_file(&record.db_backup_path);
            pruned.push(record.id);
        }
        self.write_metadata(&records)?;
        Ok(pruned)
    }

    fn append_metadata(&self, record: &SnapshotRecord) -> Result<()> {
        let mut records = self.read_metadata().unwrap_or_default();
        records.push(record.clone());
        self.write_metadata(&records)
    }

    fn write_metadata(&self, records: &[SnapshotRecord]) -> Result<()> {
        let json = serde_json::to_string_pretty(records).context("failed to serialize snapshot metadata")?;
        let tmp = self.metadata_path().with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, self.metadata_path())
            .with_context(|| format!("failed to rename {}", self.metadata_path().display()))?;
        Ok(())
    }

    fn read_metadata(&self) -> Result<Vec<SnapshotRecord>> {
        let path = self.metadata_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn append_history(&self, entry: HistoryEntry) -> Result<()> {
        use std::io::Write;
        let mut line = serde_json::to_string(&entry).context("failed to serialize history entry")?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path())
            .with_context(|| format!("failed to open {}", self.history_path().display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append to {}", self.history_path().display()))
    }
}

fn git_rev_parse(repo_dir: &Path) -> Option<String> {
    let result = run_command_in_dir("git", &["rev-parse", "HEAD"], repo_dir).ok()?;
    if result.success {
        Some(result.stdout.trim().to_string())
    } else {
        None
    }
}

fn git_current_branch(repo_dir: &Path) -> Option<String> {
    let result = run_command_in_dir("git", &["rev-parse", "--abbrev-ref", "HEAD"], repo_dir).ok()?;
    if result.success {
        Some(result.stdout.trim().to_string())
    } else {
        None
    }
}

/// Consecutive-failure health monitor triggering an automatic restore to
/// the last known good snapshot, per §4.8.
pub struct HealthMonitor {
    threshold: u32,
    consecutive_failures: u32,
}

impl HealthMonitor {
    pub fn new(threshold: u32) -> Self {
        Self { threshold, consecutive_failures: 0 }
    }

    /// Record one health check result. Returns `true` once the failure
    /// threshold is crossed, signaling the caller to trigger a restore.
    pub fn record(&mut self, healthy: bool) -> bool {
        if healthy {
            self.consecutive_failures = 0;
            false
        } else {
            self.consecutive_failures += 1;
            self.consecutive_failures >= self.threshold
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, RollbackManager) {
        let td = tempdir().expect("tempdir");
        let db_path = td.path().join("architect.db");
        fs::write(&db_path, b"db-v1").expect("write db");
        let snapshot_dir = td.path().join("snapshots");
        let manager = RollbackManager::new(&snapshot_dir, &db_path);
        (td, manager)
    }

    #[test]
    fn create_snapshot_copies_db_and_records_metadata() {
        let (td, manager) = setup();
        let snapshot = manager.create_snapshot("before migration", td.path()).expect("create");
        assert!(snapshot.db_backup_path.exists());
        assert_eq!(manager.list_snapshots().unwrap().len(), 1);
    }

    #[test]
    fn restore_copies_backup_back_to_db_path() {
        let (td, manager) = setup();
        let snapshot = manager.create_snapshot("before migration", td.path()).expect("create");
        fs::write(manager.db_path.clone(), b"db-v2-corrupted").unwrap();
        manager.restore(&snapshot.id).expect("restore");
        let restored = fs::read(&manager.db_path).unwrap();
        assert_eq!(restored, b"db-v1");
    }

    #[test]
    fn restore_unknown_snapshot_is_idempotent_failure() {
        let (_td, manager) = setup();
        assert!(manager.restore("does-not-exist").is_err());
        assert!(manager.restore("does-not-exist").is_err());
    }

    #[test]
    fn restore_missing_backup_file_fails_without_partial_apply() {
        let (td, manager) = setup();
        let snapshot = manager.create_snapshot("before migration", td.path()).expect("create");
        fs::remove_file(&snapshot.db_backup_path).unwrap();
        assert!(manager.restore(&snapshot.id).is_err());
        let db_contents = fs::read(&manager.db_path).unwrap();
        assert_eq!(db_contents, b"db-v1");
    }

    #[test]
    fn prune_keeps_only_most_recent() {
        let (td, manager) = setup();
        manager.create_snapshot("one", td.path()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        manager.create_snapshot("two", td.path()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        manager.create_snapshot("three", td.path()).unwrap();

        let pruned = manager.prune(1).expect("prune");
        assert_eq!(pruned.len(), 2);
        assert_eq!(manager.list_snapshots().unwrap().len(), 1);
    }

    #[test]
    fn health_monitor_triggers_at_threshold() {
        let mut monitor = HealthMonitor::new(3);
        assert!(!monitor.record(false));
        assert!(!monitor.record(false));
        assert!(monitor.record(false));
    }

    #[test]
    fn health_monitor_resets_on_healthy_check() {
        let mut monitor = HealthMonitor::new(2);
        assert!(!monitor.record(false));
        assert!(!monitor.record(true));
        assert!(!monitor.record(false));
    }
}
