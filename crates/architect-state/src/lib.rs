//! Daemon lifecycle and status persistence for the architect control plane.
//!
//! The session dispatcher (C2) and prompt auto-responder (C3) both run as
//! long-lived daemons addressed by PID file and a JSON status file, in the
//! style of the original confirmation worker: `--daemon` double-forks and
//! detaches, `--stop` sends `SIGTERM` to the recorded PID, `--status` reads
//! the status file back. See `SPEC_FULL.md` §4.9 / §6 for the exit code
//! contract.
//!
//! # Example
//!
//! ```
//! use architect_state::{DaemonStatus, StatusStore};
//! use std::path::Path;
//!
//! let store = StatusStore::new(Path::new("/tmp/architect-example"));
//! let status = DaemonStatus::new("dispatcher", std::process::id());
//! store.save(&status).expect("save");
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

/// Default PID file name.
pub const PID_FILE: &str = "daemon.pid";
/// Default status file name.
pub const STATUS_FILE: &str = "daemon_status.json";

/// CLI exit codes for daemon subcommands, per `SPEC_FULL.md` §6.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonExitCode {
    Success = 0,
    AlreadyRunning = 1,
    NotRunning = 2,
    Error = 3,
}

impl DaemonExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

pub fn pid_path(dir: &Path) -> PathBuf {
    dir.join(PID_FILE)
}

pub fn status_path(dir: &Path) -> PathBuf {
    dir.join(STATUS_FILE)
}

/// Current lifecycle phase of a daemon, surfaced via `--status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonPhase {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Snapshot of a running daemon's status, persisted as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub component: String,
    pub pid: u32,
    pub hostname: String,
    pub phase: DaemonPhase,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl DaemonStatus {
    pub fn new(component: &str, pid: u32) -> Self {
        let now = Utc::now();
        Self {
            component: component.to_string(),
            pid,
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            phase: DaemonPhase::Starting,
            started_at: now,
            last_heartbeat: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_heartbeat = Utc::now();
    }
}

/// Persistent store for a daemon's PID file and status file, using the
/// write-to-temp-then-rename pattern for atomic updates.
#[derive(Debug, Clone)]
pub struct StatusStore {
    dir: PathBuf,
}

impl StatusStore {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    /// Write the PID file, atomically.
    pub fn write_pid(&self, pid: u32) -> Result<()> {
        self.ensure_dir()?;
        let path = pid_path(&self.dir);
        let tmp = path.with_extension("pid.tmp");
        fs::write(&tmp, pid.to_string())
            .with_context(|| format!("failed to write pid file {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename pid file to {}", path.display()))?;
        Ok(())
    }

    /// Read the PID file, if present.
    pub fn read_pid(&self) -> Result<Option<u32>> {
        let path = pid_path(&self.dir);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read pid file {}", path.display()))?;
        let pid = content
            .trim()
            .parse()
            .with_context(|| format!("invalid pid in {}", path.display()))?;
        Ok(Some(pid))
    }

    pub fn remove_pid(&self) -> Result<()> {
        let path = pid_path(&self.dir);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove pid file {}", path.display()))?;
        }
        Ok(())
    }

    /// Save the daemon status, atomically.
    pub fn save(&self, status: &DaemonStatus) -> Result<()> {
        self.ensure_dir()?;
        let path = status_path(&self.dir);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(status).context("failed to serialize status")?;
        fs::write(&tmp, json)
            .with_context(|| format!("failed to write status file {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename status file to {}", path.display()))?;
        Ok(())
    }

    /// Load the daemon status, if present.
    pub fn load(&self) -> Result<Option<DaemonStatus>> {
        let path = status_path(&self.dir);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read status file {}", path.display()))?;
        let status: DaemonStatus = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse status JSON from {}", path.display()))?;
        Ok(Some(status))
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create state dir {}", self.dir.display()))
    }
}

/// Whether a process with the given PID is alive, using a zero-signal probe.
pub fn process_is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Send `SIGTERM` to a running daemon's recorded PID.
pub fn terminate(pid: u32) -> Result<()> {
    signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .with_context(|| format!("failed to send SIGTERM to pid {pid}"))?;
    Ok(())
}

/// A shared shutdown flag flipped by the process's signal handlers and
/// polled by the daemon's main loop. Installed once per process; safe to
/// clone and hand to worker tasks.
#[derive(Clone)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_and_read_pid() {
        let td = tempdir().expect("tempdir");
        let store = StatusStore::new(td.path());

        store.write_pid(12345).expect("write");
        assert_eq!(store.read_pid().expect("read"), Some(12345));
    }

    #[test]
    fn read_pid_missing_is_none() {
        let td = tempdir().expect("tempdir");
        let store = StatusStore::new(td.path());
        assert_eq!(store.read_pid().expect("read"), None);
    }

    #[test]
    fn remove_pid_is_idempotent() {
        let td = tempdir().expect("tempdir");
        let store = StatusStore::new(td.path());
        store.write_pid(1).expect("write");
        store.remove_pid().expect("remove once");
        store.remove_pid().expect("remove twice is a no-op");
        assert_eq!(store.read_pid().expect("read"), None);
    }

    #[test]
    fn save_and_load_status() {
        let td = tempdir().expect("tempdir");
        let store = StatusStore::new(td.path());

        let mut status = DaemonStatus::new("dispatcher", 999);
        status.phase = DaemonPhase::Running;
        store.save(&status).expect("save");

        let loaded = store.load().expect("load").expect("present");
        assert_eq!(loaded.component, "dispatcher");
        assert_eq!(loaded.pid, 999);
        assert_eq!(loaded.phase, DaemonPhase::Running);
    }

    #[test]
    fn load_missing_status_is_none() {
        let td = tempdir().expect("tempdir");
        let store = StatusStore::new(td.path());
        assert!(store.load().expect("load").is_none());
    }

    #[test]
    fn current_process_is_alive() {
        assert!(process_is_alive(std::process::id()));
    }

    #[test]
    fn unlikely_pid_is_not_alive() {
        // PID 2^22 is far beyond any realistic pid_max and almost certainly unused.
        assert!(!process_is_alive(4_194_304));
    }

    #[test]
    fn shutdown_flag_starts_clear_and_latches() {
        let flag = ShutdownFlag::new();
        assert!(!flag.requested());
        flag.request();
        assert!(flag.requested());
    }

    #[test]
    fn shutdown_flag_clone_shares_state() {
        let flag = ShutdownFlag::new();
        let clone = flag.clone();
        clone.request();
        assert!(flag.requested());
    }

    #[test]
    fn exit_codes_match_spec_contract() {
        assert_eq!(DaemonExitCode::Success.code(), 0);
        assert_eq!(DaemonExitCode::AlreadyRunning.code(), 1);
        assert_eq!(DaemonExitCode::NotRunning.code(), 2);
        assert_eq!(DaemonExitCode::Error.code(), 3);
    }

    #[test]
    fn path_helpers() {
        let base = PathBuf::from(".architect");
        assert_eq!(pid_path(&base), PathBuf::from(".architect/daemon.pid"));
        assert_eq!(status_path(&base), PathBuf::from(".architect/daemon_status.json"));
    }
}
