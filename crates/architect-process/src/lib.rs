//! Process execution and terminal-multiplexer side channel.
//!
//! This crate provides utilities for running external processes with proper
//! error handling, timeouts, and output capture, plus a thin wrapper around
//! `tmux` used by the prompt auto-responder (C3) and session dispatcher (C2)
//! to address interactive assistant sessions — see `SPEC_FULL.md` §4.4/§4.5.
//! The core never spawns or owns the underlying assistant process; it only
//! talks to an existing tmux pane by session name.
//!
//! # Example
//!
//! ```ignore
//! use architect_process::{run_command, CommandResult};
//!
//! let result = run_command("true", &[]).expect("run");
//! assert!(result.success);
//! ```

use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::time::Duration;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Result of a command execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    /// Exit code (if available)
    pub exit_code: Option<i32>,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Duration of execution
    pub duration_ms: u64,
}

impl CommandResult {
    /// Check if the command succeeded
    pub fn ok(&self) -> Result<&Self> {
        if self.success {
            Ok(self)
        } else {
            Err(anyhow::anyhow!(
                "command failed with exit code {:?}: {}",
                self.exit_code,
                self.stderr
            ))
        }
    }

    /// Create a result from a process output
    pub fn from_output(output: &Output, duration: Duration) -> Self {
        Self {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Result of a command execution with timeout bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code (or -1 when not available)
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Whether execution exceeded timeout.
    pub timed_out: bool,
    /// Total wall-clock duration.
    pub duration: Duration,
}

/// Run a command and capture its output
pub fn run_command(program: &str, args: &[&str]) -> Result<CommandResult> {
    let start = std::time::Instant::now();

    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("failed to run command: {} {:?}", program, args))?;

    Ok(CommandResult::from_output(&output, start.elapsed()))
}

/// Run a command in a specific directory
pub fn run_command_in_dir(
    program: &str,
    args: &[&str],
    dir: &std::path::Path,
) -> Result<CommandResult> {
    let start = std::time::Instant::now();

    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| {
            format!(
                "failed to run command: {} {:?} in {}",
                program,
                args,
                dir.display()
            )
        })?;

    Ok(CommandResult::from_output(&output, start.elapsed()))
}

/// Run a command with optional timeout and captured output.
pub fn run_command_with_timeout(
    program: &str,
    args: &[&str],
    working_dir: &std::path::Path,
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    let start = Instant::now();

    let Some(timeout_dur) = timeout else {
        let output = run_command_in_dir(program, args, working_dir)?;
        return Ok(CommandOutput {
            exit_code: output.exit_code.unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
            timed_out: false,
            duration: Duration::from_millis(output.duration_ms),
        });
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn command: {}", program))?;

    let deadline = Instant::now() + timeout_dur;
    loop {
        match child
            .try_wait()
            .with_context(|| format!("failed to poll command: {}", program))?
        {
            Some(status) => {
                return Ok(CommandOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: read_pipe(child.stdout.take()),
                    stderr: read_pipe(child.stderr.take()),
                    timed_out: false,
                    duration: start.elapsed(),
                });
            }
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();

                    let mut stderr = read_pipe(child.stderr.take());
                    stderr.push_str(&format!(
                        "\n{} timed out after {}",
                        program,
                        humantime::format_duration(timeout_dur)
                    ));

                    return Ok(CommandOutput {
                        exit_code: -1,
                        stdout: read_pipe(child.stdout.take()),
                        stderr,
                        timed_out: true,
                        duration: start.elapsed(),
                    });
                }

                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn read_pipe<R: Read>(stream: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).to_string()
}

/// Run a command with environment variables
pub fn run_command_with_env(
    program: &str,
    args: &[&str],
    env: &[(String, String)],
) -> Result<CommandResult> {
    let start = std::time::Instant::now();

    let mut cmd = Command::new(program);
    cmd.args(args);

    for (key, value) in env {
        cmd.env(key, value);
    }

    let output = cmd
        .output()
        .with_context(|| format!("failed to run command: {} {:?}", program, args))?;

    Ok(CommandResult::from_output(&output, start.elapsed()))
}

/// Run a command and stream output to stdout/stderr
pub fn run_command_streaming(program: &str, args: &[&str]) -> Result<CommandResult> {
    let start = std::time::Instant::now();

    let output = Command::new(program)
        .args(args)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .output()
        .with_context(|| format!("failed to run command: {} {:?}", program, args))?;

    Ok(CommandResult::from_output(&output, start.elapsed()))
}

/// Run a command and return success/failure without capturing output
pub fn run_command_simple(program: &str, args: &[&str]) -> Result<bool> {
    let status = Command::new(program)
        .args(args)
        .status()
        .with_context(|| format!("failed to run command: {} {:?}", program, args))?;

    Ok(status.success())
}

/// Check if a command exists in PATH
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Get the full path to a command
pub fn which(program: &str) -> Option<std::path::PathBuf> {
    which::which(program).ok()
}

/// A thin wrapper around the `tmux` CLI for addressing interactive
/// assistant sessions by name. Every method shells out to `tmux` rather
/// than linking a tmux protocol library, matching how the original
/// confirmation worker drove tmux via `subprocess`.
pub mod tmux {
    use super::{Result, run_command};
    use anyhow::Context;

    /// List active tmux session names.
    pub fn list_sessions() -> Result<Vec<String>> {
        let result = run_command("tmux", &["list-sessions", "-F", "#{session_name}"])?;
        if !result.success {
            // No server running yields a non-zero exit and "no server running" on stderr;
            // treat that as an empty session list rather than an error.
            if result.stderr.contains("no server running") {
                return Ok(Vec::new());
            }
            return Err(anyhow::anyhow!("tmux list-sessions failed: {}", result.stderr));
        }
        Ok(result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Capture the visible contents of a session's active pane.
    pub fn capture_pane(session: &str) -> Result<String> {
        let result = run_command("tmux", &["capture-pane", "-t", session, "-p"])
            .with_context(|| format!("failed to capture pane for session {session}"))?;
        if !result.success {
            return Err(anyhow::anyhow!(
                "tmux capture-pane failed for {session}: {}",
                result.stderr
            ));
        }
        Ok(result.stdout)
    }

    /// Send literal keys to a session, followed by `Enter`.
    pub fn send_keys(session: &str, keys: &str) -> Result<()> {
        let result = run_command("tmux", &["send-keys", "-t", session, keys, "Enter"])
            .with_context(|| format!("failed to send keys to session {session}"))?;
        if !result.success {
            return Err(anyhow::anyhow!(
                "tmux send-keys failed for {session}: {}",
                result.stderr
            ));
        }
        Ok(())
    }

    /// Send a raw key name (e.g. `"y"`, `"Escape"`) without a trailing Enter.
    pub fn send_raw_key(session: &str, key: &str) -> Result<()> {
        let result = run_command("tmux", &["send-keys", "-t", session, key])
            .with_context(|| format!("failed to send raw key to session {session}"))?;
        if !result.success {
            return Err(anyhow::anyhow!(
                "tmux send-keys failed for {session}: {}",
                result.stderr
            ));
        }
        Ok(())
    }

    /// Whether a named session currently exists.
    pub fn has_session(session: &str) -> Result<bool> {
        let result = run_command("tmux", &["has-session", "-t", session])?;
        Ok(result.success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_command_version() {
        let result = run_command("echo", &["hello"]).expect("run");
        assert!(result.success);
        assert!(result.stdout.contains("hello"));
    }

    #[test]
    fn run_command_failure() {
        let result = run_command("false", &[]).expect("run");
        assert!(!result.success);
    }

    #[test]
    fn command_result_ok() {
        let result = CommandResult {
            success: true,
            exit_code: Some(0),
            stdout: "output".to_string(),
            stderr: "".to_string(),
            duration_ms: 100,
        };

        assert!(result.ok().is_ok());
    }

    #[test]
    fn command_result_err() {
        let result = CommandResult {
            success: false,
            exit_code: Some(1),
            stdout: "".to_string(),
            stderr: "error".to_string(),
            duration_ms: 100,
        };

        assert!(result.ok().is_err());
    }

    #[test]
    fn run_command_simple_true() {
        let success = run_command_simple("true", &[]).expect("run");
        assert!(success);
    }

    #[test]
    fn command_exists_echo() {
        assert!(command_exists("echo"));
    }

    #[test]
    fn command_exists_nonexistent() {
        assert!(!command_exists("this-command-does-not-exist-xyz123"));
    }

    #[test]
    fn which_echo() {
        let path = which("echo");
        assert!(path.is_some());
    }

    #[test]
    fn tmux_list_sessions_without_server_is_empty_or_ok() {
        // tmux may not be installed in the test environment; only assert
        // that when it is, a missing server yields an empty list rather
        // than an error.
        if command_exists("tmux") {
            let result = tmux::list_sessions();
            assert!(result.is_ok());
        }
    }

    #[test]
    fn tmux_has_session_false_for_unknown_name() {
        if command_exists("tmux") {
            let exists = tmux::has_session("architect-test-nonexistent-session").unwrap();
            assert!(!exists);
        }
    }

    #[test]
    fn command_result_serialization() {
        let result = CommandResult {
            success: true,
            exit_code: Some(0),
            stdout: "output".to_string(),
            stderr: "".to_string(),
            duration_ms: 150,
        };

        let json = serde_json::to_string(&result).expect("serialize");
        assert!(json.contains("\"success\":true"));
        assert!(json.contains("\"stdout\":\"output\""));
    }
}
