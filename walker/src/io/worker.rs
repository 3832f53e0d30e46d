//! Worker abstraction for LLM subprocess invocation.
//!
//! The [`Worker`] trait decouples the agent runner and planning lifecycle
//! from the actual LLM CLI. Tests use scripted workers that act on the walk
//! directory without spawning processes.

use std::path::PathBuf;
use std::process::Command;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::io::process::{run_capturing, run_streaming};
use crate::io::walk_meta::WorkerMode;

/// Environment variable naming the walk directory for the child.
pub const ENV_WALK_DIR: &str = "WALK_DIR";
/// Environment variable naming the issue slug for a worker role.
pub const ENV_WALK_ISSUE: &str = "WALK_ISSUE";
/// Set to `1` for the planner role.
pub const ENV_WALK_PLANNING: &str = "WALK_PLANNING";

/// The role a spawn is serving; decides which env vars the child sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerRole {
    Issue { slug: String },
    Planner,
}

/// Parameters for one worker invocation.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    /// Working directory for the child (the walk directory).
    pub workdir: PathBuf,
    /// Prompt text, delivered on stdin (never argv).
    pub prompt: String,
    pub role: WorkerRole,
    pub mode: WorkerMode,
    /// Stream-mode log destination.
    pub stream_log_path: PathBuf,
    /// Capture-mode turn budget, when the backend supports one.
    pub max_turns: Option<u32>,
}

/// Result of one worker invocation.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    /// `None` = killed by a signal (interrupted).
    pub exit_code: Option<i32>,
    pub interrupted: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Captured stdout (capture mode only).
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Abstraction over worker backends.
pub trait Worker {
    fn run(&self, request: &WorkerRequest) -> Result<WorkerOutcome>;
}

/// Worker that spawns the configured LLM CLI.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    argv: Vec<String>,
}

impl CommandWorker {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    fn command(&self, request: &WorkerRequest) -> Command {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]);
        if request.mode == WorkerMode::Capture
            && let Some(max_turns) = request.max_turns
        {
            cmd.arg("--max-turns").arg(max_turns.to_string());
        }
        cmd.current_dir(&request.workdir);
        cmd.env(ENV_WALK_DIR, &request.workdir);
        match &request.role {
            WorkerRole::Issue { slug } => {
                cmd.env(ENV_WALK_ISSUE, slug);
            }
            WorkerRole::Planner => {
                cmd.env(ENV_WALK_PLANNING, "1");
            }
        }
        cmd
    }
}

impl Worker for CommandWorker {
    #[instrument(skip_all, fields(mode = request.mode.as_str(), role = ?request.role))]
    fn run(&self, request: &WorkerRequest) -> Result<WorkerOutcome> {
        info!(command = %self.argv.join(" "), "starting worker");
        let cmd = self.command(request);
        let started_at = Utc::now();

        let outcome = match request.mode {
            WorkerMode::Stream => {
                run_streaming(cmd, request.prompt.as_bytes(), &request.stream_log_path)?
            }
            WorkerMode::Capture => run_capturing(cmd, request.prompt.as_bytes())?,
        };
        let finished_at = Utc::now();

        let exit_code = outcome.exit_code();
        if exit_code.is_none() {
            warn!("worker was killed by a signal");
        } else if exit_code != Some(0) {
            warn!(exit_code = ?exit_code, "worker exited non-zero");
        } else {
            debug!("worker completed");
        }

        Ok(WorkerOutcome {
            exit_code,
            interrupted: exit_code.is_none(),
            started_at,
            finished_at,
            stdout: match request.mode {
                WorkerMode::Capture => {
                    Some(String::from_utf8_lossy(&outcome.stdout).to_string())
                }
                WorkerMode::Stream => None,
            },
            stderr: Some(String::from_utf8_lossy(&outcome.stderr).to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(temp: &std::path::Path, mode: WorkerMode) -> WorkerRequest {
        WorkerRequest {
            workdir: temp.to_path_buf(),
            prompt: "do the work\n".to_string(),
            role: WorkerRole::Issue {
                slug: "alpha".to_string(),
            },
            mode,
            stream_log_path: temp.join("stream.jsonl"),
            max_turns: None,
        }
    }

    #[test]
    fn command_worker_exports_issue_env() {
        let temp = tempfile::tempdir().expect("tempdir");
        let worker = CommandWorker::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "printf '%s' \"$WALK_ISSUE\"".to_string(),
        ]);

        let outcome = worker
            .run(&request(temp.path(), WorkerMode::Capture))
            .expect("run");
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout.as_deref(), Some("alpha"));
    }

    #[test]
    fn command_worker_exports_planning_env() {
        let temp = tempfile::tempdir().expect("tempdir");
        let worker = CommandWorker::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "printf '%s' \"$WALK_PLANNING\"".to_string(),
        ]);

        let mut request = request(temp.path(), WorkerMode::Capture);
        request.role = WorkerRole::Planner;
        let outcome = worker.run(&request).expect("run");
        assert_eq!(outcome.stdout.as_deref(), Some("1"));
    }

    #[test]
    fn prompt_arrives_on_stdin() {
        let temp = tempfile::tempdir().expect("tempdir");
        let worker = CommandWorker::new(vec!["cat".to_string()]);

        let outcome = worker
            .run(&request(temp.path(), WorkerMode::Capture))
            .expect("run");
        assert_eq!(outcome.stdout.as_deref(), Some("do the work\n"));
    }

    #[test]
    fn stream_mode_writes_the_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let worker = CommandWorker::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "cat >/dev/null; echo '{\"type\":\"result\",\"subtype\":\"success\"}'".to_string(),
        ]);

        let outcome = worker
            .run(&request(temp.path(), WorkerMode::Stream))
            .expect("run");
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.stdout.is_none());
        let log = std::fs::read_to_string(temp.path().join("stream.jsonl")).expect("log");
        assert!(log.contains("success"));
    }
}
