//! Test helpers: scratch walks and scripted workers.
//!
//! Scripted workers act on the walk directory exactly the way a real LLM
//! worker would (result files, store calls, planning results) without
//! spawning processes.

use std::collections::VecDeque;
use std::fs;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use crate::core::types::{CloseSignal, Issue};
use crate::io::init::{InitOptions, init_walk};
use crate::io::paths::IssuePaths;
use crate::io::runs::{create_run_dir, write_meta};
use crate::io::store::{CreateIssue, StoreGate, WalkStore};
use crate::io::walk_meta::{WalkConfig, WalkDoc, load_walk, store_walk};
use crate::io::worker::{Worker, WorkerOutcome, WorkerRequest, WorkerRole};

/// A scratch walk in a temp directory, cleaned up on drop.
pub struct TestWalk {
    _temp: TempDir,
    store: WalkStore,
}

impl TestWalk {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new().context("create tempdir")?;
        init_walk(
            temp.path(),
            &InitOptions {
                title: "Test walk".to_string(),
                body: "Test goals.\n".to_string(),
            },
        )?;
        let store = WalkStore::new(temp.path());
        Ok(Self { _temp: temp, store })
    }

    pub fn store(&self) -> &WalkStore {
        &self.store
    }

    pub fn gate(&self) -> StoreGate {
        StoreGate::new(self.store.clone())
    }

    pub fn walk_doc(&self) -> WalkDoc {
        self.store.load_walk().expect("load walk doc")
    }

    /// Rewrite the walk config in place.
    pub fn set_config(&self, mutate: impl FnOnce(&mut WalkConfig)) -> Result<()> {
        let mut doc = load_walk(&self.store.paths().walk_doc_path)?;
        mutate(&mut doc.config);
        store_walk(&self.store.paths().walk_doc_path, &doc)
    }

    /// Create a plain open issue.
    pub fn create_issue(&self, slug: &str, priority: u32) -> Result<Issue> {
        self.store.create(&CreateIssue {
            slug: slug.to_string(),
            title: format!("probe: {slug}"),
            body: format!("{slug} body\n"),
            kind: None,
            priority,
            blocked_by: Vec::new(),
            derived_from: Vec::new(),
        })
    }

    /// Create and immediately close an issue (routine signal).
    pub fn seed_closed(&self, slug: &str, reason: &str) -> Result<()> {
        self.create_issue(slug, 1)?;
        self.store.close(slug, reason, CloseSignal::Routine)?;
        Ok(())
    }

    /// Pre-seed one finished run with the given exit code.
    pub fn seed_run(&self, slug: &str, exit_code: Option<i32>) -> Result<()> {
        let (dir, _) = self
            .store
            .issue_location(slug)
            .context("issue must exist before seeding runs")?;
        let started_at: DateTime<Utc> = "2026-08-01T10:00:00Z".parse().expect("ts");
        let run_dir = create_run_dir(&IssuePaths::new(&dir).runs_dir, started_at)?;
        write_meta(
            &run_dir,
            &crate::core::types::RunMeta {
                started_at,
                finished_at: started_at,
                exit_code,
                interrupted: exit_code.is_none(),
                cost_usd: None,
                token_usage: None,
            },
        )
    }
}

/// One scripted side effect a fake worker performs against the walk.
#[derive(Debug, Clone)]
pub enum ScriptedAction {
    /// Write a `result` file in the open issue directory (driver closes).
    WriteResult {
        reason: String,
        /// Also writes a `close.meta` close request carrying the signal.
        signal: Option<CloseSignal>,
    },
    /// Close the issue through the store (worker closed it itself).
    CloseViaStore {
        reason: String,
        signal: CloseSignal,
    },
    /// Write `_planning_result.md` in the walk root.
    WritePlanningResult { outcome: String, reason: String },
    /// Create a fresh open issue.
    CreateIssue { slug: String, priority: u32 },
    /// Write the restart marker.
    RequestRestart,
}

/// One scripted invocation.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    pub actions: Vec<ScriptedAction>,
    /// `None` simulates signal termination.
    pub exit_code: Option<i32>,
    /// Stream-mode log contents to write, when set.
    pub stream_log: Option<String>,
}

impl Default for ScriptedRun {
    fn default() -> Self {
        Self {
            actions: Vec::new(),
            exit_code: Some(0),
            stream_log: None,
        }
    }
}

/// Worker that replays scripted runs instead of spawning processes.
pub struct ScriptedWorker {
    scripts: Mutex<VecDeque<ScriptedRun>>,
    calls: AtomicUsize,
}

impl ScriptedWorker {
    pub fn new(scripts: Vec<ScriptedRun>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Invocations observed so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Scripted runs not yet consumed.
    pub fn remaining(&self) -> usize {
        self.scripts.lock().expect("scripts lock").len()
    }
}

impl Worker for ScriptedWorker {
    fn run(&self, request: &WorkerRequest) -> Result<WorkerOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .unwrap_or_default();

        let store = WalkStore::new(&request.workdir);
        let slug = match &request.role {
            WorkerRole::Issue { slug } => Some(slug.clone()),
            WorkerRole::Planner => None,
        };

        for action in &script.actions {
            apply_action(&store, slug.as_deref(), action)?;
        }
        if let Some(log) = &script.stream_log {
            fs::write(&request.stream_log_path, log).context("write scripted stream log")?;
        }

        let now = Utc::now();
        Ok(WorkerOutcome {
            exit_code: script.exit_code,
            interrupted: script.exit_code.is_none(),
            started_at: now,
            finished_at: now,
            stdout: Some(String::new()),
            stderr: Some(String::new()),
        })
    }
}

fn apply_action(store: &WalkStore, slug: Option<&str>, action: &ScriptedAction) -> Result<()> {
    match action {
        ScriptedAction::WriteResult { reason, signal } => {
            let slug = slug.context("issue role required for WriteResult")?;
            let dir = store.paths().open_issue_dir(slug);
            let issue_paths = IssuePaths::new(&dir);
            fs::write(&issue_paths.result_path, format!("{reason}\n"))
                .context("write scripted result")?;
            if let Some(signal) = signal {
                fs::write(
                    &issue_paths.close_meta_path,
                    format!("reason: {reason}\nsignal: {}\n", signal.as_str()),
                )
                .context("write scripted close request")?;
            }
        }
        ScriptedAction::CloseViaStore { reason, signal } => {
            let slug = slug.context("issue role required for CloseViaStore")?;
            store.close(slug, reason, *signal)?;
        }
        ScriptedAction::WritePlanningResult { outcome, reason } => {
            fs::write(
                &store.paths().planning_result_path,
                format!("---\noutcome: {outcome}\nreason: {reason}\n---\n"),
            )
            .context("write scripted planning result")?;
        }
        ScriptedAction::CreateIssue { slug, priority } => {
            store.create(&CreateIssue {
                slug: slug.clone(),
                title: format!("planned: {slug}"),
                body: "planned work\n".to_string(),
                kind: None,
                priority: *priority,
                blocked_by: Vec::new(),
                derived_from: Vec::new(),
            })?;
        }
        ScriptedAction::RequestRestart => {
            fs::write(&store.paths().restart_marker_path, "")
                .context("write scripted restart marker")?;
        }
    }
    Ok(())
}
