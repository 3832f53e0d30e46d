//! One worker invocation against one issue.
//!
//! The runner gates on retry policy, assembles the prompt, records run
//! artifacts, and detects how (or whether) the issue was closed. Workers may
//! close the issue themselves mid-run, which moves the directory; every
//! post-wait write re-resolves the run directory through the store.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::digest::{RunDigest, digest_stream};
use crate::core::retry::{consecutive_failures, failing_run_ids, should_block, should_warn};
use crate::core::types::{CloseSignal, Issue, IssueStatus, RunMeta};
use crate::io::issue_doc::{CloseRequest, parse_close_request};
use crate::io::paths::IssuePaths;
use crate::io::prompt::{PromptBuilder, WorkerPromptInputs};
use crate::io::runs::{create_run_dir, write_meta, write_output, write_prompt};
use crate::io::store::{StoreError, StoreGate};
use crate::io::walk_meta::{WalkDoc, WorkerMode};
use crate::io::worker::{Worker, WorkerRequest, WorkerRole};

/// Capture-mode turn multiplier for verification-heavy issue types.
const EXTENDED_TURN_FACTOR: u32 = 3;
/// Excerpt budget for "did not close" comments.
const EXCERPT_CHARS: usize = 500;

/// How one invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkOutcome {
    /// Retry policy blocked the issue before a spawn.
    Blocked,
    /// The worker closed the issue itself (directory moved mid-run).
    ClosedByWorker,
    /// The worker left a result/close request; the driver closed the issue.
    ClosedByDriver { reason: String },
    /// The worker exited without closing.
    LeftOpen,
    /// The worker was killed by a signal; not counted as a failure.
    Interrupted,
}

/// Report from one [`work_issue`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkReport {
    pub slug: String,
    pub outcome: WorkOutcome,
}

/// Run one worker against `issue`, recording all artifacts.
#[instrument(skip_all, fields(slug = %issue.slug))]
pub fn work_issue<W: Worker>(
    gate: &StoreGate,
    worker: &W,
    walk: &WalkDoc,
    issue: &Issue,
) -> Result<WorkReport> {
    let slug = issue.slug.as_str();
    let config = &walk.config;

    // Retry gate before anything is spawned.
    let runs = gate.read().runs(slug)?;
    let failures = consecutive_failures(&runs);
    if should_block(failures, config.max_failures) {
        let failing = failing_run_ids(&runs).join(", ");
        let note = format!(
            "Blocked by the driver after {failures} consecutive failures.\nFailing runs: {failing}\nDelete this file to make the issue eligible again.\n"
        );
        gate.with_write(|store| -> Result<()> {
            store.block_by_driver(slug, &note)?;
            store.add_comment(
                slug,
                &format!(
                    "Driver blocked this issue after {failures} consecutive failures (runs: {failing}). Delete blocked_by_driver to unblock."
                ),
            )
        })?;
        warn!(failures, "issue blocked by retry policy");
        return Ok(WorkReport {
            slug: slug.to_string(),
            outcome: WorkOutcome::Blocked,
        });
    }
    if should_warn(failures, config.max_failures) {
        gate.with_write(|store| {
            store.add_comment(
                slug,
                &format!(
                    "{failures} consecutive failures so far; one more failed run blocks this issue."
                ),
            )
        })?;
    }

    // Prompt and start-of-run bookkeeping.
    let inputs = WorkerPromptInputs::gather(gate.read(), walk, issue)?;
    let prompt = PromptBuilder::from_config(config).build_worker(&inputs);
    gate.with_write(|store| {
        store.add_comment(
            slug,
            &format!(
                "Agent started (type {}, prompt {} lines).",
                issue.kind,
                prompt.lines().count()
            ),
        )
    })?;

    let started_at = Utc::now();
    let issue_dir = gate.read().paths().open_issue_dir(slug);
    let run_dir = create_run_dir(&IssuePaths::new(&issue_dir).runs_dir, started_at)?;
    let run_name = run_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    write_prompt(&run_dir, &prompt)?;

    let stream_log_path = run_dir.join("output");
    let live_link = link_live_log(gate, slug, config, &stream_log_path);

    let max_turns = capture_turn_budget(config, &issue.kind);
    let request = WorkerRequest {
        workdir: gate.read().paths().walk_dir.clone(),
        prompt: prompt.clone(),
        role: WorkerRole::Issue {
            slug: slug.to_string(),
        },
        mode: config.worker_mode,
        stream_log_path: stream_log_path.clone(),
        max_turns: Some(max_turns),
    };

    info!(run = %run_name, mode = config.worker_mode.as_str(), "spawning worker");
    let outcome = worker.run(&request);
    if let Some(link) = live_link {
        let _ = fs::remove_file(link);
    }

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            // A spawn failure must still count toward retry policy, or the
            // issue would be retried forever.
            warn!(error = %err, "worker failed to run");
            let run_dir = resolve_run_dir(gate, slug, &run_dir, &run_name)?;
            write_meta(
                &run_dir,
                &RunMeta {
                    started_at,
                    finished_at: Utc::now(),
                    exit_code: Some(127),
                    interrupted: false,
                    cost_usd: None,
                    token_usage: None,
                },
            )?;
            gate.with_write(|store| {
                store.add_comment(slug, &format!("Worker failed to run: {err:#}"))
            })?;
            return Ok(WorkReport {
                slug: slug.to_string(),
                outcome: WorkOutcome::LeftOpen,
            });
        }
    };

    // The worker may have closed the issue (moving its directory) mid-run;
    // artifacts land wherever the runs directory lives now.
    let run_dir = resolve_run_dir(gate, slug, &run_dir, &run_name)?;
    write_prompt(&run_dir, &prompt)?;

    let digest = match config.worker_mode {
        WorkerMode::Stream => {
            let log = fs::read_to_string(run_dir.join("output")).unwrap_or_default();
            Some(digest_stream(&log))
        }
        WorkerMode::Capture => {
            write_output(&run_dir, "output", outcome.stdout.as_deref().unwrap_or(""))?;
            write_output(&run_dir, "stderr", outcome.stderr.as_deref().unwrap_or(""))?;
            None
        }
    };
    write_meta(
        &run_dir,
        &RunMeta {
            started_at: outcome.started_at,
            finished_at: outcome.finished_at,
            exit_code: outcome.exit_code,
            interrupted: outcome.interrupted,
            cost_usd: digest.as_ref().and_then(|d| d.cost_usd),
            token_usage: digest.as_ref().and_then(|d| d.token_usage),
        },
    )?;
    if let Some(digest) = &digest {
        append_run_stats(gate, slug, digest, &outcome)?;
    }

    let work_outcome = detect_close(gate, slug, &outcome, config.worker_mode)?;
    debug!(outcome = ?work_outcome, "worker finished");
    Ok(WorkReport {
        slug: slug.to_string(),
        outcome: work_outcome,
    })
}

fn capture_turn_budget(config: &crate::io::walk_meta::WalkConfig, kind: &str) -> u32 {
    if config.extended_turn_kinds.iter().any(|k| k == kind) {
        config.capture_max_turns * EXTENDED_TURN_FACTOR
    } else {
        config.capture_max_turns
    }
}

/// Maintain a walk-root `runs/<slug>` symlink at the live stream log.
fn link_live_log(
    gate: &StoreGate,
    slug: &str,
    config: &crate::io::walk_meta::WalkConfig,
    stream_log_path: &Path,
) -> Option<PathBuf> {
    if !config.live_log_links || config.worker_mode != WorkerMode::Stream {
        return None;
    }
    let live_dir = &gate.read().paths().live_runs_dir;
    if fs::create_dir_all(live_dir).is_err() {
        return None;
    }
    let link = live_dir.join(slug);
    let _ = fs::remove_file(&link);
    match symlink(stream_log_path, &link) {
        Ok(()) => Some(link),
        Err(err) => {
            warn!(error = %err, "unable to create live log link");
            None
        }
    }
}

/// Re-resolve the run directory after the wait; the issue directory may have
/// been renamed into `closed/` while the worker ran.
fn resolve_run_dir(
    gate: &StoreGate,
    slug: &str,
    original: &Path,
    run_name: &str,
) -> Result<PathBuf> {
    if original.exists() {
        return Ok(original.to_path_buf());
    }
    let (dir, _) = gate
        .read()
        .issue_location(slug)
        .ok_or_else(|| StoreError::NotFound(slug.to_string()))?;
    let relocated = IssuePaths::new(&dir).runs_dir.join(run_name);
    fs::create_dir_all(&relocated)
        .with_context(|| format!("create relocated run dir {}", relocated.display()))?;
    Ok(relocated)
}

fn append_run_stats(
    gate: &StoreGate,
    slug: &str,
    digest: &RunDigest,
    outcome: &crate::io::worker::WorkerOutcome,
) -> Result<()> {
    let duration_ms = digest.duration_ms.unwrap_or_else(|| {
        (outcome.finished_at - outcome.started_at)
            .num_milliseconds()
            .max(0) as u64
    });
    let mut stats = format!(
        "Run stats: status {}, {:.1}s",
        digest.status(outcome.exit_code),
        duration_ms as f64 / 1000.0
    );
    if let Some(turns) = digest.num_turns {
        stats.push_str(&format!(", {turns} turns"));
    }
    stats.push_str(&format!(", {} tool calls", digest.tool_calls()));
    if let Some(cost) = digest.cost_usd {
        stats.push_str(&format!(", ${cost:.2}"));
    }
    gate.with_write(|store| store.add_comment(slug, &stats))
}

/// Detect whether and how the issue got closed during the run.
fn detect_close(
    gate: &StoreGate,
    slug: &str,
    outcome: &crate::io::worker::WorkerOutcome,
    mode: WorkerMode,
) -> Result<WorkOutcome> {
    match gate.read().issue_location(slug) {
        Some((_, IssueStatus::Closed)) => return Ok(WorkOutcome::ClosedByWorker),
        Some((dir, IssueStatus::Open)) => {
            let issue_paths = IssuePaths::new(&dir);
            let request = read_close_request(&issue_paths);
            let result_reason = fs::read_to_string(&issue_paths.result_path)
                .ok()
                .and_then(|contents| contents.lines().next().map(str::to_string))
                .filter(|line| !line.trim().is_empty());

            if result_reason.is_some() || request.reason.is_some() {
                let reason = result_reason
                    .or(request.reason.clone())
                    .unwrap_or_else(|| "closed".to_string());
                let signal = request.signal.unwrap_or(CloseSignal::Routine);
                gate.with_write(|store| store.close(slug, &reason, signal))?;
                return Ok(WorkOutcome::ClosedByDriver { reason });
            }
        }
        None => return Err(StoreError::NotFound(slug.to_string()).into()),
    }

    if outcome.interrupted {
        return Ok(WorkOutcome::Interrupted);
    }
    if mode == WorkerMode::Capture {
        let excerpt = |text: Option<&str>| -> String {
            text.unwrap_or("")
                .chars()
                .take(EXCERPT_CHARS)
                .collect::<String>()
        };
        gate.with_write(|store| {
            store.add_comment(
                slug,
                &format!(
                    "Worker exited without closing the issue.\n\nstdout:\n{}\n\nstderr:\n{}",
                    excerpt(outcome.stdout.as_deref()),
                    excerpt(outcome.stderr.as_deref())
                ),
            )
        })?;
    }
    Ok(WorkOutcome::LeftOpen)
}

fn read_close_request(issue_paths: &IssuePaths) -> CloseRequest {
    match fs::read_to_string(&issue_paths.close_meta_path) {
        Ok(contents) => parse_close_request(&contents),
        Err(_) => CloseRequest::default(),
    }
}
