//! The entry loop: pick ready issues, dispatch workers, trigger planning,
//! honour signals and the restart marker.
//!
//! One driver per walk, enforced by the PID-file lock. Concurrency is plain
//! OS threads around worker child processes; the only suspension points are
//! the inter-iteration sleep, child waits, and lock acquisition.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use tracing::{debug, info, instrument, warn};

use crate::agent::{WorkReport, work_issue};
use crate::core::threshold::PlanningThreshold;
use crate::core::types::WalkStatus;
use crate::io::lock::PidLock;
use crate::io::store::{StoreGate, WalkStore};
use crate::io::walk_meta::{WalkDoc, load_walk};
use crate::io::worker::Worker;
use crate::planning::{RoundOutcome, finalize_walk, run_planning_round};

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Signal-driven flags checked at iteration boundaries.
#[derive(Debug, Clone)]
pub struct ShutdownFlags {
    shutdown: Arc<AtomicBool>,
    sighup: Arc<AtomicBool>,
}

impl ShutdownFlags {
    /// Register SIGINT/SIGTERM as shutdown and SIGHUP as log-and-ignore.
    pub fn install() -> Result<Self> {
        let flags = Self::manual();
        for signal in [SIGINT, SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&flags.shutdown))
                .context("register shutdown signal")?;
        }
        signal_hook::flag::register(SIGHUP, Arc::clone(&flags.sighup))
            .context("register SIGHUP")?;
        Ok(flags)
    }

    /// Flags without signal registration, for tests and embedding.
    pub fn manual() -> Self {
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            sighup: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn log_sighup(&self) {
        if self.sighup.swap(false, Ordering::SeqCst) {
            info!("SIGHUP received and ignored (reserved for reconfiguration)");
        }
    }
}

/// How a drive invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DriveOutcome {
    Finished(WalkStatus),
    /// A worker wrote the restart marker; exit with the restart code.
    RestartRequested,
}

/// Run the driver against the walk at `walk_dir` until it terminates.
#[instrument(skip_all, fields(walk = %walk_dir.display()))]
pub fn drive<W>(walk_dir: &Path, worker: Arc<W>, flags: &ShutdownFlags) -> Result<DriveOutcome>
where
    W: Worker + Send + Sync + 'static,
{
    let store = WalkStore::new(walk_dir);
    let _pid = PidLock::acquire(&store.paths().pid_path)?;

    let mut walk = store.load_walk()?;
    match walk.status {
        WalkStatus::Open => {}
        WalkStatus::Stalled => {
            info!("re-entering stalled walk");
            walk = store.set_walk_status(WalkStatus::Open, None)?;
        }
        status => {
            return Err(anyhow!(
                "walk is {} (refusing to drive a finished walk)",
                status.as_str()
            ));
        }
    }

    let gate = Arc::new(StoreGate::new(store));
    let walk = Arc::new(walk);
    info!(
        max_concurrent = walk.config.max_concurrent,
        mode = walk.config.worker_mode.as_str(),
        "driver started"
    );
    if walk.config.max_concurrent <= 1 {
        sequential_loop(&gate, worker.as_ref(), &walk, flags)
    } else {
        concurrent_loop(&gate, &worker, &walk, flags)
    }
}

fn sequential_loop<W: Worker>(
    gate: &StoreGate,
    worker: &W,
    walk: &WalkDoc,
    flags: &ShutdownFlags,
) -> Result<DriveOutcome> {
    let config = &walk.config;
    let sleep = Duration::from_secs(config.sleep_secs);
    let mut threshold = PlanningThreshold::new(Utc::now());
    let mut consecutive_planning = 0u32;

    loop {
        flags.log_sighup();
        if consume_restart_marker(gate)? {
            return Ok(DriveOutcome::RestartRequested);
        }
        if flags.shutdown_requested() {
            finalize_walk(gate, WalkStatus::Stopped, "stopped by signal")?;
            return Ok(DriveOutcome::Finished(WalkStatus::Stopped));
        }

        if let Some(outcome) = preemptive_planning(gate, worker, walk, &mut threshold)? {
            return Ok(outcome);
        }

        let ready = gate.read().ready_issues()?;
        let Some(issue) = ready.into_iter().next() else {
            match empty_queue_step(gate, worker, walk, &mut threshold, &mut consecutive_planning)? {
                Some(outcome) => return Ok(outcome),
                None => {
                    thread::sleep(sleep);
                    continue;
                }
            }
        };

        consecutive_planning = 0;
        match work_issue(gate, worker, walk, &issue) {
            Ok(report) => debug!(slug = %report.slug, outcome = ?report.outcome, "issue worked"),
            // The loop never aborts on a single issue's failure; retry policy
            // governs its next eligibility.
            Err(err) => warn!(slug = %issue.slug, error = %err, "worker iteration failed"),
        }
        thread::sleep(sleep);
    }
}

fn concurrent_loop<W>(
    gate: &Arc<StoreGate>,
    worker: &Arc<W>,
    walk: &Arc<WalkDoc>,
    flags: &ShutdownFlags,
) -> Result<DriveOutcome>
where
    W: Worker + Send + Sync + 'static,
{
    let config = &walk.config;
    let sleep = Duration::from_secs(config.sleep_secs);
    let drain_timeout = Duration::from_secs(config.drain_timeout_secs);
    let mut threshold = PlanningThreshold::new(Utc::now());
    let mut consecutive_planning = 0u32;
    let mut active: HashMap<String, JoinHandle<Result<WorkReport>>> = HashMap::new();

    loop {
        flags.log_sighup();
        reap_finished(&mut active);

        if consume_restart_marker(gate)? {
            drain(&mut active, drain_timeout);
            return Ok(DriveOutcome::RestartRequested);
        }
        if flags.shutdown_requested() {
            drain(&mut active, drain_timeout);
            finalize_walk(gate, WalkStatus::Stopped, "stopped by signal")?;
            return Ok(DriveOutcome::Finished(WalkStatus::Stopped));
        }

        // Planning is serialised with worker execution: only plan when idle.
        if active.is_empty() {
            if let Some(outcome) = preemptive_planning(gate, worker.as_ref(), walk, &mut threshold)?
            {
                return Ok(outcome);
            }
            let ready = gate.read().ready_issues()?;
            if ready.is_empty() {
                match empty_queue_step(
                    gate,
                    worker.as_ref(),
                    walk,
                    &mut threshold,
                    &mut consecutive_planning,
                )? {
                    Some(outcome) => return Ok(outcome),
                    None => {
                        thread::sleep(sleep);
                        continue;
                    }
                }
            }
            consecutive_planning = 0;
        }

        let free = config.max_concurrent.saturating_sub(active.len());
        if free > 0 {
            let ready = gate.read().ready_issues()?;
            let to_spawn: Vec<_> = ready
                .into_iter()
                .filter(|issue| !active.contains_key(&issue.slug))
                .take(free)
                .collect();
            for issue in to_spawn {
                let slug = issue.slug.clone();
                let gate = Arc::clone(gate);
                let worker = Arc::clone(worker);
                let walk = Arc::clone(walk);
                debug!(slug = %slug, "spawning concurrent worker");
                let handle = thread::spawn(move || {
                    work_issue(gate.as_ref(), worker.as_ref(), walk.as_ref(), &issue)
                });
                active.insert(slug, handle);
            }
        }
        thread::sleep(sleep);
    }
}

/// Join every finished worker thread, logging failures; retry policy against
/// the recorded runs governs what happens to the issue next.
fn reap_finished(active: &mut HashMap<String, JoinHandle<Result<WorkReport>>>) {
    let finished: Vec<String> = active
        .iter()
        .filter(|(_, handle)| handle.is_finished())
        .map(|(slug, _)| slug.clone())
        .collect();
    for slug in finished {
        let Some(handle) = active.remove(&slug) else {
            continue;
        };
        match handle.join() {
            Ok(Ok(report)) => debug!(slug = %report.slug, outcome = ?report.outcome, "worker reaped"),
            Ok(Err(err)) => warn!(slug = %slug, error = %err, "worker iteration failed"),
            Err(_) => warn!(slug = %slug, "worker thread panicked"),
        }
    }
}

/// Bounded drain: wait for in-flight workers, then abandon the stragglers.
fn drain(active: &mut HashMap<String, JoinHandle<Result<WorkReport>>>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !active.is_empty() && Instant::now() < deadline {
        reap_finished(active);
        thread::sleep(DRAIN_POLL);
    }
    if !active.is_empty() {
        warn!(
            abandoned = active.len(),
            "drain timeout elapsed, abandoning in-flight workers"
        );
        active.clear();
    }
}

/// Signal-driven pre-emptive planning: plan early when new closed context
/// demands it and there is still ready work that would otherwise run first.
fn preemptive_planning<W: Worker>(
    gate: &StoreGate,
    worker: &W,
    walk: &WalkDoc,
    threshold: &mut PlanningThreshold,
) -> Result<Option<DriveOutcome>> {
    if gate.read().ready_issues()?.is_empty() {
        return Ok(None);
    }
    let context = gate.read().new_context_since(threshold.last_planning_time)?;
    if !threshold.should_plan_now(&context) {
        return Ok(None);
    }
    info!(
        bytes = context.bytes,
        signals = context.signals.len(),
        "pre-emptive planning round"
    );
    let round = run_planning_round(gate, worker, walk)?;
    threshold.observe_round(round.new_ready, Utc::now());
    if let RoundOutcome::Completed { reason } = round.outcome {
        finalize_walk(gate, WalkStatus::Completed, &reason)?;
        return Ok(Some(DriveOutcome::Finished(WalkStatus::Completed)));
    }
    Ok(None)
}

/// The empty-ready-queue branch shared by both loops: stop under a closed
/// parent, stall after too many fruitless rounds, otherwise plan.
fn empty_queue_step<W: Worker>(
    gate: &StoreGate,
    worker: &W,
    walk: &WalkDoc,
    threshold: &mut PlanningThreshold,
    consecutive_planning: &mut u32,
) -> Result<Option<DriveOutcome>> {
    if parent_walk_closed(walk) {
        finalize_walk(gate, WalkStatus::Stopped, "parent walk closed")?;
        return Ok(Some(DriveOutcome::Finished(WalkStatus::Stopped)));
    }

    *consecutive_planning += 1;
    if *consecutive_planning > walk.config.max_planning_rounds {
        let reason = format!(
            "no progress after {} planning rounds",
            walk.config.max_planning_rounds
        );
        finalize_walk(gate, WalkStatus::Stalled, &reason)?;
        return Ok(Some(DriveOutcome::Finished(WalkStatus::Stalled)));
    }

    let round = run_planning_round(gate, worker, walk)?;
    threshold.observe_round(round.new_ready, Utc::now());
    match round.outcome {
        RoundOutcome::Completed { reason } => {
            finalize_walk(gate, WalkStatus::Completed, &reason)?;
            return Ok(Some(DriveOutcome::Finished(WalkStatus::Completed)));
        }
        RoundOutcome::Created => *consecutive_planning = 0,
        RoundOutcome::Empty => {}
    }
    Ok(None)
}

fn consume_restart_marker(gate: &StoreGate) -> Result<bool> {
    let marker = &gate.read().paths().restart_marker_path;
    if !marker.exists() {
        return Ok(false);
    }
    fs::remove_file(marker).with_context(|| format!("remove {}", marker.display()))?;
    info!("restart marker consumed, exiting for the trampoline");
    Ok(true)
}

fn parent_walk_closed(walk: &WalkDoc) -> bool {
    let Some(parent) = &walk.config.parent else {
        return false;
    };
    match load_walk(&parent.join("_walk.md")) {
        Ok(parent_doc) => parent_doc.status.is_terminal(),
        Err(err) => {
            warn!(parent = %parent.display(), error = %err, "unreadable parent walk, assuming open");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::CloseSignal;
    use crate::test_support::{ScriptedAction, ScriptedRun, ScriptedWorker, TestWalk};

    fn fast(walk: &TestWalk) {
        walk.set_config(|config| config.sleep_secs = 0).expect("config");
    }

    fn close_run(reason: &str) -> ScriptedRun {
        ScriptedRun {
            actions: vec![ScriptedAction::WriteResult {
                reason: reason.to_string(),
                signal: None,
            }],
            ..ScriptedRun::default()
        }
    }

    fn planner_result(outcome: &str, reason: &str) -> ScriptedRun {
        ScriptedRun {
            actions: vec![ScriptedAction::WritePlanningResult {
                outcome: outcome.to_string(),
                reason: reason.to_string(),
            }],
            ..ScriptedRun::default()
        }
    }

    #[test]
    fn single_issue_happy_path() {
        let walk = TestWalk::new().expect("walk");
        fast(&walk);
        walk.create_issue("alpha", 1).expect("seed");

        let worker = Arc::new(ScriptedWorker::new(vec![
            close_run("Done."),
            planner_result("completed", "Goal met"),
        ]));
        let outcome = drive(
            &walk.store().paths().walk_dir,
            worker,
            &ShutdownFlags::manual(),
        )
        .expect("drive");
        assert_eq!(outcome, DriveOutcome::Finished(WalkStatus::Completed));

        let store = walk.store();
        assert!(!store.paths().open_issue_dir("alpha").exists());
        let alpha = store.show("alpha").expect("show");
        assert_eq!(alpha.closure.expect("closed").reason, "Done.");

        let runs = store.runs("alpha").expect("runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].meta.exit_code, Some(0));

        let comments = store.comments("alpha").expect("comments").expect("present");
        assert!(comments.contains("Agent started"));
        assert!(comments.contains("Run stats"));
    }

    #[test]
    fn priority_selects_the_highest_first() {
        let walk = TestWalk::new().expect("walk");
        fast(&walk);
        walk.create_issue("lo", 3).expect("seed");
        walk.create_issue("hi", 1).expect("seed");

        let worker = Arc::new(ScriptedWorker::new(vec![
            close_run("first"),
            close_run("second"),
            planner_result("completed", "done"),
        ]));
        drive(
            &walk.store().paths().walk_dir,
            worker,
            &ShutdownFlags::manual(),
        )
        .expect("drive");

        let store = walk.store();
        let hi = store.show("hi").expect("hi").closure.expect("closed");
        let lo = store.show("lo").expect("lo").closure.expect("closed");
        assert_eq!(hi.reason, "first");
        assert_eq!(lo.reason, "second");
        assert!(hi.closed_at <= lo.closed_at);
    }

    #[test]
    fn retry_exhaustion_blocks_and_stalls() {
        let walk = TestWalk::new().expect("walk");
        fast(&walk);
        walk.create_issue("buggy", 1).expect("seed");
        walk.seed_run("buggy", Some(1)).expect("run");
        walk.seed_run("buggy", Some(1)).expect("run");

        // one more failing run, then the planner finds nothing, three times
        let worker = Arc::new(ScriptedWorker::new(vec![ScriptedRun {
            exit_code: Some(1),
            ..ScriptedRun::default()
        }]));
        let outcome = drive(
            &walk.store().paths().walk_dir,
            worker,
            &ShutdownFlags::manual(),
        )
        .expect("drive");
        assert_eq!(outcome, DriveOutcome::Finished(WalkStatus::Stalled));

        let store = walk.store();
        let buggy = store.show("buggy").expect("show");
        assert!(buggy.blocked_by_driver);
        assert!(store.ready_issues().expect("ready").is_empty());
        let comments = store.comments("buggy").expect("comments").expect("present");
        assert!(comments.contains("consecutive failures"));

        let doc = store.load_walk().expect("doc");
        assert!(doc.finish_reason.expect("reason").contains("planning rounds"));
    }

    #[test]
    fn planner_completes_an_empty_walk() {
        let walk = TestWalk::new().expect("walk");
        fast(&walk);

        let worker = Arc::new(ScriptedWorker::new(vec![planner_result(
            "completed", "Goal met",
        )]));
        let outcome = drive(
            &walk.store().paths().walk_dir,
            worker,
            &ShutdownFlags::manual(),
        )
        .expect("drive");
        assert_eq!(outcome, DriveOutcome::Finished(WalkStatus::Completed));

        let store = walk.store();
        let doc = store.load_walk().expect("doc");
        assert_eq!(doc.status, WalkStatus::Completed);
        assert_eq!(doc.finish_reason.as_deref(), Some("Goal met"));
        assert!(store.paths().summary_path.exists());
        assert!(!store.paths().planning_result_path.exists());
    }

    #[test]
    fn planner_stall_after_fruitless_rounds() {
        let walk = TestWalk::new().expect("walk");
        fast(&walk);

        let worker = Arc::new(ScriptedWorker::new(vec![
            planner_result("no_work_found", "nothing"),
            planner_result("no_work_found", "nothing"),
            planner_result("no_work_found", "nothing"),
        ]));
        let outcome = drive(
            &walk.store().paths().walk_dir,
            Arc::clone(&worker),
            &ShutdownFlags::manual(),
        )
        .expect("drive");
        assert_eq!(outcome, DriveOutcome::Finished(WalkStatus::Stalled));
        assert_eq!(worker.calls(), 3, "planner runs exactly max rounds");

        let doc = walk.store().load_walk().expect("doc");
        assert!(doc.finish_reason.expect("reason").contains("planning rounds"));
    }

    #[test]
    fn pivotal_close_triggers_preemptive_planning() {
        let walk = TestWalk::new().expect("walk");
        fast(&walk);
        walk.create_issue("p1", 1).expect("seed");
        walk.create_issue("p2", 2).expect("seed");

        let worker = Arc::new(ScriptedWorker::new(vec![
            ScriptedRun {
                actions: vec![ScriptedAction::WriteResult {
                    reason: "changes everything".to_string(),
                    signal: Some(CloseSignal::Pivotal),
                }],
                ..ScriptedRun::default()
            },
            // pre-emptive planner round, before p2 runs
            planner_result("created_issues", "reprioritised"),
            close_run("as planned"),
            planner_result("completed", "done"),
        ]));
        let outcome = drive(
            &walk.store().paths().walk_dir,
            Arc::clone(&worker),
            &ShutdownFlags::manual(),
        )
        .expect("drive");
        assert_eq!(outcome, DriveOutcome::Finished(WalkStatus::Completed));
        assert_eq!(worker.calls(), 4);

        let store = walk.store();
        let p1 = store.show("p1").expect("p1").closure.expect("closed");
        let p2 = store.show("p2").expect("p2").closure.expect("closed");
        assert_eq!(p1.signal, CloseSignal::Pivotal);
        assert_eq!(p1.epoch, 1);
        assert_eq!(p2.epoch, 2, "planner ran between p1 and p2");
    }

    #[test]
    fn restart_marker_wins_over_everything() {
        let walk = TestWalk::new().expect("walk");
        fast(&walk);
        walk.create_issue("alpha", 1).expect("seed");

        let worker = Arc::new(ScriptedWorker::new(vec![ScriptedRun {
            actions: vec![
                ScriptedAction::WriteResult {
                    reason: "done, and I touched the driver".to_string(),
                    signal: None,
                },
                ScriptedAction::RequestRestart,
            ],
            ..ScriptedRun::default()
        }]));
        let outcome = drive(
            &walk.store().paths().walk_dir,
            worker,
            &ShutdownFlags::manual(),
        )
        .expect("drive");
        assert_eq!(outcome, DriveOutcome::RestartRequested);
        assert!(!walk.store().paths().restart_marker_path.exists());
    }

    #[test]
    fn shutdown_request_finalizes_as_stopped() {
        let walk = TestWalk::new().expect("walk");
        fast(&walk);
        walk.create_issue("alpha", 1).expect("seed");

        let flags = ShutdownFlags::manual();
        flags.request_shutdown();
        let worker = Arc::new(ScriptedWorker::new(Vec::new()));
        let outcome = drive(&walk.store().paths().walk_dir, Arc::clone(&worker), &flags)
            .expect("drive");
        assert_eq!(outcome, DriveOutcome::Finished(WalkStatus::Stopped));
        assert_eq!(worker.calls(), 0);

        let doc = walk.store().load_walk().expect("doc");
        assert_eq!(doc.status, WalkStatus::Stopped);
        assert_eq!(doc.finish_reason.as_deref(), Some("stopped by signal"));
    }

    #[test]
    fn concurrent_mode_works_the_whole_queue() {
        let walk = TestWalk::new().expect("walk");
        walk.set_config(|config| {
            config.sleep_secs = 0;
            config.max_concurrent = 2;
        })
        .expect("config");
        walk.create_issue("one", 1).expect("seed");
        walk.create_issue("two", 2).expect("seed");

        let worker = Arc::new(ScriptedWorker::new(vec![
            close_run("done"),
            close_run("done"),
            planner_result("completed", "all done"),
        ]));
        let outcome = drive(
            &walk.store().paths().walk_dir,
            worker,
            &ShutdownFlags::manual(),
        )
        .expect("drive");
        assert_eq!(outcome, DriveOutcome::Finished(WalkStatus::Completed));

        let store = walk.store();
        assert!(store.show("one").expect("one").closure.is_some());
        assert!(store.show("two").expect("two").closure.is_some());
    }

    #[test]
    fn stalled_walks_reopen_on_reentry() {
        let walk = TestWalk::new().expect("walk");
        fast(&walk);
        walk.store()
            .set_walk_status(WalkStatus::Stalled, Some("earlier stall"))
            .expect("stall");

        let worker = Arc::new(ScriptedWorker::new(vec![planner_result(
            "completed", "Goal met",
        )]));
        let outcome = drive(
            &walk.store().paths().walk_dir,
            worker,
            &ShutdownFlags::manual(),
        )
        .expect("drive");
        assert_eq!(outcome, DriveOutcome::Finished(WalkStatus::Completed));
    }

    #[test]
    fn completed_walks_refuse_to_drive() {
        let walk = TestWalk::new().expect("walk");
        walk.store()
            .set_walk_status(WalkStatus::Completed, Some("done"))
            .expect("complete");

        let worker = Arc::new(ScriptedWorker::new(Vec::new()));
        let err = drive(
            &walk.store().paths().walk_dir,
            worker,
            &ShutdownFlags::manual(),
        )
        .expect_err("drive");
        assert!(err.to_string().contains("refusing to drive"));
    }
}
