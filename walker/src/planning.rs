//! Planning lifecycle: epoch advance, planner spawn, result dispatch, and
//! walk finalization.

use std::collections::BTreeSet;
use std::fs;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::types::{PlanningOutcome, WalkStatus};
use crate::io::prompt::{PlannerPromptInputs, PromptBuilder};
use crate::io::result_file::consume_planning_result;
use crate::io::store::StoreGate;
use crate::io::walk_meta::WalkDoc;
use crate::io::worker::{Worker, WorkerRequest, WorkerRole};
use crate::report::render_summary;

/// Driver-facing outcome of one planning round.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    /// The planner declared the investigation finished.
    Completed { reason: String },
    /// New issues were created (declared, or observed as a fallback).
    Created,
    /// Nothing new: counts toward the stall budget.
    Empty,
}

/// Result of [`run_planning_round`].
#[derive(Debug, Clone, PartialEq)]
pub struct PlanningRound {
    pub outcome: RoundOutcome,
    pub epoch: u64,
    /// Growth of the ready queue across the round; feeds the adaptive
    /// planning threshold.
    pub new_ready: usize,
}

/// Run one planning round: advance the epoch, spawn the planner, interpret
/// its result file (observational fallback when absent or unknown).
#[instrument(skip_all)]
pub fn run_planning_round<W: Worker>(
    gate: &StoreGate,
    worker: &W,
    walk: &WalkDoc,
) -> Result<PlanningRound> {
    let ready_before = gate.read().ready_issues()?.len();
    let open_before: BTreeSet<String> = gate
        .read()
        .open_issues()?
        .into_iter()
        .map(|issue| issue.slug)
        .collect();

    let epoch = gate.with_write(|store| store.increment_epoch())?;
    info!(epoch, "planning round started");

    let inputs = PlannerPromptInputs::gather(gate.read(), walk)?;
    let prompt = PromptBuilder::from_config(&walk.config).build_planner(&inputs);
    let request = WorkerRequest {
        workdir: gate.read().paths().walk_dir.clone(),
        prompt,
        role: WorkerRole::Planner,
        mode: walk.config.worker_mode,
        stream_log_path: gate.read().paths().walk_dir.join(".planner.log"),
        max_turns: Some(walk.config.capture_max_turns),
    };

    let planner_failed = match worker.run(&request) {
        Ok(outcome) => {
            if outcome.exit_code != Some(0) {
                warn!(exit_code = ?outcome.exit_code, "planner exited non-zero");
            }
            false
        }
        Err(err) => {
            warn!(error = %err, "planner failed to run");
            true
        }
    };

    let result = consume_planning_result(&gate.read().paths().planning_result_path)?;
    let ready_after = gate.read().ready_issues()?.len();
    let new_ready = ready_after.saturating_sub(ready_before);

    let outcome = match result.as_ref().and_then(|r| r.outcome) {
        Some(PlanningOutcome::Completed) => RoundOutcome::Completed {
            reason: result
                .map(|r| r.reason)
                .filter(|reason| !reason.is_empty())
                .unwrap_or_else(|| "planner declared the walk complete".to_string()),
        },
        Some(PlanningOutcome::CreatedIssues) => RoundOutcome::Created,
        Some(PlanningOutcome::NoWorkFound) => RoundOutcome::Empty,
        None => {
            // Missing file or unknown outcome: fall back to observation.
            if planner_failed {
                RoundOutcome::Empty
            } else {
                let created_any = gate
                    .read()
                    .open_issues()?
                    .into_iter()
                    .any(|issue| !open_before.contains(&issue.slug));
                if created_any {
                    RoundOutcome::Created
                } else {
                    RoundOutcome::Empty
                }
            }
        }
    };

    info!(epoch, outcome = ?outcome, new_ready, "planning round finished");
    Ok(PlanningRound {
        outcome,
        epoch,
        new_ready,
    })
}

/// Terminate the walk: persist the status and write `summary.md`.
pub fn finalize_walk(gate: &StoreGate, status: WalkStatus, reason: &str) -> Result<WalkDoc> {
    let doc = gate.with_write(|store| store.set_walk_status(status, Some(reason)))?;
    let summary = render_summary(gate.read(), &doc)?;
    let path = &gate.read().paths().summary_path;
    fs::write(path, summary).with_context(|| format!("write {}", path.display()))?;
    info!(status = status.as_str(), reason, "walk finalized");
    Ok(doc)
}
