//! Shared deterministic types for the driver core.
//!
//! These types define stable contracts between store, runner and driver.
//! They do not touch the filesystem and must remain deterministic across runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closure annotation influencing planner scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseSignal {
    #[default]
    Routine,
    Surprising,
    Pivotal,
}

impl CloseSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseSignal::Routine => "routine",
            CloseSignal::Surprising => "surprising",
            CloseSignal::Pivotal => "pivotal",
        }
    }

    /// Lenient parse used for worker-written metadata; unknown values are `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "routine" => Some(CloseSignal::Routine),
            "surprising" => Some(CloseSignal::Surprising),
            "pivotal" => Some(CloseSignal::Pivotal),
            _ => None,
        }
    }
}

/// Terminal and non-terminal walk states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalkStatus {
    #[default]
    Open,
    Completed,
    Stalled,
    Stopped,
}

impl WalkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalkStatus::Open => "open",
            WalkStatus::Completed => "completed",
            WalkStatus::Stalled => "stalled",
            WalkStatus::Stopped => "stopped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "open" => Some(WalkStatus::Open),
            "completed" => Some(WalkStatus::Completed),
            "stalled" => Some(WalkStatus::Stalled),
            "stopped" => Some(WalkStatus::Stopped),
            _ => None,
        }
    }

    /// A terminal walk no longer accepts driver iterations.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WalkStatus::Open)
    }
}

/// Which partition of the walk currently holds an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
    Open,
    Closed,
}

/// Token accounting reported by the worker CLI's terminal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

/// Persisted metadata for one worker invocation (`runs/<ts>/meta`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `None` means the child was killed by a signal (interrupted).
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

/// One run record: the `runs/<ts>` directory name plus its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: String,
    pub meta: RunMeta,
}

/// Close metadata attached to an issue when it leaves the open partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Closure {
    pub reason: String,
    pub signal: CloseSignal,
    pub epoch: u64,
    pub closed_at: DateTime<Utc>,
}

/// An atomic unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct Issue {
    pub slug: String,
    pub title: String,
    pub body: String,
    /// Free-form type string (`fix`, `probe`, `epic`, …), never an enum.
    pub kind: String,
    pub priority: u32,
    pub blocked_by: Vec<String>,
    pub derived_from: Vec<String>,
    /// `.next` marker: bumps the issue to the front of the ready queue.
    pub priority_override: bool,
    /// Marker written by retry policy after repeated failures.
    pub blocked_by_driver: bool,
    pub closure: Option<Closure>,
}

impl Issue {
    pub fn status(&self) -> IssueStatus {
        if self.closure.is_some() {
            IssueStatus::Closed
        } else {
            IssueStatus::Open
        }
    }

    /// Sort key for the ready queue: bumped issues first, then priority, then slug.
    pub fn ready_key(&self) -> (u8, u32, String) {
        (
            if self.priority_override { 0 } else { 1 },
            self.priority,
            self.slug.clone(),
        )
    }
}

/// Outcome declared by the planner in its result file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanningOutcome {
    Completed,
    CreatedIssues,
    NoWorkFound,
}

impl PlanningOutcome {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "completed" => Some(PlanningOutcome::Completed),
            "created_issues" => Some(PlanningOutcome::CreatedIssues),
            "no_work_found" => Some(PlanningOutcome::NoWorkFound),
            _ => None,
        }
    }
}
