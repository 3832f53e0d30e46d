//! Load/store helpers for `_walk.md`, the walk's metadata document.
//!
//! The document carries YAML-ish frontmatter (title, status, finish fields,
//! driver tunables) followed by the investigation goals as free markdown.
//! Humans edit this file; missing tunables fall back to defaults and the
//! rewrite path preserves the body byte-for-byte.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};

use crate::core::types::WalkStatus;
use crate::io::frontmatter::{parse_document, render_document};

/// Driver tunables stored as flat frontmatter keys in `_walk.md`.
#[derive(Debug, Clone, PartialEq)]
pub struct WalkConfig {
    /// Worker processes to run in parallel (1 = sequential loop).
    pub max_concurrent: usize,
    /// Pause between driver iterations, in seconds.
    pub sleep_secs: u64,
    /// Trailing failures after which retry policy blocks an issue.
    pub max_failures: u32,
    /// Consecutive empty planning rounds before the walk stalls.
    pub max_planning_rounds: u32,
    /// Byte budget for the planner prompt's recently-closed table.
    pub planning_context_bytes: u64,
    /// Byte budget for assembled prompts before sections are dropped.
    pub prompt_budget_bytes: usize,
    /// Worker CLI argv (whitespace-split).
    pub worker_command: Vec<String>,
    /// `stream` (JSONL events on stdout) or `capture` (plain output).
    pub worker_mode: WorkerMode,
    /// Capture-mode turn budget, before the extended-type multiplier.
    pub capture_max_turns: u32,
    /// Issue types whose capture turn budget is multiplied (verification-heavy).
    pub extended_turn_kinds: Vec<String>,
    /// Bounded wait for in-flight workers on shutdown (concurrent mode).
    pub drain_timeout_secs: u64,
    /// Maintain `runs/<slug>` symlinks to live stream logs.
    pub live_log_links: bool,
    /// Optional parent walk directory; a terminal parent stops this walk.
    pub parent: Option<PathBuf>,
}

/// Worker spawn mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    Stream,
    Capture,
}

impl WorkerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerMode::Stream => "stream",
            WorkerMode::Capture => "capture",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "stream" => Some(WorkerMode::Stream),
            "capture" => Some(WorkerMode::Capture),
            _ => None,
        }
    }
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            sleep_secs: 2,
            max_failures: 3,
            max_planning_rounds: 3,
            planning_context_bytes: 20_000,
            prompt_budget_bytes: 40_000,
            worker_command: vec!["claude".to_string(), "-p".to_string()],
            worker_mode: WorkerMode::Stream,
            capture_max_turns: 30,
            extended_turn_kinds: vec!["fix".to_string(), "ablation".to_string()],
            drain_timeout_secs: 30,
            live_log_links: true,
            parent: None,
        }
    }
}

impl WalkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(anyhow!("max_concurrent must be > 0"));
        }
        if self.max_failures == 0 {
            return Err(anyhow!("max_failures must be > 0"));
        }
        if self.worker_command.is_empty() || self.worker_command[0].trim().is_empty() {
            return Err(anyhow!("worker_command must be a non-empty command line"));
        }
        Ok(())
    }
}

/// The walk metadata document: header fields, tunables, and the goals body.
#[derive(Debug, Clone, PartialEq)]
pub struct WalkDoc {
    pub title: String,
    pub status: WalkStatus,
    pub finished_at: Option<DateTime<Utc>>,
    pub finish_reason: Option<String>,
    pub config: WalkConfig,
    /// Investigation goals, free markdown.
    pub body: String,
}

impl WalkDoc {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            status: WalkStatus::Open,
            finished_at: None,
            finish_reason: None,
            config: WalkConfig::default(),
            body: body.into(),
        }
    }
}

/// Load `_walk.md`.
pub fn load_walk(path: &Path) -> Result<WalkDoc> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let (pairs, body) = parse_document(&contents);

    let title = pairs.get("title").cloned().unwrap_or_default();
    let status = pairs
        .get("status")
        .and_then(|s| WalkStatus::parse(s))
        .unwrap_or(WalkStatus::Open);
    let finished_at = pairs
        .get("finished_at")
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let finish_reason = pairs.get("finish_reason").cloned().filter(|s| !s.is_empty());

    let config = config_from_pairs(&pairs)?;
    config.validate()?;

    Ok(WalkDoc {
        title,
        status,
        finished_at,
        finish_reason,
        config,
        body,
    })
}

/// Write `_walk.md`, preserving the goals body.
pub fn store_walk(path: &Path, doc: &WalkDoc) -> Result<()> {
    doc.config.validate()?;
    let mut pairs: Vec<(String, String)> = vec![
        ("title".to_string(), doc.title.clone()),
        ("status".to_string(), doc.status.as_str().to_string()),
    ];
    if let Some(finished_at) = doc.finished_at {
        pairs.push(("finished_at".to_string(), finished_at.to_rfc3339()));
    }
    if let Some(reason) = &doc.finish_reason {
        pairs.push(("finish_reason".to_string(), reason.clone()));
    }
    push_config_pairs(&mut pairs, &doc.config);

    let rendered = render_document(&pairs, &doc.body);
    write_atomic(path, &rendered)
}

fn config_from_pairs(pairs: &BTreeMap<String, String>) -> Result<WalkConfig> {
    let defaults = WalkConfig::default();
    let parse_num = |key: &str| -> Result<Option<u64>> {
        match pairs.get(key) {
            Some(raw) => {
                let value = raw
                    .parse::<u64>()
                    .with_context(|| format!("parse {key}: '{raw}'"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    };

    Ok(WalkConfig {
        max_concurrent: parse_num("max_concurrent")?
            .map(|v| v as usize)
            .unwrap_or(defaults.max_concurrent),
        sleep_secs: parse_num("sleep_secs")?.unwrap_or(defaults.sleep_secs),
        max_failures: parse_num("max_failures")?
            .map(|v| v as u32)
            .unwrap_or(defaults.max_failures),
        max_planning_rounds: parse_num("max_planning_rounds")?
            .map(|v| v as u32)
            .unwrap_or(defaults.max_planning_rounds),
        planning_context_bytes: parse_num("planning_context_bytes")?
            .unwrap_or(defaults.planning_context_bytes),
        prompt_budget_bytes: parse_num("prompt_budget_bytes")?
            .map(|v| v as usize)
            .unwrap_or(defaults.prompt_budget_bytes),
        worker_command: pairs
            .get("worker_command")
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or(defaults.worker_command),
        worker_mode: pairs
            .get("worker_mode")
            .and_then(|s| WorkerMode::parse(s))
            .unwrap_or(defaults.worker_mode),
        capture_max_turns: parse_num("capture_max_turns")?
            .map(|v| v as u32)
            .unwrap_or(defaults.capture_max_turns),
        extended_turn_kinds: pairs
            .get("extended_turn_kinds")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or(defaults.extended_turn_kinds),
        drain_timeout_secs: parse_num("drain_timeout_secs")?.unwrap_or(defaults.drain_timeout_secs),
        live_log_links: pairs
            .get("live_log_links")
            .map(|s| s.trim() == "true")
            .unwrap_or(defaults.live_log_links),
        parent: pairs
            .get("parent")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from),
    })
}

fn push_config_pairs(pairs: &mut Vec<(String, String)>, config: &WalkConfig) {
    pairs.push((
        "max_concurrent".to_string(),
        config.max_concurrent.to_string(),
    ));
    pairs.push(("sleep_secs".to_string(), config.sleep_secs.to_string()));
    pairs.push(("max_failures".to_string(), config.max_failures.to_string()));
    pairs.push((
        "max_planning_rounds".to_string(),
        config.max_planning_rounds.to_string(),
    ));
    pairs.push((
        "planning_context_bytes".to_string(),
        config.planning_context_bytes.to_string(),
    ));
    pairs.push((
        "prompt_budget_bytes".to_string(),
        config.prompt_budget_bytes.to_string(),
    ));
    pairs.push((
        "worker_command".to_string(),
        config.worker_command.join(" "),
    ));
    pairs.push((
        "worker_mode".to_string(),
        config.worker_mode.as_str().to_string(),
    ));
    pairs.push((
        "capture_max_turns".to_string(),
        config.capture_max_turns.to_string(),
    ));
    pairs.push((
        "extended_turn_kinds".to_string(),
        config.extended_turn_kinds.join(", "),
    ));
    pairs.push((
        "drain_timeout_secs".to_string(),
        config.drain_timeout_secs.to_string(),
    ));
    pairs.push((
        "live_log_links".to_string(),
        config.live_log_links.to_string(),
    ));
    if let Some(parent) = &config.parent {
        pairs.push(("parent".to_string(), parent.display().to_string()));
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("walk doc path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("md.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp walk doc {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace walk doc {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("_walk.md");

        let mut doc = WalkDoc::new("Cache latency walk", "Find the tail latency source.\n");
        doc.config.max_concurrent = 3;
        doc.config.worker_command = vec!["mock".to_string(), "--fast".to_string()];

        store_walk(&path, &doc).expect("store");
        let loaded = load_walk(&path).expect("load");
        assert_eq!(loaded, doc);
    }

    #[test]
    fn missing_tunables_fall_back_to_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("_walk.md");
        fs::write(&path, "---\ntitle: Minimal\nstatus: open\n---\n\nGoals.\n").expect("write");

        let loaded = load_walk(&path).expect("load");
        assert_eq!(loaded.title, "Minimal");
        assert_eq!(loaded.config, WalkConfig::default());
        assert_eq!(loaded.body, "Goals.\n");
    }

    #[test]
    fn finish_fields_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("_walk.md");

        let mut doc = WalkDoc::new("Done walk", "Goals.\n");
        doc.status = WalkStatus::Completed;
        doc.finished_at = Some("2026-08-01T10:00:00Z".parse().expect("ts"));
        doc.finish_reason = Some("Goal met".to_string());

        store_walk(&path, &doc).expect("store");
        let loaded = load_walk(&path).expect("load");
        assert_eq!(loaded.status, WalkStatus::Completed);
        assert_eq!(loaded.finish_reason.as_deref(), Some("Goal met"));
        assert_eq!(loaded.finished_at, doc.finished_at);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("_walk.md");
        fs::write(&path, "---\ntitle: Bad\nmax_concurrent: 0\n---\n").expect("write");

        let err = load_walk(&path).expect_err("load should fail");
        assert!(err.to_string().contains("max_concurrent"));
    }
}
