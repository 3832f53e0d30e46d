//! Run-record storage under each issue's `runs/` directory.
//!
//! One directory per worker invocation, named by UTC start timestamp
//! (`20260801-101500`, disambiguated `-1`, `-2`, … on collision), holding
//! `prompt`, `output` and a JSON `meta` document.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::core::types::{RunMeta, RunRecord};

const RUN_DIR_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Create a fresh run directory for a worker starting at `started_at`.
///
/// Collides only when two runs on one issue start within the same second;
/// the suffix keeps directory names unique without widening the timestamp.
pub fn create_run_dir(runs_dir: &Path, started_at: DateTime<Utc>) -> Result<PathBuf> {
    fs::create_dir_all(runs_dir)
        .with_context(|| format!("create runs dir {}", runs_dir.display()))?;
    let base = started_at.format(RUN_DIR_FORMAT).to_string();

    for suffix in 0..=999u32 {
        let name = if suffix == 0 {
            base.clone()
        } else {
            format!("{base}-{suffix}")
        };
        let dir = runs_dir.join(&name);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("create run dir {}", dir.display()));
            }
        }
    }
    Err(anyhow!(
        "unable to create unique run dir under {}",
        runs_dir.display()
    ))
}

/// Write the run's prompt copy.
pub fn write_prompt(run_dir: &Path, prompt: &str) -> Result<()> {
    let path = run_dir.join("prompt");
    fs::write(&path, prompt).with_context(|| format!("write {}", path.display()))
}

/// Write the run's JSON metadata.
pub fn write_meta(run_dir: &Path, meta: &RunMeta) -> Result<()> {
    let path = run_dir.join("meta");
    let mut buf = serde_json::to_string_pretty(meta).context("serialize run meta")?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write {}", path.display()))
}

/// Write captured output text (capture mode).
pub fn write_output(run_dir: &Path, name: &str, contents: &str) -> Result<()> {
    let path = run_dir.join(name);
    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
}

/// List run records ordered by start time (directory name order).
///
/// Runs with missing or corrupt `meta` are logged and skipped; a single bad
/// record never aborts an aggregation.
pub fn list_runs(runs_dir: &Path) -> Result<Vec<RunRecord>> {
    let mut records = Vec::new();
    let entries = match fs::read_dir(runs_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(records),
        Err(err) => {
            return Err(err).with_context(|| format!("read runs dir {}", runs_dir.display()));
        }
    };

    let mut names: Vec<String> = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();

    for name in names {
        let meta_path = runs_dir.join(&name).join("meta");
        let contents = match fs::read_to_string(&meta_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => {
                warn!(path = %meta_path.display(), error = %err, "unreadable run meta, skipping");
                continue;
            }
        };
        match serde_json::from_str::<RunMeta>(&contents) {
            Ok(meta) => records.push(RunRecord { id: name, meta }),
            Err(err) => {
                warn!(path = %meta_path.display(), error = %err, "malformed run meta, skipping");
            }
        }
    }
    Ok(records)
}
