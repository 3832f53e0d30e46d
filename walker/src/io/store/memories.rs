//! Memories and proposals: epoch-scoped facts propagated into prompts.
//!
//! Both files are JSON arrays mutated read-modify-write under the walk lock.
//! Reads for prompt assembly are lenient (a corrupt file is logged and
//! treated as empty); mutations parse strictly so a corrupt file is never
//! silently clobbered.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A key/text fact alive over an epoch interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub key: String,
    pub text: String,
    pub alive_from: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alive_until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub killed_by: Option<String>,
}

impl Memory {
    /// Alive at `epoch` iff `alive_from ≤ epoch ≤ alive_until` (open-ended
    /// when `alive_until` is unset).
    pub fn alive_at(&self, epoch: u64) -> bool {
        self.alive_from <= epoch && self.alive_until.is_none_or(|until| epoch <= until)
    }
}

/// A memory candidate awaiting the planner's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub key: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_by: Option<String>,
    pub epoch: u64,
}

/// Lenient load for prompt assembly and reporting.
pub fn load_memories(path: &Path) -> Vec<Memory> {
    load_lenient(path, "memories")
}

/// Lenient load for prompt assembly and reporting.
pub fn load_proposals(path: &Path) -> Vec<Proposal> {
    load_lenient(path, "proposals")
}

/// Strict load for read-modify-write mutations.
pub fn read_memories_strict(path: &Path) -> Result<Vec<Memory>> {
    read_strict(path)
}

/// Strict load for read-modify-write mutations.
pub fn read_proposals_strict(path: &Path) -> Result<Vec<Proposal>> {
    read_strict(path)
}

pub fn save_memories(path: &Path, memories: &[Memory]) -> Result<()> {
    save(path, memories)
}

pub fn save_proposals(path: &Path, proposals: &[Proposal]) -> Result<()> {
    save(path, proposals)
}

fn load_lenient<T: serde::de::DeserializeOwned>(path: &Path, label: &str) -> Vec<T> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable {label} file, treating as empty");
            return Vec::new();
        }
    };
    match serde_json::from_str(&contents) {
        Ok(values) => values,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "malformed {label} file, treating as empty");
            Vec::new()
        }
    }
}

fn read_strict<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn save<T: Serialize>(path: &Path, values: &[T]) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(values).context("serialize json")?;
    buf.push('\n');
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, buf).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))
}
