//! Digest extraction from a worker's streaming JSON log.
//!
//! The worker CLI emits one JSON event per line. We aggregate tool usage,
//! touched files and state-changing CLI calls, and lift the terminal `result`
//! event into run metadata. Malformed lines are tolerated: a truncated or
//! interleaved log must never fail the run bookkeeping.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::core::types::TokenUsage;

/// Commands that mutate walk state when invoked from a worker shell.
static MUTATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bwalker\s+(create|close|comment|bump|propose|forget|accept|discard)\b")
        .expect("mutation pattern is valid")
});

const RESULT_TEXT_LIMIT: usize = 500;

/// Structured summary of one streaming worker run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunDigest {
    /// Tool-use counts keyed by tool name.
    pub tool_counts: BTreeMap<String, u64>,
    /// Files touched via Write/Edit tool invocations.
    pub files_modified: BTreeSet<String>,
    /// Shell commands matching the state-changing CLI pattern.
    pub mutation_commands: Vec<String>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u64>,
    /// Terminal result text, truncated to its first 500 characters.
    pub result_text: Option<String>,
    pub cost_usd: Option<f64>,
    pub token_usage: Option<TokenUsage>,
    /// Success per the terminal event, when one was seen.
    pub reported_success: Option<bool>,
}

impl RunDigest {
    pub fn tool_calls(&self) -> u64 {
        self.tool_counts.values().sum()
    }

    /// `"success"` iff the terminal event reported success; otherwise derived
    /// from the exit code.
    pub fn status(&self, exit_code: Option<i32>) -> &'static str {
        let ok = match self.reported_success {
            Some(ok) => ok,
            None => exit_code == Some(0),
        };
        if ok { "success" } else { "failure" }
    }
}

/// Parse a streaming log, one JSON event per line.
pub fn digest_stream(log: &str) -> RunDigest {
    let mut digest = RunDigest::default();
    for line in log.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        match event.get("type").and_then(Value::as_str) {
            Some("assistant") => absorb_assistant(&mut digest, &event),
            Some("result") => absorb_result(&mut digest, &event),
            _ => {}
        }
    }
    digest
}

fn absorb_assistant(digest: &mut RunDigest, event: &Value) {
    let Some(content) = event
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
    else {
        return;
    };
    for block in content {
        if block.get("type").and_then(Value::as_str) != Some("tool_use") {
            continue;
        }
        let Some(name) = block.get("name").and_then(Value::as_str) else {
            continue;
        };
        *digest.tool_counts.entry(name.to_string()).or_insert(0) += 1;

        let input = block.get("input");
        if matches!(name, "Write" | "Edit")
            && let Some(path) = input
                .and_then(|i| i.get("file_path"))
                .and_then(Value::as_str)
        {
            digest.files_modified.insert(path.to_string());
        }
        if let Some(command) = input
            .and_then(|i| i.get("command"))
            .and_then(Value::as_str)
            && MUTATION_RE.is_match(command)
        {
            digest.mutation_commands.push(command.to_string());
        }
    }
}

fn absorb_result(digest: &mut RunDigest, event: &Value) {
    digest.reported_success =
        Some(event.get("subtype").and_then(Value::as_str) == Some("success"));
    digest.duration_ms = event.get("duration_ms").and_then(Value::as_u64);
    digest.num_turns = event.get("num_turns").and_then(Value::as_u64);
    digest.cost_usd = event.get("total_cost_usd").and_then(Value::as_f64);
    digest.result_text = event
        .get("result")
        .and_then(Value::as_str)
        .map(truncate_chars);
    digest.token_usage = event.get("usage").map(|usage| TokenUsage {
        input_tokens: usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: usage
            .get("output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        cache_creation_input_tokens: usage
            .get("cache_creation_input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        cache_read_input_tokens: usage
            .get("cache_read_input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    });
}

fn truncate_chars(text: &str) -> String {
    if text.chars().count() <= RESULT_TEXT_LIMIT {
        return text.to_string();
    }
    text.chars().take(RESULT_TEXT_LIMIT).collect()
}
