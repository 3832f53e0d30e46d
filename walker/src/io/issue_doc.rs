//! Load/store helpers for per-issue documents: `issue.md` and close metadata.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};

use crate::core::slug::derive_kind;
use crate::core::types::{CloseSignal, Closure};
use crate::io::frontmatter::{parse_document, render_document};

/// Parsed `issue.md`: header fields plus the body.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueDoc {
    pub title: String,
    pub kind: String,
    pub priority: u32,
    pub body: String,
}

/// Load and parse `issue.md`, deriving the type from title/slug when absent.
pub fn load_issue_doc(path: &Path, slug: &str) -> Result<IssueDoc> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let (pairs, body) = parse_document(&contents);

    let title = pairs.get("title").cloned().unwrap_or_default();
    let kind = derive_kind(pairs.get("type").map(String::as_str), &title, slug);
    let priority = match pairs.get("priority") {
        Some(raw) => raw
            .parse::<u32>()
            .with_context(|| format!("parse priority '{raw}' in {}", path.display()))?,
        None => 1,
    };

    Ok(IssueDoc {
        title,
        kind,
        priority,
        body,
    })
}

/// Render and write `issue.md`.
pub fn store_issue_doc(path: &Path, doc: &IssueDoc) -> Result<()> {
    let pairs = vec![
        ("title".to_string(), doc.title.clone()),
        ("type".to_string(), doc.kind.clone()),
        ("priority".to_string(), doc.priority.to_string()),
    ];
    let rendered = render_document(&pairs, &doc.body);
    fs::write(path, rendered).with_context(|| format!("write {}", path.display()))
}

/// Canonical close metadata written by the store on close (`close.meta`).
///
/// Plain `key: value` lines, no fence: the file stays greppable and the
/// worker-written variant (status/reason/signal only) parses with the same
/// code path.
pub fn render_close_meta(closure: &Closure) -> String {
    format!(
        "reason: {}\nsignal: {}\nepoch: {}\nclosed_at: {}\n",
        closure.reason.replace('\n', " "),
        closure.signal.as_str(),
        closure.epoch,
        closure.closed_at.to_rfc3339(),
    )
}

/// Parse canonical close metadata.
pub fn parse_close_meta(contents: &str) -> Result<Closure> {
    let pairs = crate::io::frontmatter::parse_pairs(contents);
    let reason = pairs
        .get("reason")
        .cloned()
        .ok_or_else(|| anyhow!("close meta missing reason"))?;
    let signal = pairs
        .get("signal")
        .and_then(|s| CloseSignal::parse(s))
        .unwrap_or_default();
    let epoch = pairs
        .get("epoch")
        .ok_or_else(|| anyhow!("close meta missing epoch"))?
        .parse::<u64>()
        .context("parse close meta epoch")?;
    let closed_at = pairs
        .get("closed_at")
        .ok_or_else(|| anyhow!("close meta missing closed_at"))?;
    let closed_at = DateTime::parse_from_rfc3339(closed_at)
        .context("parse close meta closed_at")?
        .with_timezone(&Utc);
    Ok(Closure {
        reason,
        signal,
        epoch,
        closed_at,
    })
}

/// Worker-written close request (`close.meta` before the move, or alongside
/// a `result` file): only `reason`/`signal` are meaningful, both optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloseRequest {
    pub reason: Option<String>,
    pub signal: Option<CloseSignal>,
}

pub fn parse_close_request(contents: &str) -> CloseRequest {
    let pairs = crate::io::frontmatter::parse_pairs(contents);
    CloseRequest {
        reason: pairs.get("reason").cloned().filter(|s| !s.is_empty()),
        signal: pairs.get("signal").and_then(|s| CloseSignal::parse(s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_doc_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("issue.md");
        let doc = IssueDoc {
            title: "probe: cache miss rate".to_string(),
            kind: "probe".to_string(),
            priority: 2,
            body: "Measure the miss rate under load.\n".to_string(),
        };

        store_issue_doc(&path, &doc).expect("store");
        let loaded = load_issue_doc(&path, "probe-cache").expect("load");
        assert_eq!(loaded, doc);
    }

    #[test]
    fn kind_is_derived_when_absent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("issue.md");
        fs::write(&path, "---\ntitle: fix: flaky test\npriority: 1\n---\n\nBody.\n")
            .expect("write");

        let loaded = load_issue_doc(&path, "fix-flaky").expect("load");
        assert_eq!(loaded.kind, "fix");
    }

    #[test]
    fn close_meta_round_trips() {
        let closure = Closure {
            reason: "Done.".to_string(),
            signal: CloseSignal::Surprising,
            epoch: 3,
            closed_at: "2026-08-01T10:00:00Z".parse().expect("ts"),
        };
        let rendered = render_close_meta(&closure);
        let parsed = parse_close_meta(&rendered).expect("parse");
        assert_eq!(parsed, closure);
    }

    #[test]
    fn close_request_tolerates_partial_fields() {
        let req = parse_close_request("signal: pivotal\n");
        assert_eq!(req.reason, None);
        assert_eq!(req.signal, Some(CloseSignal::Pivotal));

        let req = parse_close_request("status: done\nreason: Found the root cause\n");
        assert_eq!(req.reason.as_deref(), Some("Found the root cause"));
        assert_eq!(req.signal, None);
    }
}
