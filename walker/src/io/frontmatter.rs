//! YAML-ish frontmatter helpers shared by `_walk.md`, `issue.md` and close metadata.
//!
//! We deliberately hand-parse flat `key: value` lines instead of pulling in a
//! YAML implementation: the files are written by this tool and by LLM workers,
//! and the lenient single-level format survives both. Unknown keys are
//! preserved for humans but ignored by the loaders.

use std::collections::BTreeMap;

/// Split a document into (frontmatter, body). Returns `None` when the document
/// does not start with a `---` fence.
pub fn split_frontmatter(contents: &str) -> Option<(&str, &str)> {
    let after = contents.strip_prefix("---\n")?;
    let end = after.find("\n---\n")?;
    Some((&after[..end], &after[end + 5..]))
}

/// Parse flat `key: value` lines, skipping blanks, comments and malformed lines.
///
/// Values may be single- or double-quoted; quotes are stripped. Later
/// occurrences of a key win.
pub fn parse_pairs(frontmatter: &str) -> BTreeMap<String, String> {
    let mut pairs = BTreeMap::new();
    for line in frontmatter.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        pairs.insert(key.trim().to_string(), unquote(value.trim()));
    }
    pairs
}

/// Parse a whole document into (pairs, body). Documents without a frontmatter
/// fence yield empty pairs and the full contents as body.
pub fn parse_document(contents: &str) -> (BTreeMap<String, String>, String) {
    match split_frontmatter(contents) {
        Some((frontmatter, body)) => (
            parse_pairs(frontmatter),
            body.trim_start_matches('\n').to_string(),
        ),
        None => (BTreeMap::new(), contents.to_string()),
    }
}

/// Render `key: value` pairs plus a body into a fenced document.
///
/// Keys render in the order given (not sorted) so the files stay stable and
/// diff-friendly across rewrites.
pub fn render_document(pairs: &[(String, String)], body: &str) -> String {
    let mut buf = String::new();
    buf.push_str("---\n");
    for (key, value) in pairs {
        buf.push_str(&format!("{key}: {value}\n"));
    }
    buf.push_str("---\n");
    let body = body.trim_start_matches('\n');
    if !body.is_empty() {
        buf.push('\n');
        buf.push_str(body);
    }
    if !buf.ends_with('\n') {
        buf.push('\n');
    }
    buf
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}
