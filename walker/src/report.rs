//! Markdown renderers over store snapshots: status, history, and the
//! terminal summary written on finalize.

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::core::types::{CloseSignal, Issue, IssueStatus};
use crate::io::store::WalkStore;
use crate::io::walk_meta::WalkDoc;

/// One-screen walk status: header, epoch, counts, ready queue.
pub fn render_status(store: &WalkStore, walk: &WalkDoc) -> Result<String> {
    let open = store.open_issues()?;
    let closed = store.closed_issues()?;
    let ready = store.ready_issues()?;
    let epoch = store.current_epoch()?.unwrap_or(1);

    let mut buf = String::new();
    buf.push_str(&format!("# {}\n\n", walk.title));
    buf.push_str(&format!("status: {}\n", walk.status.as_str()));
    if let Some(reason) = &walk.finish_reason {
        buf.push_str(&format!("finish reason: {reason}\n"));
    }
    buf.push_str(&format!("epoch: {epoch}\n"));
    buf.push_str(&format!(
        "issues: {} open ({} ready), {} closed\n",
        open.len(),
        ready.len(),
        closed.len()
    ));

    if !ready.is_empty() {
        buf.push_str("\n## Ready\n\n");
        for issue in &ready {
            buf.push_str(&render_issue_line(issue));
        }
    }
    Ok(buf)
}

/// Closure history grouped by epoch, newest epoch first.
pub fn render_history(store: &WalkStore) -> Result<String> {
    let groups = store.recent_closed(u64::MAX)?;

    let mut buf = String::from("# History\n");
    if groups.is_empty() {
        buf.push_str("\nNo issues closed yet.\n");
        return Ok(buf);
    }
    for group in groups {
        buf.push_str(&format!("\n## Epoch {}\n\n", group.epoch));
        for entry in group.entries {
            let signal = match entry.signal {
                CloseSignal::Routine => String::new(),
                other => format!(" [{}]", other.as_str()),
            };
            buf.push_str(&format!(
                "- {} {}{signal}: {}\n",
                format_time(entry.closed_at),
                entry.slug,
                entry.reason
            ));
        }
    }
    Ok(buf)
}

/// Terminal summary written to `summary.md` on finalize: header, totals,
/// timeline, remaining open issues.
pub fn render_summary(store: &WalkStore, walk: &WalkDoc) -> Result<String> {
    let open = store.list(IssueStatus::Open)?;
    let closed = store.list(IssueStatus::Closed)?;

    let mut cost_usd = 0.0f64;
    let mut run_count = 0usize;
    for issue in open.iter().chain(&closed) {
        for run in store.runs(&issue.slug)? {
            run_count += 1;
            cost_usd += run.meta.cost_usd.unwrap_or(0.0);
        }
    }

    let mut buf = String::new();
    buf.push_str(&format!("# {} (summary)\n\n", walk.title));
    buf.push_str(&format!("status: {}\n", walk.status.as_str()));
    if let Some(reason) = &walk.finish_reason {
        buf.push_str(&format!("finish reason: {reason}\n"));
    }
    if let Some(finished_at) = walk.finished_at {
        buf.push_str(&format!("finished at: {}\n", format_time(finished_at)));
    }
    buf.push_str(&format!(
        "totals: {} closed, {} open, {} runs, ${:.2}\n",
        closed.len(),
        open.len(),
        run_count,
        cost_usd
    ));

    buf.push_str("\n## Timeline\n\n");
    if closed.is_empty() {
        buf.push_str("No issues were closed.\n");
    }
    for issue in &closed {
        if let Some(closure) = &issue.closure {
            let signal = match closure.signal {
                CloseSignal::Routine => String::new(),
                other => format!(" [{}]", other.as_str()),
            };
            buf.push_str(&format!(
                "- {} e{} {}{signal}: {}\n",
                format_time(closure.closed_at),
                closure.epoch,
                issue.slug,
                closure.reason
            ));
        }
    }

    if !open.is_empty() {
        buf.push_str("\n## Still open\n\n");
        for issue in &open {
            buf.push_str(&render_issue_line(issue));
        }
    }
    Ok(buf)
}

fn render_issue_line(issue: &Issue) -> String {
    let bump = if issue.priority_override { " *" } else { "" };
    format!(
        "- {} (p{}{bump}): {}\n",
        issue.slug, issue.priority, issue.title
    )
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}
