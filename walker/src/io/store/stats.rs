//! Aggregations over closed issues: new-context accounting, expansion
//! statistics, and the recently-closed window the planner prompt is built
//! from.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::core::expansion::{ExpansionAggregate, ExpansionSample, aggregate};
use crate::core::types::{CloseSignal, Issue};
use crate::core::threshold::NewContext;
use crate::io::paths::IssuePaths;

use super::WalkStore;

/// Per-type expansion aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct KindExpansion {
    pub kind: String,
    pub aggregate: ExpansionAggregate,
}

/// Expansion statistics for the whole walk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpansionStats {
    /// Per-type aggregates, sorted by type name.
    pub per_kind: Vec<KindExpansion>,
    /// Aggregate over every sampled closure; `None` when nothing qualifies.
    pub overall: Option<ExpansionAggregate>,
}

/// One closed issue in the recently-closed window.
#[derive(Debug, Clone, PartialEq)]
pub struct RecentEntry {
    pub slug: String,
    pub title: String,
    pub signal: CloseSignal,
    pub reason: String,
    pub closed_at: DateTime<Utc>,
    /// Discovery parents, for the table's parent annotation.
    pub parents: Vec<String>,
    /// body + result + comments bytes.
    pub bytes: u64,
}

/// Recently-closed entries grouped by epoch, newest epoch first.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochGroup {
    pub epoch: u64,
    pub entries: Vec<RecentEntry>,
}

impl WalkStore {
    /// Closed-issue context accumulated since `since`.
    ///
    /// Bytes count the result file plus the comment log: the material a
    /// planner would have to absorb. Non-routine signals are surfaced so the
    /// driver can plan pre-emptively.
    pub fn new_context_since(&self, since: DateTime<Utc>) -> Result<NewContext> {
        let mut closed: Vec<Issue> = self
            .closed_issues()?
            .into_iter()
            .filter(|issue| {
                issue
                    .closure
                    .as_ref()
                    .is_some_and(|c| c.closed_at > since)
            })
            .collect();
        closed.sort_by_key(|issue| issue.closure.as_ref().map(|c| c.closed_at));

        let mut context = NewContext::default();
        for issue in closed {
            let dir = self.paths().closed_issue_dir(&issue.slug);
            let issue_paths = IssuePaths::new(&dir);
            context.bytes +=
                file_bytes(&issue_paths.result_path) + file_bytes(&issue_paths.comments_path);
            if let Some(closure) = &issue.closure
                && closure.signal != CloseSignal::Routine
            {
                context.signals.push(closure.signal);
            }
            context.issues.push(issue.slug);
        }
        Ok(context)
    }

    /// Expansion ratios per type and overall. Issues with empty bodies are
    /// excluded (no meaningful denominator).
    pub fn expansion_stats(&self) -> Result<ExpansionStats> {
        let mut per_kind: BTreeMap<String, Vec<ExpansionSample>> = BTreeMap::new();
        let mut all = Vec::new();

        for issue in self.closed_issues()? {
            let body_bytes = issue.body.len() as u64;
            if body_bytes == 0 {
                continue;
            }
            let dir = self.paths().closed_issue_dir(&issue.slug);
            let issue_paths = IssuePaths::new(&dir);
            let sample = ExpansionSample {
                body_bytes,
                closed_bytes: file_bytes(&issue_paths.result_path)
                    + file_bytes(&issue_paths.comments_path),
            };
            per_kind.entry(issue.kind).or_default().push(sample);
            all.push(sample);
        }

        Ok(ExpansionStats {
            per_kind: per_kind
                .into_iter()
                .filter_map(|(kind, samples)| {
                    aggregate(&samples).map(|aggregate| KindExpansion { kind, aggregate })
                })
                .collect(),
            overall: aggregate(&all),
        })
    }

    /// Walk closed issues newest-first, accumulating until the cumulative
    /// byte count reaches `min_bytes`; return the window grouped by epoch.
    pub fn recent_closed(&self, min_bytes: u64) -> Result<Vec<EpochGroup>> {
        let min = DateTime::<Utc>::MIN_UTC;
        let mut closed = self.closed_issues()?;
        closed.sort_by(|a, b| {
            let ka = a
                .closure
                .as_ref()
                .map(|c| (c.closed_at, c.epoch))
                .unwrap_or((min, 0));
            let kb = b
                .closure
                .as_ref()
                .map(|c| (c.closed_at, c.epoch))
                .unwrap_or((min, 0));
            kb.cmp(&ka)
        });

        let mut cumulative = 0u64;
        let mut groups: BTreeMap<u64, Vec<RecentEntry>> = BTreeMap::new();
        for issue in closed {
            let Some(closure) = issue.closure.clone() else {
                continue;
            };
            let dir = self.paths().closed_issue_dir(&issue.slug);
            let issue_paths = IssuePaths::new(&dir);
            let bytes = issue.body.len() as u64
                + file_bytes(&issue_paths.result_path)
                + file_bytes(&issue_paths.comments_path);

            groups.entry(closure.epoch).or_default().push(RecentEntry {
                slug: issue.slug,
                title: issue.title,
                signal: closure.signal,
                reason: closure.reason,
                closed_at: closure.closed_at,
                parents: issue.derived_from,
                bytes,
            });

            cumulative += bytes;
            if cumulative >= min_bytes {
                break;
            }
        }

        Ok(groups
            .into_iter()
            .rev()
            .map(|(epoch, entries)| EpochGroup { epoch, entries })
            .collect())
    }
}

fn file_bytes(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
