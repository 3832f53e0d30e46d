//! Deterministic prompt assembly for worker and planner invocations.
//!
//! Each prompt is a set of named template blocks rendered individually into
//! typed sections, then composed under a byte budget: optional sections are
//! shed in a fixed order, and a still-oversized prompt is clipped at its
//! tail. Everything is a pure function of a store snapshot; the same
//! snapshot always yields byte-identical output.

use std::fs;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::types::{CloseSignal, Issue};
use crate::io::store::WalkStore;
use crate::io::walk_meta::{WalkConfig, WalkDoc};

const WORKER_TEMPLATE: &str = include_str!("prompts/worker.md");
const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");

/// Issue context for template rendering.
#[derive(Debug, Clone, Serialize)]
pub struct IssueContext {
    pub slug: String,
    pub kind: String,
    pub title: String,
    pub body: String,
}

impl IssueContext {
    fn from_issue(issue: &Issue) -> Self {
        Self {
            slug: issue.slug.clone(),
            kind: issue.kind.clone(),
            title: issue.title.clone(),
            body: issue.body.trim().to_string(),
        }
    }
}

/// Snapshot backing one worker prompt.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerPromptInputs {
    pub walk_dir: String,
    pub context_file: Option<String>,
    pub context_body: Option<String>,
    pub walk_title: String,
    pub walk_goals: String,
    pub issue: IssueContext,
    pub self_modification: bool,
}

impl WorkerPromptInputs {
    /// Assemble the snapshot for one issue.
    ///
    /// The parent context is always the walk's goals, never a parent issue's
    /// content; workers opt into parent material through the discovery link.
    pub fn gather(store: &WalkStore, walk: &WalkDoc, issue: &Issue) -> Result<Self> {
        let context_body = match fs::read_to_string(&store.paths().context_path) {
            Ok(contents) => Some(contents.trim().to_string()).filter(|s| !s.is_empty()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("read {}", store.paths().context_path.display())
                });
            }
        };
        Ok(Self {
            walk_dir: store.paths().walk_dir.display().to_string(),
            context_file: context_body
                .is_some()
                .then(|| store.paths().context_path.display().to_string()),
            context_body,
            walk_title: walk.title.clone(),
            walk_goals: walk.body.trim().to_string(),
            issue: IssueContext::from_issue(issue),
            self_modification: walk.config.extended_turn_kinds.contains(&issue.kind),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentEntryContext {
    pub slug: String,
    pub parent: Option<String>,
    pub title: String,
    /// Empty for routine closures so the table column stays quiet.
    pub signal: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentGroupContext {
    pub epoch: u64,
    pub entries: Vec<RecentEntryContext>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenIssueContext {
    pub slug: String,
    pub title: String,
    pub priority: u32,
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryContext {
    pub key: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProposalContext {
    pub key: String,
    pub text: String,
    pub proposed_by: String,
    pub epoch: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpansionRowContext {
    pub kind: String,
    pub count: usize,
    pub median: String,
    pub p75: String,
}

/// Snapshot backing one planner prompt.
#[derive(Debug, Clone, Serialize)]
pub struct PlannerPromptInputs {
    pub current_epoch: u64,
    pub epoch_list: String,
    pub walk_title: String,
    pub walk_goals: String,
    pub recent: Vec<RecentGroupContext>,
    pub highlights: Vec<String>,
    pub open_issues: Vec<OpenIssueContext>,
    pub memories: Vec<MemoryContext>,
    pub dead_memories: Vec<MemoryContext>,
    pub memory_bytes: u64,
    pub proposals: Vec<ProposalContext>,
    pub expansion_rows: Vec<ExpansionRowContext>,
    pub consumed_bytes: u64,
    pub context_budget_bytes: u64,
}

impl PlannerPromptInputs {
    pub fn gather(store: &WalkStore, walk: &WalkDoc) -> Result<Self> {
        let current_epoch = store.current_epoch()?.unwrap_or(1);
        let epochs = store.list_epochs()?;
        let epoch_list = if epochs.is_empty() {
            current_epoch.to_string()
        } else {
            epochs
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };

        let tree = store.build_discovery_tree(true)?;
        let groups = store.recent_closed(walk.config.planning_context_bytes)?;
        let mut highlights = Vec::new();
        let mut consumed_bytes = 0u64;
        let recent: Vec<RecentGroupContext> = groups
            .into_iter()
            .map(|group| RecentGroupContext {
                epoch: group.epoch,
                entries: group
                    .entries
                    .into_iter()
                    .map(|entry| {
                        consumed_bytes += entry.bytes;
                        if entry.signal != CloseSignal::Routine {
                            highlights.push(format!(
                                "{}: {}: {}",
                                entry.signal.as_str(),
                                entry.slug,
                                entry.reason
                            ));
                        }
                        RecentEntryContext {
                            parent: parent_annotation(&tree, &entry.slug),
                            slug: entry.slug,
                            title: entry.title,
                            signal: match entry.signal {
                                CloseSignal::Routine => String::new(),
                                other => other.as_str().to_string(),
                            },
                            bytes: entry.bytes,
                        }
                    })
                    .collect(),
            })
            .collect();

        let open_issues = store
            .list(crate::core::types::IssueStatus::Open)?
            .into_iter()
            .map(|issue| OpenIssueContext {
                parent: parent_annotation(&tree, &issue.slug),
                slug: issue.slug,
                title: issue.title,
                priority: issue.priority,
            })
            .collect();

        let mut memories = Vec::new();
        let mut dead_memories = Vec::new();
        let mut memory_bytes = 0u64;
        for memory in store.memories() {
            if memory.alive_at(current_epoch) {
                memory_bytes += memory.text.len() as u64;
                memories.push(MemoryContext {
                    key: memory.key,
                    text: memory.text,
                });
            } else if memory
                .alive_until
                .is_some_and(|until| until + 1 >= current_epoch)
            {
                dead_memories.push(MemoryContext {
                    key: memory.key,
                    text: memory.text,
                });
            }
        }

        let proposals = store
            .proposals()
            .into_iter()
            .map(|proposal| ProposalContext {
                key: proposal.key,
                text: proposal.text,
                proposed_by: proposal.proposed_by.unwrap_or_default(),
                epoch: proposal.epoch,
            })
            .collect();

        let stats = store.expansion_stats()?;
        let mut expansion_rows: Vec<ExpansionRowContext> = stats
            .per_kind
            .iter()
            .map(|entry| ExpansionRowContext {
                kind: entry.kind.clone(),
                count: entry.aggregate.count,
                median: format!("{:.1}", entry.aggregate.median),
                p75: format!("{:.1}", entry.aggregate.p75),
            })
            .collect();
        if let Some(overall) = &stats.overall
            && stats.per_kind.len() > 1
        {
            expansion_rows.push(ExpansionRowContext {
                kind: "(overall)".to_string(),
                count: overall.count,
                median: format!("{:.1}", overall.median),
                p75: format!("{:.1}", overall.p75),
            });
        }

        Ok(Self {
            current_epoch,
            epoch_list,
            walk_title: walk.title.clone(),
            walk_goals: walk.body.trim().to_string(),
            recent,
            highlights,
            open_issues,
            memories,
            dead_memories,
            memory_bytes,
            proposals,
            expansion_rows,
            consumed_bytes,
            context_budget_bytes: walk.config.planning_context_bytes,
        })
    }
}

/// Discovery annotation: the primary parent, with back-references to any
/// additional parents.
fn parent_annotation(
    tree: &crate::io::store::discovery::DiscoveryTree,
    slug: &str,
) -> Option<String> {
    let primary = tree.primary_parent(slug)?;
    let extras = tree.extra_parents(slug);
    if extras.is_empty() {
        Some(primary.to_string())
    } else {
        Some(format!("{primary}, also {}", extras.join(", ")))
    }
}

/// One rendered prompt section, ready for composition.
#[derive(Debug, Clone)]
struct Section {
    /// Template block name; doubles as the shed-order key.
    label: &'static str,
    /// Optional sections may be shed under byte pressure.
    optional: bool,
    body: String,
}

/// Section plans: template block names in composition order, with the
/// optional flag. Shed orders list the optional labels, first to go first.
const WORKER_PLAN: [(&str, bool); 5] = [
    ("preamble", false),
    ("context", true),
    ("walk", false),
    ("issue", false),
    ("epilogue", false),
];
const WORKER_SHED_ORDER: [&str; 1] = ["context"];

const PLANNER_PLAN: [(&str, bool); 8] = [
    ("epochs", false),
    ("goals", false),
    ("recent", false),
    ("open", false),
    ("memories", true),
    ("proposals", true),
    ("pressure", true),
    ("protocol", false),
];
const PLANNER_SHED_ORDER: [&str; 3] = ["pressure", "proposals", "memories"];

const SECTION_SEPARATOR: &str = "\n\n";
/// Bytes held back for the clip marker when even required sections overflow.
const CLIP_RESERVE: usize = 24;

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("worker", WORKER_TEMPLATE)
            .expect("worker template should be valid");
        env.add_template("planner", PLANNER_TEMPLATE)
            .expect("planner template should be valid");
        Self { env }
    }

    fn worker_sections(&self, input: &WorkerPromptInputs) -> Result<Vec<Section>> {
        let template = self.env.get_template("worker")?;
        let mut state = template.eval_to_state(context! {
            walk_dir => input.walk_dir,
            context_file => input.context_file,
            context_body => input.context_body,
            walk_title => input.walk_title,
            walk_goals => input.walk_goals,
            issue => input.issue,
            self_modification => input.self_modification,
        })?;
        WORKER_PLAN
            .iter()
            .map(|&(label, optional)| {
                Ok(Section {
                    label,
                    optional,
                    body: state.render_block(label)?,
                })
            })
            .collect()
    }

    fn planner_sections(&self, input: &PlannerPromptInputs) -> Result<Vec<Section>> {
        let template = self.env.get_template("planner")?;
        let mut state = template.eval_to_state(context! {
            current_epoch => input.current_epoch,
            epoch_list => input.epoch_list,
            walk_title => input.walk_title,
            walk_goals => input.walk_goals,
            recent => input.recent,
            highlights => input.highlights,
            open_issues => input.open_issues,
            memories => input.memories,
            dead_memories => input.dead_memories,
            memory_bytes => input.memory_bytes,
            proposals => input.proposals,
            expansion_rows => input.expansion_rows,
            consumed_bytes => input.consumed_bytes,
            context_budget_bytes => input.context_budget_bytes,
        })?;
        PLANNER_PLAN
            .iter()
            .map(|&(label, optional)| {
                Ok(Section {
                    label,
                    optional,
                    body: state.render_block(label)?,
                })
            })
            .collect()
    }
}

/// Compose sections into one prompt under a byte budget.
///
/// Blank sections vanish. While the joined text would exceed the budget,
/// optional sections are shed in `shed_order`; if the required remainder
/// still overflows, the prompt is clipped at a char boundary and the clip
/// is recorded inline.
fn compose(mut sections: Vec<Section>, budget_bytes: usize, shed_order: &[&str]) -> String {
    sections.retain(|section| !section.body.trim().is_empty());

    let mut shed = shed_order.iter();
    while joined_len(&sections) > budget_bytes {
        let Some(label) = shed.next() else { break };
        let before = sections.len();
        sections.retain(|section| !(section.optional && section.label == *label));
        if sections.len() < before {
            debug!(section = *label, "shed section for prompt budget");
        }
    }

    let mut prompt = sections
        .iter()
        .map(|section| section.body.trim())
        .collect::<Vec<_>>()
        .join(SECTION_SEPARATOR);

    if prompt.len() > budget_bytes {
        let cut = floor_char_boundary(&prompt, budget_bytes.saturating_sub(CLIP_RESERVE));
        let clipped = prompt.len() - cut;
        debug!(clipped, "clipped prompt tail for budget");
        prompt.truncate(cut);
        prompt.push_str(&format!("\n[clipped {clipped} bytes]"));
    }
    prompt
}

fn joined_len(sections: &[Section]) -> usize {
    let bodies: usize = sections.iter().map(|s| s.body.trim().len()).sum();
    bodies + SECTION_SEPARATOR.len() * sections.len().saturating_sub(1)
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut cut = index;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}

/// Builds prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn from_config(config: &WalkConfig) -> Self {
        Self::new(config.prompt_budget_bytes)
    }

    pub fn build_worker(&self, input: &WorkerPromptInputs) -> String {
        let sections = PromptEngine::new()
            .worker_sections(input)
            .expect("worker template rendering should not fail");
        compose(sections, self.budget_bytes, &WORKER_SHED_ORDER)
    }

    pub fn build_planner(&self, input: &PlannerPromptInputs) -> String {
        let sections = PromptEngine::new()
            .planner_sections(input)
            .expect("planner template rendering should not fail");
        compose(sections, self.budget_bytes, &PLANNER_SHED_ORDER)
    }
}
