//! Filesystem-backed issue store for one walk.
//!
//! The walk directory is the database: open issues live under `open/<slug>/`,
//! closed ones under `closed/<slug>/`, and the atomic directory rename *is*
//! the close operation. Symlinks carry the epoch index and the blocking /
//! discovery graphs, so the whole store stays inspectable with `ls`.
//!
//! Writes take an exclusive advisory lock on `.walk.lock`; reads are
//! lock-free and tolerate directories vanishing mid-scan, because a worker
//! may move an issue from open to closed between `readdir` and the child
//! open.

pub mod discovery;
pub mod epochs;
pub mod memories;
pub mod stats;

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::slug::validate_slug;
use crate::core::types::{CloseSignal, Closure, Issue, IssueStatus, RunRecord};
use crate::io::issue_doc::{IssueDoc, load_issue_doc, parse_close_meta, store_issue_doc};
use crate::io::lock::{LockedAppend, WalkLock};
use crate::io::paths::{IssuePaths, WalkPaths};
use crate::io::walk_meta::{WalkDoc, load_walk, store_walk};
use self::memories::{Memory, Proposal};

/// Reserved container type: epics group work and are never dispatched.
pub const CONTAINER_KIND: &str = "epic";

/// Contractual store failures callers may branch on (`downcast_ref`).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("issue '{0}' not found")]
    NotFound(String),
    #[error("issue '{0}' already exists")]
    AlreadyExists(String),
    #[error("issue '{0}' is not open")]
    NotOpen(String),
}

/// Arguments for [`WalkStore::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateIssue {
    pub slug: String,
    pub title: String,
    pub body: String,
    /// Explicit type; derived from title/slug prefix when `None`.
    pub kind: Option<String>,
    pub priority: u32,
    pub blocked_by: Vec<String>,
    pub derived_from: Vec<String>,
}

/// Handle to one walk's persistent state.
#[derive(Debug, Clone)]
pub struct WalkStore {
    paths: WalkPaths,
}

impl WalkStore {
    pub fn new(walk_dir: impl Into<PathBuf>) -> Self {
        Self {
            paths: WalkPaths::new(walk_dir),
        }
    }

    pub fn paths(&self) -> &WalkPaths {
        &self.paths
    }

    fn lock(&self) -> Result<WalkLock> {
        WalkLock::acquire(&self.paths.lock_path)
    }

    // ---- lifecycle -------------------------------------------------------

    /// Create an open issue. Fails with [`StoreError::AlreadyExists`] when the
    /// slug is present in either partition.
    pub fn create(&self, request: &CreateIssue) -> Result<Issue> {
        validate_slug(&request.slug)?;
        let _lock = self.lock()?;

        let open_dir = self.paths.open_issue_dir(&request.slug);
        if open_dir.exists() || self.paths.closed_issue_dir(&request.slug).exists() {
            return Err(StoreError::AlreadyExists(request.slug.clone()).into());
        }
        for referent in request.blocked_by.iter().chain(&request.derived_from) {
            if self.issue_location(referent).is_none() {
                return Err(anyhow!(
                    "unknown referent '{referent}' for issue '{}'",
                    request.slug
                ));
            }
        }

        let issue_paths = IssuePaths::new(&open_dir);
        fs::create_dir_all(&issue_paths.dir)
            .with_context(|| format!("create issue dir {}", issue_paths.dir.display()))?;
        store_issue_doc(
            &issue_paths.doc_path,
            &IssueDoc {
                title: request.title.clone(),
                kind: crate::core::slug::derive_kind(
                    request.kind.as_deref(),
                    &request.title,
                    &request.slug,
                ),
                priority: request.priority,
                body: request.body.clone(),
            },
        )?;
        write_links(&self.paths, &issue_paths.blocked_by_dir, &request.blocked_by)?;
        write_links(&self.paths, &issue_paths.derived_from_dir, &request.derived_from)?;

        debug!(slug = %request.slug, "issue created");
        load_issue_at(&open_dir, &request.slug, false)
    }

    /// Close an open issue: write close metadata, then atomically move the
    /// directory and record the closure in the current epoch (bootstrapping
    /// epoch 1 on the first closure).
    pub fn close(&self, slug: &str, reason: &str, signal: CloseSignal) -> Result<Closure> {
        let _lock = self.lock()?;

        let open_dir = self.paths.open_issue_dir(slug);
        if !open_dir.exists() {
            return Err(StoreError::NotOpen(slug.to_string()).into());
        }

        let epoch = epochs::ensure_current(&self.paths)?;
        let closure = Closure {
            reason: reason.to_string(),
            signal,
            epoch,
            closed_at: Utc::now(),
        };

        let issue_paths = IssuePaths::new(&open_dir);
        fs::write(
            &issue_paths.close_meta_path,
            crate::io::issue_doc::render_close_meta(&closure),
        )
        .with_context(|| format!("write {}", issue_paths.close_meta_path.display()))?;
        if !issue_paths.result_path.exists() {
            fs::write(&issue_paths.result_path, format!("{reason}\n"))
                .with_context(|| format!("write {}", issue_paths.result_path.display()))?;
        }
        let _ = fs::remove_file(&issue_paths.bump_path);

        let closed_dir = self.paths.closed_issue_dir(slug);
        fs::create_dir_all(&self.paths.closed_dir)
            .with_context(|| format!("create {}", self.paths.closed_dir.display()))?;
        fs::rename(&open_dir, &closed_dir)
            .with_context(|| format!("move {} to closed", open_dir.display()))?;
        epochs::record_closure(&self.paths, slug, epoch)?;

        debug!(slug, epoch, signal = signal.as_str(), "issue closed");
        Ok(closure)
    }

    /// Append a timestamped section to the issue's comment log.
    ///
    /// Uses an exclusive lock on `comments.md` itself, not the walk lock, so
    /// comments on different issues never contend.
    pub fn add_comment(&self, slug: &str, text: &str) -> Result<()> {
        let (dir, _) = self
            .issue_location(slug)
            .ok_or_else(|| StoreError::NotFound(slug.to_string()))?;
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let section = format!("## {stamp}\n\n{}\n\n", text.trim_end());
        let mut handle = LockedAppend::open(&IssuePaths::new(&dir).comments_path)?;
        handle.append(&section)
    }

    /// Set the `.next` priority-bump marker.
    pub fn bump(&self, slug: &str) -> Result<()> {
        let open_dir = self.paths.open_issue_dir(slug);
        if !open_dir.exists() {
            return Err(StoreError::NotOpen(slug.to_string()).into());
        }
        let path = IssuePaths::new(&open_dir).bump_path;
        fs::write(&path, "").with_context(|| format!("write {}", path.display()))
    }

    /// Write the `blocked_by_driver` marker. The note records the failing
    /// run ids; deleting the file unblocks the issue.
    pub fn block_by_driver(&self, slug: &str, note: &str) -> Result<()> {
        let open_dir = self.paths.open_issue_dir(slug);
        if !open_dir.exists() {
            return Err(StoreError::NotOpen(slug.to_string()).into());
        }
        let path = IssuePaths::new(&open_dir).driver_block_path;
        fs::write(&path, note).with_context(|| format!("write {}", path.display()))
    }

    // ---- queries ---------------------------------------------------------

    /// Find an issue by slug, open partition searched first.
    pub fn show(&self, slug: &str) -> Result<Issue> {
        match self.issue_location(slug) {
            Some((dir, IssueStatus::Open)) => load_issue_at(&dir, slug, false),
            Some((dir, IssueStatus::Closed)) => load_issue_at(&dir, slug, true),
            None => Err(StoreError::NotFound(slug.to_string()).into()),
        }
    }

    /// Where an issue currently lives, if anywhere.
    pub fn issue_location(&self, slug: &str) -> Option<(PathBuf, IssueStatus)> {
        let open_dir = self.paths.open_issue_dir(slug);
        if open_dir.exists() {
            return Some((open_dir, IssueStatus::Open));
        }
        let closed_dir = self.paths.closed_issue_dir(slug);
        if closed_dir.exists() {
            return Some((closed_dir, IssueStatus::Closed));
        }
        None
    }

    /// Open issues eligible for dispatch, in stable priority order.
    ///
    /// Excludes driver-blocked issues, issues whose `blocked_by` referents
    /// are still open, and the reserved container type.
    pub fn ready_issues(&self) -> Result<Vec<Issue>> {
        let mut ready: Vec<Issue> = self
            .open_issues()?
            .into_iter()
            .filter(|issue| self.is_ready(issue))
            .collect();
        ready.sort_by_key(Issue::ready_key);
        Ok(ready)
    }

    fn is_ready(&self, issue: &Issue) -> bool {
        if issue.blocked_by_driver || issue.kind == CONTAINER_KIND {
            return false;
        }
        !issue
            .blocked_by
            .iter()
            .any(|dep| self.paths.open_issue_dir(dep).exists())
    }

    /// Sorted listing: open issues ready-first by priority, closed issues by
    /// close time.
    pub fn list(&self, status: IssueStatus) -> Result<Vec<Issue>> {
        match status {
            IssueStatus::Open => {
                let mut issues = self.open_issues()?;
                issues.sort_by_key(|issue| {
                    (if self.is_ready(issue) { 0u8 } else { 1 }, issue.ready_key())
                });
                Ok(issues)
            }
            IssueStatus::Closed => {
                let mut issues = self.closed_issues()?;
                issues.sort_by_key(|issue| {
                    issue
                        .closure
                        .as_ref()
                        .map(|c| c.closed_at)
                        .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC)
                });
                Ok(issues)
            }
        }
    }

    /// All open issues, unsorted. ENOENT-tolerant per child.
    pub fn open_issues(&self) -> Result<Vec<Issue>> {
        scan_issues(&self.paths.open_dir, false)
    }

    /// All closed issues, unsorted. ENOENT-tolerant per child.
    pub fn closed_issues(&self) -> Result<Vec<Issue>> {
        scan_issues(&self.paths.closed_dir, true)
    }

    /// Run records for one issue, ordered by start time.
    pub fn runs(&self, slug: &str) -> Result<Vec<RunRecord>> {
        let (dir, _) = self
            .issue_location(slug)
            .ok_or_else(|| StoreError::NotFound(slug.to_string()))?;
        crate::io::runs::list_runs(&IssuePaths::new(&dir).runs_dir)
    }

    /// Comment log contents, if any.
    pub fn comments(&self, slug: &str) -> Result<Option<String>> {
        let (dir, _) = self
            .issue_location(slug)
            .ok_or_else(|| StoreError::NotFound(slug.to_string()))?;
        match fs::read_to_string(IssuePaths::new(&dir).comments_path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    // ---- walk metadata ---------------------------------------------------

    pub fn load_walk(&self) -> Result<WalkDoc> {
        load_walk(&self.paths.walk_doc_path)
    }

    /// Rewrite the walk header, preserving config and goals body.
    pub fn set_walk_status(
        &self,
        status: crate::core::types::WalkStatus,
        reason: Option<&str>,
    ) -> Result<WalkDoc> {
        let _lock = self.lock()?;
        let mut doc = self.load_walk()?;
        doc.status = status;
        if status.is_terminal() {
            doc.finished_at = Some(Utc::now());
            doc.finish_reason = reason.map(str::to_string);
        } else {
            doc.finished_at = None;
            doc.finish_reason = None;
        }
        store_walk(&self.paths.walk_doc_path, &doc)?;
        Ok(doc)
    }

    // ---- epochs ----------------------------------------------------------

    pub fn current_epoch(&self) -> Result<Option<u64>> {
        epochs::current_epoch(&self.paths)
    }

    pub fn list_epochs(&self) -> Result<Vec<u64>> {
        epochs::list_epochs(&self.paths)
    }

    pub fn epoch_members(&self, epoch: u64) -> Result<Vec<String>> {
        epochs::epoch_members(&self.paths, epoch)
    }

    /// Advance to a fresh epoch under the walk lock.
    pub fn increment_epoch(&self) -> Result<u64> {
        let _lock = self.lock()?;
        epochs::increment(&self.paths)
    }

    /// Record a closure symlink; idempotent.
    pub fn record_closure_in_epoch(&self, slug: &str, epoch: u64) -> Result<()> {
        let _lock = self.lock()?;
        epochs::record_closure(&self.paths, slug, epoch)
    }

    // ---- memories & proposals -------------------------------------------

    pub fn memories(&self) -> Vec<Memory> {
        memories::load_memories(&self.paths.memories_path)
    }

    pub fn proposals(&self) -> Vec<Proposal> {
        memories::load_proposals(&self.paths.proposals_path)
    }

    /// Record a memory candidate for the next planning round.
    pub fn add_proposal(&self, key: &str, text: &str, proposed_by: Option<&str>) -> Result<()> {
        let _lock = self.lock()?;
        let mut proposals = memories::read_proposals_strict(&self.paths.proposals_path)?;
        if proposals.iter().any(|p| p.key == key) {
            return Err(StoreError::AlreadyExists(key.to_string()).into());
        }
        let epoch = epochs::current_epoch(&self.paths)?.unwrap_or(1);
        proposals.push(Proposal {
            key: key.to_string(),
            text: text.to_string(),
            proposed_by: proposed_by.map(str::to_string),
            epoch,
        });
        memories::save_proposals(&self.paths.proposals_path, &proposals)
    }

    /// Promote a proposal into an alive memory.
    pub fn accept_proposal(&self, key: &str) -> Result<Memory> {
        let _lock = self.lock()?;
        let mut proposals = memories::read_proposals_strict(&self.paths.proposals_path)?;
        let position = proposals
            .iter()
            .position(|p| p.key == key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let proposal = proposals.remove(position);

        let mut all = memories::read_memories_strict(&self.paths.memories_path)?;
        let memory = Memory {
            key: proposal.key,
            text: proposal.text,
            alive_from: epochs::current_epoch(&self.paths)?.unwrap_or(1),
            alive_until: None,
            created_by: proposal.proposed_by,
            killed_by: None,
        };
        all.push(memory.clone());
        memories::save_memories(&self.paths.memories_path, &all)?;
        memories::save_proposals(&self.paths.proposals_path, &proposals)?;
        Ok(memory)
    }

    /// Drop a proposal without promoting it.
    pub fn discard_proposal(&self, key: &str) -> Result<()> {
        let _lock = self.lock()?;
        let mut proposals = memories::read_proposals_strict(&self.paths.proposals_path)?;
        let position = proposals
            .iter()
            .position(|p| p.key == key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        proposals.remove(position);
        memories::save_proposals(&self.paths.proposals_path, &proposals)
    }

    /// End an alive memory's lifetime at the current epoch.
    pub fn forget_memory(&self, key: &str, killed_by: Option<&str>) -> Result<()> {
        let _lock = self.lock()?;
        let mut all = memories::read_memories_strict(&self.paths.memories_path)?;
        let memory = all
            .iter_mut()
            .find(|m| m.key == key && m.alive_until.is_none())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        memory.alive_until = Some(epochs::current_epoch(&self.paths)?.unwrap_or(1));
        memory.killed_by = killed_by.map(str::to_string);
        memories::save_memories(&self.paths.memories_path, &all)
    }
}

/// Store handle plus the driver-owned mutex that serialises runner-side
/// mutations in concurrent mode. Store-internal file locks still hold; the
/// gate avoids lock contention and preserves comment ordering.
#[derive(Debug)]
pub struct StoreGate {
    store: WalkStore,
    write_gate: Mutex<()>,
}

impl StoreGate {
    pub fn new(store: WalkStore) -> Self {
        Self {
            store,
            write_gate: Mutex::new(()),
        }
    }

    /// Lock-free reads go straight to the store.
    pub fn read(&self) -> &WalkStore {
        &self.store
    }

    /// Serialise a mutating call through the backend mutex.
    pub fn with_write<T>(&self, op: impl FnOnce(&WalkStore) -> T) -> T {
        let _guard = self
            .write_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        op(&self.store)
    }
}

// ---- scanning helpers ----------------------------------------------------

fn scan_issues(dir: &Path, closed: bool) -> Result<Vec<Issue>> {
    let mut issues = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(issues),
        Err(err) => return Err(err).with_context(|| format!("read {}", dir.display())),
    };

    for entry in entries {
        let Ok(entry) = entry else { continue };
        let slug = entry.file_name().to_string_lossy().to_string();
        if slug.starts_with('.') {
            continue;
        }
        match load_issue_at(&entry.path(), &slug, closed) {
            Ok(issue) => issues.push(issue),
            // A worker may have moved the directory between readdir and here.
            Err(err) if is_not_found(&err) => continue,
            Err(err) => {
                warn!(slug, error = %err, "skipping malformed issue record");
            }
        }
    }
    Ok(issues)
}

fn load_issue_at(dir: &Path, slug: &str, closed: bool) -> Result<Issue> {
    let issue_paths = IssuePaths::new(dir);
    let doc = load_issue_doc(&issue_paths.doc_path, slug)?;

    let closure = if closed {
        let contents = fs::read_to_string(&issue_paths.close_meta_path)
            .with_context(|| format!("read {}", issue_paths.close_meta_path.display()))?;
        Some(parse_close_meta(&contents)?)
    } else {
        None
    };

    Ok(Issue {
        slug: slug.to_string(),
        title: doc.title,
        body: doc.body,
        kind: doc.kind,
        priority: doc.priority,
        blocked_by: link_names(&issue_paths.blocked_by_dir),
        derived_from: link_names(&issue_paths.derived_from_dir),
        priority_override: issue_paths.bump_path.exists(),
        blocked_by_driver: issue_paths.driver_block_path.exists(),
        closure,
    })
}

fn link_names(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return names;
    };
    for entry in entries.flatten() {
        names.push(entry.file_name().to_string_lossy().to_string());
    }
    names.sort();
    names
}

fn write_links(paths: &WalkPaths, dir: &Path, referents: &[String]) -> Result<()> {
    if referents.is_empty() {
        return Ok(());
    }
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    for referent in referents {
        let link = dir.join(referent);
        // The link sits three levels below the walk root; point it at the
        // partition the referent lives in right now (the caller has already
        // verified it exists in one of them).
        let partition = if paths.open_issue_dir(referent).exists() {
            "open"
        } else {
            "closed"
        };
        let target = Path::new("../../..").join(partition).join(referent);
        match symlink(&target, &link) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(err).with_context(|| format!("create link {}", link.display()));
            }
        }
    }
    Ok(())
}

/// True when the error chain bottoms out in an ENOENT.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.root_cause()
        .downcast_ref::<std::io::Error>()
        .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestWalk;

    fn request(slug: &str, priority: u32) -> CreateIssue {
        CreateIssue {
            slug: slug.to_string(),
            title: format!("probe: {slug}"),
            body: format!("{slug} body\n"),
            kind: None,
            priority,
            blocked_by: Vec::new(),
            derived_from: Vec::new(),
        }
    }

    #[test]
    fn create_then_show_round_trips() {
        let walk = TestWalk::new().expect("walk");
        let store = walk.store();

        let created = store.create(&request("alpha", 2)).expect("create");
        assert_eq!(created.kind, "probe");
        assert_eq!(created.priority, 2);

        let shown = store.show("alpha").expect("show");
        assert_eq!(shown, created);
        assert_eq!(shown.status(), IssueStatus::Open);
    }

    #[test]
    fn duplicate_slugs_are_rejected_across_partitions() {
        let walk = TestWalk::new().expect("walk");
        let store = walk.store();
        store.create(&request("alpha", 1)).expect("create");

        let err = store.create(&request("alpha", 1)).expect_err("duplicate");
        assert!(err.downcast_ref::<StoreError>().is_some());

        store
            .close("alpha", "done", CloseSignal::Routine)
            .expect("close");
        let err = store.create(&request("alpha", 1)).expect_err("resurrected");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn close_moves_directory_and_round_trips_metadata() {
        let walk = TestWalk::new().expect("walk");
        let store = walk.store();
        store.create(&request("alpha", 1)).expect("create");

        let closure = store
            .close("alpha", "Done.", CloseSignal::Surprising)
            .expect("close");
        assert_eq!(closure.epoch, 1);

        assert!(!store.paths().open_issue_dir("alpha").exists());
        assert!(store.paths().closed_issue_dir("alpha").exists());

        let shown = store.show("alpha").expect("show");
        let read_back = shown.closure.expect("closure");
        assert_eq!(read_back.reason, "Done.");
        assert_eq!(read_back.signal, CloseSignal::Surprising);
        assert_eq!(read_back.epoch, closure.epoch);
        assert_eq!(
            read_back.closed_at.timestamp(),
            closure.closed_at.timestamp()
        );

        let result = std::fs::read_to_string(
            store
                .paths()
                .closed_issue_dir("alpha")
                .join("result"),
        )
        .expect("result");
        assert_eq!(result.lines().next(), Some("Done."));
    }

    #[test]
    fn close_requires_an_open_issue() {
        let walk = TestWalk::new().expect("walk");
        let store = walk.store();

        let err = store
            .close("ghost", "nope", CloseSignal::Routine)
            .expect_err("close");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::NotOpen(_))
        ));
    }

    #[test]
    fn close_preserves_worker_written_result() {
        let walk = TestWalk::new().expect("walk");
        let store = walk.store();
        store.create(&request("alpha", 1)).expect("create");
        std::fs::write(
            store.paths().open_issue_dir("alpha").join("result"),
            "Found it\n\nLong details.\n",
        )
        .expect("write result");

        store
            .close("alpha", "Found it", CloseSignal::Routine)
            .expect("close");
        let result = std::fs::read_to_string(
            store
                .paths()
                .closed_issue_dir("alpha")
                .join("result"),
        )
        .expect("result");
        assert!(result.contains("Long details."));
    }

    #[test]
    fn ready_issues_order_and_exclusions() {
        let walk = TestWalk::new().expect("walk");
        let store = walk.store();
        store.create(&request("bb-low", 3)).expect("create");
        store.create(&request("aa-high", 1)).expect("create");
        store.create(&request("cc-mid", 2)).expect("create");
        store
            .create(&CreateIssue {
                kind: Some("epic".to_string()),
                ..request("group", 1)
            })
            .expect("create epic");
        store
            .create(&CreateIssue {
                blocked_by: vec!["aa-high".to_string()],
                ..request("dd-gated", 1)
            })
            .expect("create gated");

        store.bump("cc-mid").expect("bump");
        store.block_by_driver("bb-low", "stuck").expect("block");

        let ready: Vec<String> = store
            .ready_issues()
            .expect("ready")
            .into_iter()
            .map(|issue| issue.slug)
            .collect();
        // bumped first, then priority; epic, gated and driver-blocked excluded
        assert_eq!(ready, vec!["cc-mid".to_string(), "aa-high".to_string()]);

        // closing the gate referent releases the gated issue
        store
            .close("aa-high", "done", CloseSignal::Routine)
            .expect("close");
        let ready: Vec<String> = store
            .ready_issues()
            .expect("ready")
            .into_iter()
            .map(|issue| issue.slug)
            .collect();
        assert_eq!(ready, vec!["cc-mid".to_string(), "dd-gated".to_string()]);
    }

    #[test]
    fn dependency_links_resolve_into_the_referent_partition() {
        let walk = TestWalk::new().expect("walk");
        let store = walk.store();
        store.create(&request("done-dep", 1)).expect("create");
        store
            .close("done-dep", "done", CloseSignal::Routine)
            .expect("close");
        store.create(&request("live-dep", 1)).expect("create");

        store
            .create(&CreateIssue {
                blocked_by: vec!["live-dep".to_string()],
                derived_from: vec!["done-dep".to_string()],
                ..request("child", 1)
            })
            .expect("create child");

        let child = store.paths().open_issue_dir("child");
        let live = std::fs::canonicalize(child.join("blocked_by").join("live-dep"))
            .expect("resolve live dep");
        assert_eq!(
            live,
            std::fs::canonicalize(store.paths().open_issue_dir("live-dep")).expect("open dep")
        );
        let done = std::fs::canonicalize(child.join("derived_from").join("done-dep"))
            .expect("resolve closed dep");
        assert_eq!(
            done,
            std::fs::canonicalize(store.paths().closed_issue_dir("done-dep"))
                .expect("closed dep")
        );
    }

    #[test]
    fn unknown_referents_are_rejected() {
        let walk = TestWalk::new().expect("walk");
        let store = walk.store();
        let err = store
            .create(&CreateIssue {
                blocked_by: vec!["missing".to_string()],
                ..request("alpha", 1)
            })
            .expect_err("create");
        assert!(err.to_string().contains("unknown referent"));
    }

    #[test]
    fn comments_append_in_order() {
        let walk = TestWalk::new().expect("walk");
        let store = walk.store();
        store.create(&request("alpha", 1)).expect("create");

        store.add_comment("alpha", "first note").expect("comment");
        store.add_comment("alpha", "second note").expect("comment");

        let comments = store
            .comments("alpha")
            .expect("comments")
            .expect("present");
        let first = comments.find("first note").expect("first");
        let second = comments.find("second note").expect("second");
        assert!(first < second);
        assert!(comments.starts_with("## "));
    }

    #[test]
    fn malformed_issue_is_skipped_in_scans() {
        let walk = TestWalk::new().expect("walk");
        let store = walk.store();
        store.create(&request("good", 1)).expect("create");
        let bad_dir = store.paths().open_issue_dir("bad");
        std::fs::create_dir_all(&bad_dir).expect("bad dir");
        std::fs::write(bad_dir.join("issue.md"), "---\npriority: nope\n---\n").expect("bad doc");

        let open = store.open_issues().expect("open");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].slug, "good");
    }

    #[test]
    fn memory_lifecycle_propose_accept_forget() {
        let walk = TestWalk::new().expect("walk");
        let store = walk.store();

        store
            .add_proposal("cache-hot", "The cache is the bottleneck.", Some("alpha"))
            .expect("propose");
        assert_eq!(store.proposals().len(), 1);

        let memory = store.accept_proposal("cache-hot").expect("accept");
        assert_eq!(memory.alive_from, 1);
        assert!(store.proposals().is_empty());
        assert!(store.memories()[0].alive_at(1));

        store.forget_memory("cache-hot", Some("beta")).expect("forget");
        let memories = store.memories();
        assert_eq!(memories[0].alive_until, Some(1));
        assert!(!memories[0].alive_at(2));

        let err = store.forget_memory("cache-hot", None).expect_err("again");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::NotFound(_))
        ));
    }
}
