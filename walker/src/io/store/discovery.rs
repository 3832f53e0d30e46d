//! Discovery DAG built from `derived_from` provenance links.
//!
//! The DAG is many-to-many; rendering flattens it into a tree by electing one
//! primary parent per child and annotating the rest with back-references.
//! Directory listings do not preserve link creation order, so the election is
//! by slug order and stable across rebuilds.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::core::types::Issue;

use super::WalkStore;

/// The discovery DAG plus its tree rendering indexes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryTree {
    /// Issues with no known parent, sorted by slug.
    pub roots: Vec<String>,
    /// Primary-parent → children, children sorted by slug.
    pub children: BTreeMap<String, Vec<String>>,
    /// Child → all parents (primary first).
    pub parents_of: BTreeMap<String, Vec<String>>,
    /// Every node in the tree.
    pub issues: BTreeMap<String, Issue>,
}

impl DiscoveryTree {
    /// The elected primary parent, if the node has one.
    pub fn primary_parent(&self, slug: &str) -> Option<&str> {
        self.parents_of
            .get(slug)
            .and_then(|parents| parents.first())
            .map(String::as_str)
    }

    /// Additional parents beyond the primary, for back-reference annotations.
    pub fn extra_parents(&self, slug: &str) -> &[String] {
        self.parents_of
            .get(slug)
            .map(|parents| &parents[1..])
            .unwrap_or(&[])
    }
}

impl WalkStore {
    /// Build the discovery tree over open (and optionally closed) issues.
    ///
    /// Edges pointing at issues outside the selected set are dropped; a node
    /// whose parents are all outside the set becomes a root.
    pub fn build_discovery_tree(&self, include_closed: bool) -> Result<DiscoveryTree> {
        let mut issues: BTreeMap<String, Issue> = BTreeMap::new();
        for issue in self.open_issues()? {
            issues.insert(issue.slug.clone(), issue);
        }
        if include_closed {
            for issue in self.closed_issues()? {
                issues.insert(issue.slug.clone(), issue);
            }
        }

        let mut tree = DiscoveryTree::default();
        for (slug, issue) in &issues {
            let parents: Vec<String> = issue
                .derived_from
                .iter()
                .filter(|parent| issues.contains_key(*parent))
                .cloned()
                .collect();
            if parents.is_empty() {
                tree.roots.push(slug.clone());
            } else {
                tree.children
                    .entry(parents[0].clone())
                    .or_default()
                    .push(slug.clone());
                tree.parents_of.insert(slug.clone(), parents);
            }
        }
        tree.issues = issues;
        Ok(tree)
    }
}
