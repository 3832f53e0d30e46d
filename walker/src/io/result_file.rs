//! Planning result file: written by the planner, consumed (and deleted) by
//! the driver.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

use crate::core::types::PlanningOutcome;
use crate::io::frontmatter::parse_document;

/// Parsed `_planning_result.md`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanningResult {
    /// `None` when the outcome key is missing or unrecognised.
    pub outcome: Option<PlanningOutcome>,
    pub reason: String,
}

/// Read and delete the planning result file. `Ok(None)` when absent.
pub fn consume_planning_result(path: &Path) -> Result<Option<PlanningResult>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;

    let (pairs, _body) = parse_document(&contents);
    let raw_outcome = pairs.get("outcome").cloned().unwrap_or_default();
    let outcome = PlanningOutcome::parse(&raw_outcome);
    if outcome.is_none() {
        warn!(outcome = %raw_outcome, "unrecognised planning outcome, falling back to observation");
    }
    Ok(Some(PlanningResult {
        outcome,
        reason: pairs.get("reason").cloned().unwrap_or_default(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_parses_and_deletes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("_planning_result.md");
        fs::write(
            &path,
            "---\noutcome: completed\nreason: Goal met\n---\n\nNotes.\n",
        )
        .expect("write");

        let result = consume_planning_result(&path)
            .expect("consume")
            .expect("present");
        assert_eq!(result.outcome, Some(PlanningOutcome::Completed));
        assert_eq!(result.reason, "Goal met");
        assert!(!path.exists());
    }

    #[test]
    fn missing_file_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result =
            consume_planning_result(&temp.path().join("_planning_result.md")).expect("consume");
        assert_eq!(result, None);
    }

    #[test]
    fn unknown_outcome_is_preserved_as_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("_planning_result.md");
        fs::write(&path, "---\noutcome: victory\nreason: eh\n---\n").expect("write");

        let result = consume_planning_result(&path)
            .expect("consume")
            .expect("present");
        assert_eq!(result.outcome, None);
        assert_eq!(result.reason, "eh");
        assert!(!path.exists());
    }
}
