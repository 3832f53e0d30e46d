//! Scaffolding for a fresh walk directory.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::io::paths::WalkPaths;
use crate::io::walk_meta::{WalkDoc, store_walk};

/// Options for `init_walk`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    pub title: String,
    /// Investigation goals body; a placeholder is written when empty.
    pub body: String,
}

/// Create the walk layout in `walk_dir`.
///
/// Fails if `_walk.md` already exists; an existing empty directory is fine.
pub fn init_walk(walk_dir: &Path, options: &InitOptions) -> Result<WalkPaths> {
    let paths = WalkPaths::new(walk_dir);
    if paths.walk_doc_path.exists() {
        return Err(anyhow!(
            "walk already initialised at {}",
            paths.walk_doc_path.display()
        ));
    }

    create_dir(&paths.walk_dir)?;
    create_dir(&paths.open_dir)?;
    create_dir(&paths.closed_dir)?;
    create_dir(&paths.epochs_dir)?;

    let body = if options.body.trim().is_empty() {
        GOALS_PLACEHOLDER.to_string()
    } else {
        options.body.clone()
    };
    store_walk(&paths.walk_doc_path, &WalkDoc::new(options.title.clone(), body))?;

    fs::write(&paths.memories_path, "[]\n")
        .with_context(|| format!("write {}", paths.memories_path.display()))?;
    fs::write(&paths.proposals_path, "[]\n")
        .with_context(|| format!("write {}", paths.proposals_path.display()))?;
    fs::write(&paths.lock_path, "")
        .with_context(|| format!("write {}", paths.lock_path.display()))?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

const GOALS_PLACEHOLDER: &str = "Describe the investigation goals here.\n";
