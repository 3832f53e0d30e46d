//! Epoch index maintenance: integer-keyed symlink partitions over closed issues.
//!
//! `epochs/<N>/<slug>` symlinks point into `closed/`; `epochs/current` is a
//! symlink naming the active epoch. The caller holds the walk lock for every
//! mutation here; readers re-resolve `current` on each access.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::io::paths::WalkPaths;

/// List existing epoch numbers, ascending.
pub fn list_epochs(paths: &WalkPaths) -> Result<Vec<u64>> {
    let mut epochs = Vec::new();
    let entries = match fs::read_dir(&paths.epochs_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(epochs),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("read epochs dir {}", paths.epochs_dir.display()));
        }
    };
    for entry in entries {
        let Ok(entry) = entry else { continue };
        if let Ok(number) = entry.file_name().to_string_lossy().parse::<u64>() {
            epochs.push(number);
        }
    }
    epochs.sort_unstable();
    Ok(epochs)
}

/// Resolve the `epochs/current` pointer, if set.
pub fn current_epoch(paths: &WalkPaths) -> Result<Option<u64>> {
    match fs::read_link(&paths.epoch_current_path) {
        Ok(target) => {
            let name = target
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            Ok(name.parse::<u64>().ok())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| {
            format!("read epoch pointer {}", paths.epoch_current_path.display())
        }),
    }
}

/// Atomically repoint `epochs/current` at `epoch` (tmp symlink + rename).
pub fn set_current(paths: &WalkPaths, epoch: u64) -> Result<()> {
    fs::create_dir_all(&paths.epochs_dir)
        .with_context(|| format!("create epochs dir {}", paths.epochs_dir.display()))?;
    let tmp = paths.epochs_dir.join(".current.tmp");
    let _ = fs::remove_file(&tmp);
    symlink(epoch.to_string(), &tmp)
        .with_context(|| format!("create epoch pointer {}", tmp.display()))?;
    fs::rename(&tmp, &paths.epoch_current_path)
        .with_context(|| format!("replace {}", paths.epoch_current_path.display()))?;
    Ok(())
}

/// Current epoch, bootstrapping epoch 1 on the first closure.
pub fn ensure_current(paths: &WalkPaths) -> Result<u64> {
    if let Some(epoch) = current_epoch(paths)? {
        return Ok(epoch);
    }
    create_epoch(paths, 1)?;
    debug!("bootstrapped epoch 1");
    Ok(1)
}

/// Advance to a fresh epoch: `max(existing) + 1`, never reusing a number.
pub fn increment(paths: &WalkPaths) -> Result<u64> {
    let next = list_epochs(paths)?.last().copied().unwrap_or(0) + 1;
    create_epoch(paths, next)?;
    debug!(epoch = next, "epoch advanced");
    Ok(next)
}

fn create_epoch(paths: &WalkPaths, epoch: u64) -> Result<()> {
    let dir = paths.epoch_dir(epoch);
    fs::create_dir_all(&dir).with_context(|| format!("create epoch dir {}", dir.display()))?;
    set_current(paths, epoch)
}

/// Record `slug`'s closure under `epochs/<epoch>/`. Idempotent.
pub fn record_closure(paths: &WalkPaths, slug: &str, epoch: u64) -> Result<()> {
    let dir = paths.epoch_dir(epoch);
    fs::create_dir_all(&dir).with_context(|| format!("create epoch dir {}", dir.display()))?;
    let link = dir.join(slug);
    let target = Path::new("../../closed").join(slug);
    match symlink(&target, &link) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err).with_context(|| format!("create closure link {}", link.display())),
    }
}

/// Slugs recorded under one epoch, sorted.
pub fn epoch_members(paths: &WalkPaths, epoch: u64) -> Result<Vec<String>> {
    let dir = paths.epoch_dir(epoch);
    let mut members = Vec::new();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(members),
        Err(err) => return Err(err).with_context(|| format!("read epoch dir {}", dir.display())),
    };
    for entry in entries {
        let Ok(entry) = entry else { continue };
        members.push(entry.file_name().to_string_lossy().to_string());
    }
    members.sort();
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_current_bootstraps_epoch_one() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = WalkPaths::new(temp.path());

        assert_eq!(current_epoch(&paths).expect("current"), None);
        assert_eq!(ensure_current(&paths).expect("ensure"), 1);
        assert_eq!(current_epoch(&paths).expect("current"), Some(1));
        assert!(paths.epoch_dir(1).is_dir());
    }

    #[test]
    fn increment_is_strictly_increasing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = WalkPaths::new(temp.path());

        assert_eq!(increment(&paths).expect("first"), 1);
        assert_eq!(increment(&paths).expect("second"), 2);
        assert_eq!(increment(&paths).expect("third"), 3);
        assert_eq!(current_epoch(&paths).expect("current"), Some(3));
        assert_eq!(list_epochs(&paths).expect("list"), vec![1, 2, 3]);
    }

    #[test]
    fn record_closure_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = WalkPaths::new(temp.path());
        fs::create_dir_all(paths.closed_issue_dir("alpha")).expect("closed dir");

        record_closure(&paths, "alpha", 1).expect("first");
        record_closure(&paths, "alpha", 1).expect("second");

        let members = epoch_members(&paths, 1).expect("members");
        assert_eq!(members, vec!["alpha".to_string()]);
        let resolved = fs::canonicalize(paths.epoch_dir(1).join("alpha")).expect("resolve");
        assert_eq!(
            resolved,
            fs::canonicalize(paths.closed_issue_dir("alpha")).expect("closed")
        );
    }
}
