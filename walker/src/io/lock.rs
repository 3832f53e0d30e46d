//! Advisory file locks guarding walk mutations.
//!
//! Three locks with distinct scopes:
//! - `.walk.lock`: exclusive lock held across every multi-step store mutation
//!   (create, close, epoch increment, memory edits).
//! - `comments.md`: per-file exclusive lock so comment appends on one issue
//!   serialise without contending with unrelated store operations.
//! - `.walk.pid`: held for the whole driver lifetime; a second driver fails to
//!   acquire it and refuses to start.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use fs2::FileExt;
use tracing::debug;

/// Exclusive walk-wide lock. Released on drop.
#[derive(Debug)]
pub struct WalkLock {
    file: File,
}

impl WalkLock {
    /// Block until the exclusive lock on `lock_path` is acquired.
    ///
    /// There is no timeout: contention only arises from concurrent CLI use,
    /// and every holder releases promptly.
    pub fn acquire(lock_path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
            .with_context(|| format!("open lock file {}", lock_path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("lock {}", lock_path.display()))?;
        debug!(path = %lock_path.display(), "walk lock acquired");
        Ok(Self { file })
    }
}

impl Drop for WalkLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Open `path` for appending under an exclusive lock on the file itself.
///
/// The lock is released when the returned handle drops, after the append has
/// been flushed.
pub struct LockedAppend {
    file: File,
}

impl LockedAppend {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("lock {}", path.display()))?;
        Ok(Self { file })
    }

    pub fn append(&mut self, text: &str) -> Result<()> {
        self.file
            .write_all(text.as_bytes())
            .context("append under lock")?;
        self.file.flush().context("flush append")
    }
}

impl Drop for LockedAppend {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Held for the driver's lifetime: the single-driver-per-walk guard.
///
/// The PID is written into the file for humans; the advisory lock is what
/// actually enforces exclusivity (a stale file from a crashed driver carries
/// no lock and does not block the next driver).
#[derive(Debug)]
pub struct PidLock {
    file: File,
    path: PathBuf,
}

impl PidLock {
    pub fn acquire(pid_path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(pid_path)
            .with_context(|| format!("open pid file {}", pid_path.display()))?;
        if file.try_lock_exclusive().is_err() {
            let holder = std::fs::read_to_string(pid_path).unwrap_or_default();
            let holder = holder.trim();
            return Err(anyhow!(
                "another driver is live on this walk{}",
                if holder.is_empty() {
                    String::new()
                } else {
                    format!(" (pid {holder})")
                }
            ));
        }
        file.set_len(0).context("truncate pid file")?;
        let mut file = file;
        writeln!(file, "{}", std::process::id()).context("write pid")?;
        file.flush().context("flush pid")?;
        debug!(path = %pid_path.display(), pid = std::process::id(), "pid lock acquired");
        Ok(Self {
            file,
            path: pid_path.to_path_buf(),
        })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_lock_refuses_second_acquirer() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".walk.pid");

        let held = PidLock::acquire(&path).expect("first acquire");
        let err = PidLock::acquire(&path).expect_err("second acquire should fail");
        assert!(err.to_string().contains("another driver is live"));
        drop(held);

        PidLock::acquire(&path).expect("acquire after release");
    }

    #[test]
    fn pid_file_is_removed_on_release() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".walk.pid");
        {
            let _held = PidLock::acquire(&path).expect("acquire");
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn locked_append_writes_through() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("comments.md");

        let mut handle = LockedAppend::open(&path).expect("open");
        handle.append("first\n").expect("append");
        drop(handle);
        let mut handle = LockedAppend::open(&path).expect("reopen");
        handle.append("second\n").expect("append");
        drop(handle);

        let contents = std::fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "first\nsecond\n");
    }
}
