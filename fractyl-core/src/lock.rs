//! Per-repository exclusive lock
//!
//! An advisory exclusive whole-file lock on `.fractyl/lock`, serializing
//! mutating pipelines (commit, delete, restore, daemon ticks) between the
//! foreground CLI and the background daemon. Release happens on fd close and
//! is therefore safe on process death. The holder's PID is written into the
//! file for diagnostics only; it is never trusted for ownership decisions.
//!
//! Read-only operations (list, show, diff) do not take the lock.

use std::fs::OpenOptions;
use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use fs2::FileExt;

use crate::error::FracError;
use crate::repo::Repository;

/// Retry interval for the blocking acquire path.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Held exclusive lock; released on drop.
#[derive(Debug)]
pub struct RepoLock {
    file: std::fs::File,
}

impl RepoLock {
    /// Acquire without blocking; `FracError::LockBusy` if contended.
    pub fn try_acquire(repo: &Repository) -> Result<RepoLock> {
        let path = repo.lock_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open lock file: {}", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                // Diagnostics only.
                let _ = file.set_len(0);
                let _ = writeln!(file, "{}", std::process::id());
                Ok(RepoLock { file })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(FracError::LockBusy.into())
            }
            Err(e) => {
                Err(e).with_context(|| format!("failed to lock file: {}", path.display()))
            }
        }
    }

    /// Retry with bounded sleep until success or `timeout` expires.
    pub fn wait_acquire(repo: &Repository, timeout: Duration) -> Result<RepoLock> {
        let deadline = Instant::now() + timeout;
        loop {
            match RepoLock::try_acquire(repo) {
                Ok(lock) => return Ok(lock),
                Err(e) => {
                    if !matches!(e.downcast_ref::<FracError>(), Some(FracError::LockBusy)) {
                        return Err(e);
                    }
                    if Instant::now() >= deadline {
                        return Err(FracError::LockTimeout(timeout.as_secs()).into());
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
            }
        }
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        // fd close would release anyway; unlock eagerly for clarity.
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
