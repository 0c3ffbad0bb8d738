//! Restore pipeline
//!
//! Synchronizes the working tree to a snapshot: resolve the identifier,
//! capture a best-effort safety snapshot of the current state, delete files
//! the target does not contain, materialize every target entry from the
//! object store, and point `CURRENT` at the target.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::commit::{self, CommitOptions, CommitOutcome, DEFAULT_LOCK_TIMEOUT};
use crate::ignore::IgnoreSet;
use crate::index::Index;
use crate::lock::RepoLock;
use crate::object_store::ObjectStore;
use crate::repo::{self, Repository};
use crate::scanner;
use crate::stat_index::StatIndex;
use crate::store::SnapshotStore;

/// Description stamped on the automatic pre-restore snapshot.
const SAFETY_DESCRIPTION: &str = "Pre-restore snapshot";

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Branch to restore from; probed from source control when absent.
    pub branch: Option<String>,
    pub lock_timeout: Duration,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        RestoreOptions {
            branch: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub struct RestoreSummary {
    /// Resolved id of the snapshot the tree now reflects.
    pub id: String,
    /// Files materialized from the object store.
    pub restored: usize,
    /// Extraneous files deleted from the working tree.
    pub pruned: usize,
    /// Id of the safety snapshot, when one was created.
    pub safety_snapshot: Option<String>,
}

/// Restore the working tree to the snapshot named by `target` (any resolver
/// form: `-N`, full id, or prefix).
pub fn restore(
    repo: &Repository,
    target: &str,
    options: &RestoreOptions,
) -> Result<RestoreSummary> {
    let branch = options
        .branch
        .clone()
        .unwrap_or_else(|| repo.current_branch());
    let snapshots = SnapshotStore::open(repo, &branch)?;
    let id = snapshots.resolve(target)?;

    let _lock = RepoLock::wait_acquire(repo, options.lock_timeout)?;

    // Best-effort safety snapshot of whatever the tree looks like now;
    // failure reduces to a warning and the restore continues.
    let current = repo.read_current(&branch)?;
    let mut safety_snapshot = None;
    if current.is_some() && current.as_deref() != Some(id.as_str()) {
        let safety_options = CommitOptions {
            description: Some(SAFETY_DESCRIPTION.to_string()),
            branch: Some(branch.clone()),
            ..CommitOptions::default()
        };
        match commit::run_locked(repo, &safety_options, None) {
            Ok(CommitOutcome::Created { snapshot, .. }) => {
                log::info!("captured safety snapshot {}", snapshot.id);
                safety_snapshot = Some(snapshot.id);
            }
            Ok(CommitOutcome::NoChanges) => {}
            Err(e) => {
                log::warn!("safety snapshot failed, continuing with restore: {:#}", e);
            }
        }
    }

    let snapshot = snapshots.read(&id)?;
    let objects = ObjectStore::open(repo);
    let index_bytes = objects.get(&snapshot.index_hash)?;
    let target_index = Index::decode(&index_bytes)
        .with_context(|| format!("failed to parse index blob for snapshot {}", id))?;

    let ignores = IgnoreSet::load(repo.root());
    let pruned = prune_extraneous(repo, &ignores, &target_index)?;

    for entry in target_index.iter() {
        let dest = repo.root().join(&entry.path);
        objects.restore_to(&entry.hash, &dest)?;
        fs::set_permissions(&dest, fs::Permissions::from_mode(entry.mode & 0o7777))
            .with_context(|| format!("failed to set mode on {}", dest.display()))?;
    }

    // Rebuild the stat cache in target-index order from the files just
    // written, so the next scan sees a clean tree and a no-op commit stays
    // byte-identical to the target.
    let mut stat_index = StatIndex::empty(&branch);
    for entry in target_index.iter() {
        match fs::symlink_metadata(repo.root().join(&entry.path)) {
            Ok(meta) => stat_index.update(&entry.path, &meta, &entry.hash),
            Err(e) => log::warn!("failed to stat restored file {}: {}", entry.path, e),
        }
    }
    if let Err(e) = stat_index.save(repo) {
        log::warn!("failed to save stat-index after restore: {:#}", e);
    }

    repo::atomic_write(&repo.live_index_path(), &index_bytes)
        .context("failed to write live index")?;
    repo.write_current(&branch, &id)?;

    log::info!(
        "restored snapshot {} ({} files, {} pruned)",
        id,
        target_index.len(),
        pruned
    );
    Ok(RestoreSummary {
        id,
        restored: target_index.len(),
        pruned,
        safety_snapshot,
    })
}

/// Delete working-tree files that are not in the target set, then sweep away
/// directories the deletions emptied. Ignored paths and everything behind a
/// submodule boundary are left alone.
fn prune_extraneous(repo: &Repository, ignores: &IgnoreSet, target: &Index) -> Result<usize> {
    let root = repo.root().to_path_buf();
    let mut pruned = 0usize;
    let mut dirs: Vec<std::path::PathBuf> = Vec::new();

    let walker = WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| scanner::should_descend(&root, ignores, entry));

    for result in walker {
        let entry = match result {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("skipping unreadable directory entry: {}", e);
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }
        if entry.file_type().is_dir() {
            dirs.push(entry.path().to_path_buf());
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = scanner::relative_path(&root, entry.path()) else {
            continue;
        };
        if ignores.should_ignore(&rel, false) {
            continue;
        }
        if target.find(&rel).is_none() {
            fs::remove_file(entry.path())
                .with_context(|| format!("failed to delete {}", entry.path().display()))?;
            pruned += 1;
        }
    }

    // Deepest first so nested empties collapse upward; non-empty removals
    // just fail and are ignored.
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        let _ = fs::remove_dir(&dir);
    }

    Ok(pruned)
}
