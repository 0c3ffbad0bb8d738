//! Per-branch snapshot store and identifier resolution
//!
//! Snapshot records live under `refs/heads/<branch>/snapshots/<id>.json`.
//! Snapshots created under one branch are invisible to listings and prefix
//! resolution under another.
//!
//! Identifier forms accepted by the resolver, tried in order:
//! 1. `-N` — the N-th most recent snapshot on the branch (timestamp
//!    descending).
//! 2. A full identifier (64 hex chars or a hyphenated UUID), used verbatim.
//! 3. A hex prefix of length >= 4; exactly one match resolves, zero is
//!    NotFound, more than one is Ambiguous with all matches reported.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::error::FracError;
use crate::repo::Repository;
use crate::snapshot::Snapshot;

/// Prefix candidates beyond this are not collected; hitting the cap already
/// means "at least 2", i.e. ambiguous.
const MAX_PREFIX_MATCHES: usize = 64;

/// Minimum accepted prefix length.
const MIN_PREFIX_LEN: usize = 4;

#[derive(Debug)]
pub struct SnapshotStore {
    repo: Repository,
    branch: String,
}

impl SnapshotStore {
    /// Open the store for `branch`, migrating any legacy flat layout first.
    pub fn open(repo: &Repository, branch: &str) -> Result<SnapshotStore> {
        repo.migrate_legacy_layout(branch)?;
        let dir = repo.snapshots_dir(branch);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create directory: {}", dir.display()))?;
        Ok(SnapshotStore {
            repo: repo.clone(),
            branch: branch.to_string(),
        })
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn snapshot_path(&self, id: &str) -> PathBuf {
        self.repo
            .snapshots_dir(&self.branch)
            .join(format!("{}.json", id))
    }

    /// Persist a record. Snapshots are immutable: rewriting an existing id is
    /// only accepted when the bytes are identical (idempotent).
    pub fn write(&self, snapshot: &Snapshot) -> Result<()> {
        let path = self.snapshot_path(&snapshot.id);
        let json = snapshot.to_json()?;

        if path.exists() {
            let existing = fs::read_to_string(&path)
                .with_context(|| format!("failed to read snapshot: {}", path.display()))?;
            if existing == json {
                return Ok(());
            }
            anyhow::bail!(
                "snapshot already exists and differs: {} (snapshots are immutable)",
                path.display()
            );
        }

        crate::repo::atomic_write(&path, json.as_bytes())
            .with_context(|| format!("failed to persist snapshot: {}", path.display()))
    }

    /// Load one record by exact id.
    pub fn read(&self, id: &str) -> Result<Snapshot> {
        let path = self.snapshot_path(id);
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FracError::SnapshotNotFound(id.to_string()).into());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read snapshot: {}", path.display()))
            }
        };
        Snapshot::from_json(&json)
            .with_context(|| format!("failed to parse snapshot: {}", path.display()))
    }

    /// Delete one record by exact id. The blobs it references are retained.
    pub fn delete(&self, id: &str) -> Result<()> {
        let path = self.snapshot_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FracError::SnapshotNotFound(id.to_string()).into())
            }
            Err(e) => {
                Err(e).with_context(|| format!("failed to delete snapshot: {}", path.display()))
            }
        }
    }

    /// All parseable records on this branch, unordered. Corrupt files are
    /// warned about and skipped so one bad record never hides the rest.
    pub fn list(&self) -> Result<Vec<Snapshot>> {
        let dir = self.repo.snapshots_dir(&self.branch);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read snapshots directory: {}", dir.display())
                })
            }
        };

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry
                .with_context(|| format!("failed to read snapshots directory: {}", dir.display()))?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let json = fs::read_to_string(&path)
                .with_context(|| format!("failed to read snapshot: {}", path.display()))?;
            match Snapshot::from_json(&json) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    log::warn!("skipping unparseable snapshot {}: {:#}", path.display(), e);
                }
            }
        }
        Ok(snapshots)
    }

    /// All records, newest first (timestamp descending, id as tiebreak).
    pub fn list_chronological(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots = self.list()?;
        snapshots.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(snapshots)
    }

    /// Chronologically latest record, if any.
    pub fn latest(&self) -> Result<Option<Snapshot>> {
        Ok(self.list_chronological()?.into_iter().next())
    }

    /// Resolve a user-supplied identifier to an exact snapshot id.
    pub fn resolve(&self, input: &str) -> Result<String> {
        // Form 1: -N, the N-th most recent.
        if let Some(rest) = input.strip_prefix('-') {
            if let Ok(n) = rest.parse::<usize>() {
                if n >= 1 {
                    let snapshots = self.list_chronological()?;
                    return snapshots
                        .get(n - 1)
                        .map(|s| s.id.clone())
                        .ok_or_else(|| FracError::SnapshotNotFound(input.to_string()).into());
                }
            }
        }

        // Form 2: full identifier, verbatim.
        if is_full_id(input) {
            self.read(input)?;
            return Ok(input.to_string());
        }

        // Form 3: hex prefix.
        if input.chars().all(|c| c.is_ascii_hexdigit()) && !input.is_empty() {
            if input.len() < MIN_PREFIX_LEN {
                return Err(FracError::PrefixTooShort(input.to_string()).into());
            }
            let mut matches = Vec::new();
            for snapshot in self.list()? {
                if snapshot.id.starts_with(input) {
                    matches.push(snapshot.id);
                    if matches.len() >= MAX_PREFIX_MATCHES {
                        break;
                    }
                }
            }
            return match matches.len() {
                0 => Err(FracError::SnapshotNotFound(input.to_string()).into()),
                1 => Ok(matches.remove(0)),
                _ => {
                    matches.sort();
                    Err(FracError::SnapshotAmbiguous {
                        prefix: input.to_string(),
                        matches,
                    }
                    .into())
                }
            };
        }

        Err(FracError::SnapshotNotFound(input.to_string()).into())
    }
}

/// Delete pipeline: resolve the identifier, take the repository lock, remove
/// the record, and clear `CURRENT` when it named the deleted snapshot. Blob
/// retention is unchanged. Returns the resolved id.
pub fn delete_snapshot(
    repo: &Repository,
    target: &str,
    branch: Option<&str>,
    lock_timeout: std::time::Duration,
) -> Result<String> {
    let branch = branch
        .map(str::to_string)
        .unwrap_or_else(|| repo.current_branch());
    let store = SnapshotStore::open(repo, &branch)?;
    let id = store.resolve(target)?;

    let _lock = crate::lock::RepoLock::wait_acquire(repo, lock_timeout)?;
    store.delete(&id)?;
    if repo.read_current(&branch)?.as_deref() == Some(id.as_str()) {
        repo.clear_current(&branch)?;
    }
    log::info!("deleted snapshot {} on branch {}", id, branch);
    Ok(id)
}

/// 64 hex chars, or a UUID with hyphens at the standard positions.
fn is_full_id(s: &str) -> bool {
    if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()) {
        return true;
    }
    if s.len() == 36 {
        return s.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        });
    }
    false
}
