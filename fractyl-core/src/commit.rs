//! Commit pipeline
//!
//! Captures the current working tree as a snapshot: acquire the repository
//! lock, load the prior index named by `CURRENT`, scan, and persist. A scan
//! whose index serializes to the same bytes as the prior index is "no
//! changes" and creates nothing.
//!
//! `CURRENT` is updated strictly after the snapshot record is durably
//! written, so an observer reading `CURRENT` then the named record always
//! sees a valid snapshot.

use std::time::Duration;

use anyhow::Result;
use chrono::{SubsecRound, Utc};

use crate::ignore::IgnoreSet;
use crate::index::Index;
use crate::lock::RepoLock;
use crate::object_store::ObjectStore;
use crate::repo::Repository;
use crate::scanner::{ScanOptions, ScanProgress, ScanStats, Scanner};
use crate::scm;
use crate::snapshot::{new_snapshot_id, Snapshot};
use crate::store::SnapshotStore;

/// Default bound on waiting for the repository lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Description given to the first snapshot on a branch when none is supplied.
const INITIAL_DESCRIPTION: &str = "working";

/// Hex characters of the parent id appended to a divergent description.
const DIVERGENT_SUFFIX_LEN: usize = 6;

#[derive(Debug, Clone)]
pub struct CommitOptions {
    /// Snapshot description; derived from the parent's when absent.
    pub description: Option<String>,
    /// Branch to commit under; probed from source control when absent.
    pub branch: Option<String>,
    pub lock_timeout: Duration,
    pub scan: ScanOptions,
}

impl Default for CommitOptions {
    fn default() -> Self {
        CommitOptions {
            description: None,
            branch: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            scan: ScanOptions::default(),
        }
    }
}

#[derive(Debug)]
pub enum CommitOutcome {
    Created {
        snapshot: Snapshot,
        stats: ScanStats,
    },
    NoChanges,
}

/// Run the commit pipeline under the repository lock.
pub fn commit(
    repo: &Repository,
    options: &CommitOptions,
    progress: Option<&ScanProgress>,
) -> Result<CommitOutcome> {
    let _lock = RepoLock::wait_acquire(repo, options.lock_timeout)?;
    run_locked(repo, options, progress)
}

/// Commit body for callers that already hold the repository lock (restore's
/// safety snapshot, the daemon tick).
pub(crate) fn run_locked(
    repo: &Repository,
    options: &CommitOptions,
    progress: Option<&ScanProgress>,
) -> Result<CommitOutcome> {
    let branch = options
        .branch
        .clone()
        .unwrap_or_else(|| repo.current_branch());
    let snapshots = SnapshotStore::open(repo, &branch)?;
    let objects = ObjectStore::open(repo);

    let current_id = repo.read_current(&branch)?;

    // Prior state: the snapshot CURRENT names and its index blob. A dangling
    // CURRENT (snapshot deleted out from under it) degrades to "no prior".
    let mut parent_snapshot: Option<Snapshot> = None;
    let mut prior_bytes: Option<Vec<u8>> = None;
    let mut prior_index: Option<Index> = None;
    if let Some(id) = &current_id {
        match snapshots.read(id) {
            Ok(snapshot) => {
                match objects
                    .get(&snapshot.index_hash)
                    .and_then(|bytes| Ok((Index::decode(&bytes)?, bytes)))
                {
                    Ok((index, bytes)) => {
                        prior_index = Some(index);
                        prior_bytes = Some(bytes);
                    }
                    Err(e) => {
                        log::warn!("failed to load prior index for {}: {:#}", id, e);
                    }
                }
                parent_snapshot = Some(snapshot);
            }
            Err(e) => {
                log::warn!("CURRENT names a missing snapshot {}: {:#}", id, e);
            }
        }
    }

    let ignores = IgnoreSet::load(repo.root());
    let mut stat_index = crate::stat_index::StatIndex::open(repo, &branch);
    let mut scanner =
        Scanner::new(repo, &objects, &ignores).with_options(options.scan.clone());
    if let Some(progress) = progress {
        scanner = scanner.with_progress(progress);
    }
    let outcome = scanner.scan(prior_index.as_ref(), &mut stat_index)?;

    let new_bytes = outcome.index.encode();
    if prior_bytes.as_deref() == Some(new_bytes.as_slice()) {
        return Ok(CommitOutcome::NoChanges);
    }

    let index_hash = objects.put_bytes(&new_bytes)?;
    let id = new_snapshot_id();

    // Divergent commit: the parent is not the branch's chronological tip.
    let divergent = match (&current_id, snapshots.latest()?) {
        (Some(current), Some(tip)) => tip.id != *current,
        _ => false,
    };

    let parent = if parent_snapshot.is_some() {
        current_id.clone()
    } else {
        None
    };
    let description = options.description.clone().unwrap_or_else(|| {
        derive_description(
            parent_snapshot.as_ref().map(|s| s.description.as_str()),
            current_id.as_deref(),
            divergent,
        )
    });

    // Truncated to the timestamp format's resolution so the in-memory record
    // equals its persisted form.
    let snapshot = Snapshot::new(
        id.clone(),
        parent,
        description,
        Utc::now().trunc_subsecs(0),
        index_hash,
        scm::probe(repo.root()),
    );
    snapshots.write(&snapshot)?;
    repo.write_current(&branch, &id)?;

    log::info!(
        "created snapshot {} on branch {} ({} files)",
        id,
        branch,
        outcome.index.len()
    );
    Ok(CommitOutcome::Created {
        snapshot,
        stats: outcome.stats,
    })
}

/// Derive a description from the parent's: strip any trailing ` +N` and
/// append ` +(N+1)`. A divergent commit instead appends `-<6-hex>` of the
/// parent id to the base.
fn derive_description(
    parent_description: Option<&str>,
    parent_id: Option<&str>,
    divergent: bool,
) -> String {
    let Some(parent_description) = parent_description else {
        return INITIAL_DESCRIPTION.to_string();
    };
    let (base, n) = split_increment(parent_description);
    if divergent {
        let suffix: String = parent_id
            .unwrap_or("")
            .chars()
            .take(DIVERGENT_SUFFIX_LEN)
            .collect();
        format!("{}-{}", base, suffix)
    } else {
        format!("{} +{}", base, n + 1)
    }
}

/// Split a trailing ` +N` increment suffix off a description.
fn split_increment(description: &str) -> (&str, u64) {
    if let Some((base, suffix)) = description.rsplit_once(" +") {
        if let Ok(n) = suffix.parse::<u64>() {
            return (base, n);
        }
    }
    (description, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_description() {
        assert_eq!(derive_description(None, None, false), "working");
    }

    #[test]
    fn test_increment_chain() {
        assert_eq!(
            derive_description(Some("working"), Some("id"), false),
            "working +1"
        );
        assert_eq!(
            derive_description(Some("working +1"), Some("id"), false),
            "working +2"
        );
        assert_eq!(
            derive_description(Some("working +9"), Some("id"), false),
            "working +10"
        );
    }

    #[test]
    fn test_non_numeric_suffix_not_an_increment() {
        assert_eq!(
            derive_description(Some("fix +wip"), Some("id"), false),
            "fix +wip +1"
        );
    }

    #[test]
    fn test_divergent_suffix_from_parent_id() {
        assert_eq!(
            derive_description(
                Some("working +3"),
                Some("3f2a9c1e-0000-4000-8000-1234567890ab"),
                true
            ),
            "working-3f2a9c"
        );
    }
}
