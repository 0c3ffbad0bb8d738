//! Three-phase working-tree scanner
//!
//! Produces a new in-memory index for the current working tree while doing
//! the minimum file I/O and hashing:
//!
//! - *Phase 1* stats every path the stat-index already tracks, in parallel
//!   over partitioned slices, then sequentially copies unchanged entries
//!   from the prior index and rehashes the rest.
//! - *Phase 2* walks the tree for paths the stat-index has never seen.
//! - *Phase 3* persists the stat-index; failure here is a warning, never a
//!   failed scan.
//!
//! Entry order is Phase 1's stat-index iteration order followed by Phase 2's
//! sorted depth-first traversal order, so a scan that finds nothing changed
//! emits an index byte-identical to the prior one.
//!
//! Exclusions: ignore-engine matches, the `.fractyl/` directory, files over
//! 1 GiB (warned), and any directory with a `.git` child (a nested
//! source-control root; never descended into).

use std::collections::HashMap;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::ignore::IgnoreSet;
use crate::index::{Index, IndexEntry};
use crate::object_store::ObjectStore;
use crate::repo::{Repository, FRACTYL_DIR};
use crate::stat_index::{StatIndex, StatStatus};

/// Files larger than this are skipped with a diagnostic.
pub const MAX_FILE_SIZE: u64 = 1 << 30;

/// Partition width for the Phase-1 parallel stat sweep.
const STAT_WORKERS: usize = 8;

/// A stat-index younger than this may justify skipping Phase 2.
const FRESH_WINDOW_SECS: u64 = 300;

/// Shared counters a progress observer may poll while a scan runs.
#[derive(Debug, Default)]
pub struct ScanProgress {
    pub statted: AtomicUsize,
    pub hashed: AtomicUsize,
    pub discovered: AtomicUsize,
}

/// Per-scan tallies, reported after the scan completes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanStats {
    /// Tracked paths examined in Phase 1.
    pub scanned: usize,
    /// Entries copied from the prior index without rehashing.
    pub unchanged: usize,
    /// Files re-read and hashed in Phase 1.
    pub hashed: usize,
    /// Files discovered in Phase 2.
    pub new_files: usize,
    /// Tracked paths that vanished or stopped being regular files.
    pub deleted: usize,
    /// Files omitted from the index (unreadable or oversized).
    pub skipped: usize,
}

/// Result of a scan.
#[derive(Debug)]
pub struct ScanOutcome {
    pub index: Index,
    pub stats: ScanStats,
    pub phase2_skipped: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Opt-in latency optimization: skip Phase 2 when Phase 1 saw no changes
    /// and the stat-index was saved within the freshness window. Off by
    /// default because it can miss files created since the last scan.
    pub skip_fresh_phase2: bool,
}

pub struct Scanner<'a> {
    repo: &'a Repository,
    store: &'a ObjectStore,
    ignores: &'a IgnoreSet,
    options: ScanOptions,
    progress: Option<&'a ScanProgress>,
}

impl<'a> Scanner<'a> {
    pub fn new(repo: &'a Repository, store: &'a ObjectStore, ignores: &'a IgnoreSet) -> Self {
        Scanner {
            repo,
            store,
            ignores,
            options: ScanOptions::default(),
            progress: None,
        }
    }

    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_progress(mut self, progress: &'a ScanProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Build a new index for the working tree. `prior` is the index of the
    /// snapshot the tree was last synchronized with, when one exists.
    pub fn scan(&self, prior: Option<&Index>, stat_index: &mut StatIndex) -> Result<ScanOutcome> {
        let was_fresh = self.stat_index_is_fresh(stat_index);

        let mut index = Index::new();
        let mut stats = ScanStats::default();
        let changes = self.phase1(prior, stat_index, &mut index, &mut stats);

        let phase2_skipped =
            self.options.skip_fresh_phase2 && changes == 0 && was_fresh && !stat_index.is_empty();
        if phase2_skipped {
            log::debug!("stat-index fresh and unchanged, skipping discovery walk");
        } else {
            self.phase2(stat_index, &mut index, &mut stats);
        }

        // Keep stat-index iteration order aligned with the index just
        // emitted; deletions move records and would otherwise change the
        // next scan's emit order.
        stat_index.reorder_to(index.iter().map(|e| e.path.as_str()));

        // Phase 3: the stat-index is recoverable, so saving it must never
        // fail the scan.
        if let Err(e) = stat_index.save(self.repo) {
            log::warn!("failed to save stat-index (next scan runs cold): {:#}", e);
        }

        log::debug!(
            "scan: {} tracked, {} unchanged, {} hashed, {} new, {} deleted, {} skipped",
            stats.scanned,
            stats.unchanged,
            stats.hashed,
            stats.new_files,
            stats.deleted,
            stats.skipped
        );

        Ok(ScanOutcome {
            index,
            stats,
            phase2_skipped,
        })
    }

    fn stat_index_is_fresh(&self, stat_index: &StatIndex) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        stat_index.timestamp() > 0
            && now.saturating_sub(stat_index.timestamp()) < FRESH_WINDOW_SECS
    }

    /// Parallel stat of every tracked path, then a sequential pass that
    /// copies unchanged entries and rehashes the rest. Returns the number of
    /// observed changes (deletions plus non-unchanged statuses).
    fn phase1(
        &self,
        prior: Option<&Index>,
        stat_index: &mut StatIndex,
        index: &mut Index,
        stats: &mut ScanStats,
    ) -> usize {
        let tracked: Vec<String> = stat_index.paths().map(str::to_string).collect();
        if tracked.is_empty() {
            return 0;
        }
        let absolute: Vec<PathBuf> = tracked.iter().map(|p| self.repo.root().join(p)).collect();

        // Partitioned sweep: each worker stats its own slice, no shared
        // mutable state; collect preserves slice order.
        let slice_len = absolute.len().div_ceil(STAT_WORKERS).max(1);
        let metas: Vec<Option<Metadata>> = absolute
            .par_chunks(slice_len)
            .flat_map_iter(|slice| {
                slice.iter().map(|path| {
                    let meta = std::fs::symlink_metadata(path)
                        .ok()
                        .filter(Metadata::is_file);
                    if let Some(progress) = self.progress {
                        progress.statted.fetch_add(1, Ordering::Relaxed);
                    }
                    meta
                })
            })
            .collect();

        // One pass over the prior index makes the "find previous entry"
        // lookup O(1); the map is discarded after Phase 1.
        let prior_by_path: HashMap<&str, &IndexEntry> = prior
            .map(|ix| ix.iter().map(|e| (e.path.as_str(), e)).collect())
            .unwrap_or_default();

        let mut changes = 0usize;
        for ((path, abs), meta) in tracked.iter().zip(&absolute).zip(metas) {
            stats.scanned += 1;

            let Some(meta) = meta else {
                stat_index.remove(path);
                stats.deleted += 1;
                changes += 1;
                continue;
            };

            if stat_index.status(path, &meta) == StatStatus::Unchanged {
                if let Some(prev) = prior_by_path.get(path.as_str()) {
                    index.add_direct((*prev).clone());
                    stats.unchanged += 1;
                    continue;
                }
                // No prior entry to copy; rehash below without counting a
                // change.
            } else {
                changes += 1;
            }

            self.hash_into(index, stat_index, path, abs, &meta, stats);
        }
        changes
    }

    /// Depth-first discovery walk for paths not yet in the new index.
    fn phase2(&self, stat_index: &mut StatIndex, index: &mut Index, stats: &mut ScanStats) {
        let root = self.repo.root().to_path_buf();
        let walker = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| self.should_descend(&root, entry));

        for result in walker {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    // Aborts only the failing subtree; the walk continues.
                    log::warn!("skipping unreadable directory entry: {}", e);
                    continue;
                }
            };
            if entry.depth() == 0 || !entry.file_type().is_file() {
                continue;
            }

            let Some(rel) = relative_path(&root, entry.path()) else {
                continue;
            };
            if index.find(&rel).is_some() {
                continue;
            }
            if self.ignores.should_ignore(&rel, false) {
                continue;
            }

            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    log::warn!("skipping {}: {}", rel, e);
                    stats.skipped += 1;
                    continue;
                }
            };
            if !meta.is_file() {
                continue;
            }

            stats.new_files += 1;
            if let Some(progress) = self.progress {
                progress.discovered.fetch_add(1, Ordering::Relaxed);
            }
            self.hash_into(index, stat_index, &rel, entry.path(), &meta, stats);
        }
    }

    /// Hash one file into the object store and record it in the new index
    /// and the stat-index. Failures are logged and the file is omitted.
    fn hash_into(
        &self,
        index: &mut Index,
        stat_index: &mut StatIndex,
        rel: &str,
        abs: &Path,
        meta: &Metadata,
        stats: &mut ScanStats,
    ) {
        if meta.size() > MAX_FILE_SIZE {
            log::warn!("skipping {} (larger than 1 GiB)", rel);
            stats.skipped += 1;
            return;
        }

        match self.store.put_file(abs) {
            Ok(hash) => {
                index.add_direct(IndexEntry {
                    path: rel.to_string(),
                    hash,
                    mode: meta.mode(),
                    size: meta.size(),
                    mtime: meta.mtime(),
                });
                stat_index.update(rel, meta, &hash);
                stats.hashed += 1;
                if let Some(progress) = self.progress {
                    progress.hashed.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                log::warn!("skipping {}: {:#}", rel, e);
                stats.skipped += 1;
            }
        }
    }

    fn should_descend(&self, root: &Path, entry: &walkdir::DirEntry) -> bool {
        should_descend(root, self.ignores, entry)
    }
}

/// Directory pruning shared by the discovery walk and the restore pruning
/// walk: never enter `.fractyl`, ignored directories, or nested
/// source-control roots.
pub(crate) fn should_descend(
    root: &Path,
    ignores: &IgnoreSet,
    entry: &walkdir::DirEntry,
) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    if entry.file_name() == FRACTYL_DIR {
        return false;
    }
    if entry.file_type().is_dir() {
        if entry.path().join(".git").exists() {
            log::debug!("submodule boundary: {}", entry.path().display());
            return false;
        }
        if let Some(rel) = relative_path(root, entry.path()) {
            if ignores.should_ignore(&rel, true) {
                return false;
            }
        }
    }
    true
}

/// Repo-relative path with forward slashes.
pub(crate) fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let s = rel.to_string_lossy();
    if s.is_empty() {
        return None;
    }
    Some(s.replace('\\', "/"))
}
