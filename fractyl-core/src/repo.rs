//! Repository layout and path derivation
//!
//! Everything Fractyl persists lives under a single `.fractyl/` directory at
//! the repository root:
//!
//! ```text
//! .fractyl/
//!   objects/XX/YY...                  # content-addressed blobs
//!   cache/index_<branch>.bin          # binary stat-index
//!   refs/heads/<branch>/
//!     snapshots/<id>.json
//!     CURRENT                         # id the working tree reflects
//!   index                             # live index written by restore
//!   daemon.pid
//!   daemon.log
//!   lock                              # advisory exclusive lock file
//! ```
//!
//! Branch names are sanitized before they become path components. When no
//! source-control branch is available, the literal branch `main` is used.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::FracError;
use crate::scm;

/// Name of the repository metadata directory.
pub const FRACTYL_DIR: &str = ".fractyl";

/// Branch used when the working tree is not under source control.
pub const DEFAULT_BRANCH: &str = "main";

/// Characters replaced by `-` when a branch name becomes a path component.
const BRANCH_UNSAFE: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Handle to an initialized repository root.
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    /// Create the `.fractyl/` layout under `root`. Idempotent.
    pub fn init(root: &Path) -> Result<Repository> {
        let repo = Repository {
            root: root.to_path_buf(),
        };
        for dir in [
            repo.fractyl_dir(),
            repo.objects_dir(),
            repo.cache_dir(),
            repo.snapshots_dir(DEFAULT_BRANCH),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create directory: {}", dir.display()))?;
        }
        let live_index = repo.live_index_path();
        if !live_index.exists() {
            crate::index::Index::new().save(&live_index)?;
        }
        Ok(repo)
    }

    /// Walk up from `start` looking for a `.fractyl/` directory.
    pub fn discover(start: &Path) -> Result<Repository> {
        let mut dir = Some(start);
        while let Some(d) = dir {
            if d.join(FRACTYL_DIR).is_dir() {
                return Ok(Repository {
                    root: d.to_path_buf(),
                });
            }
            dir = d.parent();
        }
        Err(FracError::NotAtRoot.into())
    }

    /// Open an existing repository whose root is already known.
    pub fn open(root: &Path) -> Result<Repository> {
        if !root.join(FRACTYL_DIR).is_dir() {
            return Err(FracError::NotAtRoot.into());
        }
        Ok(Repository {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fractyl_dir(&self) -> PathBuf {
        self.root.join(FRACTYL_DIR)
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.fractyl_dir().join("objects")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.fractyl_dir().join("cache")
    }

    pub fn stat_index_path(&self, branch: &str) -> PathBuf {
        self.cache_dir()
            .join(format!("index_{}.bin", sanitize_branch(branch)))
    }

    pub fn refs_dir(&self) -> PathBuf {
        self.fractyl_dir().join("refs").join("heads")
    }

    pub fn branch_dir(&self, branch: &str) -> PathBuf {
        self.refs_dir().join(sanitize_branch(branch))
    }

    pub fn snapshots_dir(&self, branch: &str) -> PathBuf {
        self.branch_dir(branch).join("snapshots")
    }

    pub fn current_path(&self, branch: &str) -> PathBuf {
        self.branch_dir(branch).join("CURRENT")
    }

    /// Live index written by restore; no core read path depends on it.
    pub fn live_index_path(&self) -> PathBuf {
        self.fractyl_dir().join("index")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.fractyl_dir().join("lock")
    }

    pub fn daemon_pid_path(&self) -> PathBuf {
        self.fractyl_dir().join("daemon.pid")
    }

    pub fn daemon_log_path(&self) -> PathBuf {
        self.fractyl_dir().join("daemon.log")
    }

    /// Current source-control branch, or `main` when none is available.
    pub fn current_branch(&self) -> String {
        scm::current_branch(&self.root).unwrap_or_else(|| DEFAULT_BRANCH.to_string())
    }

    /// Read the snapshot id the working tree reflects, if any.
    pub fn read_current(&self, branch: &str) -> Result<Option<String>> {
        let path = self.current_path(branch);
        match fs::read_to_string(&path) {
            Ok(s) => {
                let id = s.trim().to_string();
                Ok(if id.is_empty() { None } else { Some(id) })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("failed to read CURRENT: {}", path.display()))
            }
        }
    }

    pub fn write_current(&self, branch: &str, id: &str) -> Result<()> {
        let path = self.current_path(branch);
        atomic_write(&path, format!("{}\n", id).as_bytes())
            .with_context(|| format!("failed to write CURRENT: {}", path.display()))
    }

    pub fn clear_current(&self, branch: &str) -> Result<()> {
        let path = self.current_path(branch);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to remove CURRENT: {}", path.display()))
            }
        }
    }

    /// Move a pre-branch flat layout (`.fractyl/snapshots/`, `.fractyl/CURRENT`)
    /// into the branch-partitioned locations. No-op once migrated.
    pub fn migrate_legacy_layout(&self, branch: &str) -> Result<()> {
        let legacy_snapshots = self.fractyl_dir().join("snapshots");
        let branch_snapshots = self.snapshots_dir(branch);

        if legacy_snapshots.is_dir() && !branch_snapshots.exists() {
            log::info!(
                "migrating legacy snapshot layout to branch '{}'",
                sanitize_branch(branch)
            );
            fs::create_dir_all(self.branch_dir(branch)).with_context(|| {
                format!(
                    "failed to create branch directory: {}",
                    self.branch_dir(branch).display()
                )
            })?;
            fs::rename(&legacy_snapshots, &branch_snapshots).with_context(|| {
                format!(
                    "failed to migrate snapshots to {}",
                    branch_snapshots.display()
                )
            })?;
        }

        let legacy_current = self.fractyl_dir().join("CURRENT");
        let branch_current = self.current_path(branch);
        if legacy_current.is_file() && !branch_current.exists() {
            fs::rename(&legacy_current, &branch_current).with_context(|| {
                format!("failed to migrate CURRENT to {}", branch_current.display())
            })?;
        }

        Ok(())
    }
}

/// Replace path-hostile characters in a branch name with `-`.
pub fn sanitize_branch(branch: &str) -> String {
    branch
        .chars()
        .map(|c| if BRANCH_UNSAFE.contains(&c) { '-' } else { c })
        .collect()
}

/// Write data to a file atomically using temp file + rename.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }

    let temp_path = path.with_extension("tmp");

    let mut file = fs::File::create(&temp_path)
        .with_context(|| format!("failed to create temp file: {}", temp_path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("failed to write to temp file: {}", temp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to sync temp file: {}", temp_path.display()))?;
    drop(file);

    fs::rename(&temp_path, path)
        .with_context(|| format!("failed to rename temp file to: {}", path.display()))?;

    Ok(())
}
