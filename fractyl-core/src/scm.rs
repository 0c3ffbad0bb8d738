//! Source-control probe
//!
//! Best-effort queries against the surrounding git repository, used to stamp
//! snapshots with branch/commit/dirty metadata and to partition snapshots by
//! branch. Uses the git CLI directly (no libgit2) for portability; every
//! query degrades to "unknown" outside a git repository or when git is not
//! installed.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};

/// Source-control state observed at snapshot time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScmInfo {
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub dirty: bool,
    /// `git status --porcelain` lines, verbatim.
    pub status: Vec<String>,
}

/// Execute a git command in `repo_path` and return the trimmed stdout.
fn git_at(repo_path: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .current_dir(repo_path)
        .args(args)
        .output()
        .context("failed to invoke git")?;

    if !output.status.success() {
        anyhow::bail!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Current branch name, None when detached or not in a git repository.
pub fn current_branch(repo_path: &Path) -> Option<String> {
    git_at(repo_path, &["symbolic-ref", "--short", "HEAD"])
        .ok()
        .filter(|s| !s.is_empty())
}

/// Current commit id, None when there is no HEAD to resolve.
pub fn current_commit(repo_path: &Path) -> Option<String> {
    git_at(repo_path, &["rev-parse", "HEAD"])
        .ok()
        .filter(|s| !s.is_empty())
}

/// Porcelain status lines; empty outside a repository or when clean.
pub fn status_lines(repo_path: &Path) -> Vec<String> {
    match git_at(repo_path, &["status", "--porcelain"]) {
        Ok(out) if !out.is_empty() => out.lines().map(|l| l.to_string()).collect(),
        _ => Vec::new(),
    }
}

/// Gather everything a snapshot records about the surrounding repository.
pub fn probe(repo_path: &Path) -> ScmInfo {
    let status = status_lines(repo_path);
    ScmInfo {
        branch: current_branch(repo_path),
        commit: current_commit(repo_path),
        dirty: !status.is_empty(),
        status,
    }
}
