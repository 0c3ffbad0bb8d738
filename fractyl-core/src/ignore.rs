//! Working-tree exclusion rules
//!
//! A compiled glob set over repo-relative paths, built from a default
//! exclude list plus one optional `.fracignore` file at the repository root
//! (one glob per line, `#` comments). Patterns without a `/` match at any
//! depth, gitignore-style.

use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};

/// Default exclude patterns applied when no ignore file is present.
/// The scanner's own metadata directory is excluded separately.
const DEFAULT_EXCLUDES: &[&str] = &[".git", "**/.git", ".git/**", "**/.git/**"];

/// Name of the per-repository ignore file.
pub const IGNORE_FILE: &str = ".fracignore";

#[derive(Debug)]
pub struct IgnoreSet {
    globs: GlobSet,
}

impl IgnoreSet {
    /// Build the exclusion set for `repo_root`. Unparseable ignore lines are
    /// warned about and skipped; they never abort a scan.
    pub fn load(repo_root: &Path) -> IgnoreSet {
        let mut builder = GlobSetBuilder::new();

        for pattern in DEFAULT_EXCLUDES {
            builder.add(Glob::new(pattern).expect("default exclude patterns are valid"));
        }

        let ignore_path = repo_root.join(IGNORE_FILE);
        if let Ok(contents) = std::fs::read_to_string(&ignore_path) {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                for pattern in expand(line) {
                    match Glob::new(&pattern) {
                        Ok(glob) => {
                            builder.add(glob);
                        }
                        Err(e) => {
                            log::warn!(
                                "{}: skipping unparseable pattern '{}': {}",
                                IGNORE_FILE,
                                line,
                                e
                            );
                            break;
                        }
                    }
                }
            }
        }

        let globs = builder.build().unwrap_or_else(|e| {
            log::warn!("failed to compile ignore patterns, using defaults: {}", e);
            let mut fallback = GlobSetBuilder::new();
            for pattern in DEFAULT_EXCLUDES {
                fallback.add(Glob::new(pattern).expect("default exclude patterns are valid"));
            }
            fallback.build().expect("default exclude set compiles")
        });

        IgnoreSet { globs }
    }

    /// Should `rel_path` (forward slashes, repo-relative) be skipped?
    /// Directories are also matched with a trailing slash-insensitive form so
    /// `build/**`-style patterns prune the directory itself.
    pub fn should_ignore(&self, rel_path: &str, is_dir: bool) -> bool {
        if self.globs.is_match(rel_path) {
            return true;
        }
        // A directory is prunable when its contents would all be ignored.
        is_dir && self.globs.is_match(format!("{}/", rel_path))
    }
}

/// Anchor-free patterns match at any depth, and a bare name also matches the
/// whole subtree beneath a directory of that name.
fn expand(line: &str) -> Vec<String> {
    if line.contains('/') {
        vec![line.trim_end_matches('/').to_string()]
    } else {
        vec![
            line.to_string(),
            format!("**/{}", line),
            format!("{}/**", line),
            format!("**/{}/**", line),
        ]
    }
}
