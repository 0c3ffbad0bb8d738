// Stamps the build's source-control state into `frac --version`.
//
// Inside a git checkout the binary reports `<crate version>+<commit>` (with
// a `-dirty` marker when the tree has uncommitted changes), matching the
// commit/dirty probe the engine runs against user repositories in
// fractyl-core/src/scm.rs. Outside a checkout (release tarball, vendored
// build) the plain crate version is used.

use std::process::Command;

fn main() {
    println!("cargo:rustc-env=FRACTYL_VERSION={}", version_string());
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
}

fn version_string() -> String {
    let base = env!("CARGO_PKG_VERSION");
    match build_commit() {
        Some(commit) => format!("{}+{}", base, commit),
        None => base.to_string(),
    }
}

/// Short commit id of the checkout being built, with a dirty marker.
/// None when git is unavailable or this is not a checkout.
fn build_commit() -> Option<String> {
    let commit = git_stdout(&["rev-parse", "--short=9", "HEAD"])?;
    if commit.is_empty() {
        return None;
    }
    let dirty = git_stdout(&["status", "--porcelain"]).is_some_and(|out| !out.is_empty());
    if dirty {
        Some(format!("{}-dirty", commit))
    } else {
        Some(commit)
    }
}

fn git_stdout(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
