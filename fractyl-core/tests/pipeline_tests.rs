//! End-to-end pipeline tests: commit, restore, delete, and their contracts.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use fractyl_core::commit::{commit, CommitOptions, CommitOutcome};
use fractyl_core::error::FracError;
use fractyl_core::hash::hash_bytes;
use fractyl_core::index::Index;
use fractyl_core::lock::RepoLock;
use fractyl_core::object_store::ObjectStore;
use fractyl_core::restore::{restore, RestoreOptions};
use fractyl_core::snapshot::Snapshot;
use fractyl_core::store::{delete_snapshot, SnapshotStore};
use fractyl_core::Repository;

fn init_repo() -> (tempfile::TempDir, Repository) {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repository::init(dir.path()).unwrap();
    (dir, repo)
}

fn commit_with(repo: &Repository, message: &str) -> Snapshot {
    let options = CommitOptions {
        description: Some(message.to_string()),
        ..CommitOptions::default()
    };
    match commit(repo, &options, None).unwrap() {
        CommitOutcome::Created { snapshot, .. } => snapshot,
        CommitOutcome::NoChanges => panic!("expected a snapshot, got no changes"),
    }
}

fn commit_derived(repo: &Repository) -> CommitOutcome {
    commit(repo, &CommitOptions::default(), None).unwrap()
}

fn snapshot_count(repo: &Repository) -> usize {
    SnapshotStore::open(repo, "main")
        .unwrap()
        .list()
        .unwrap()
        .len()
}

/// Every regular file outside `.fractyl`, path -> contents.
fn tree_contents(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut map = BTreeMap::new();
    let walker = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".fractyl");
    for entry in walker {
        let entry = entry.unwrap();
        if entry.file_type().is_file() {
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .to_string();
            map.insert(rel, fs::read(entry.path()).unwrap());
        }
    }
    map
}

// S1: init creates the layout and no CURRENT.
#[test]
fn test_init_layout() {
    let (_dir, repo) = init_repo();
    assert!(repo.objects_dir().is_dir());
    assert!(repo.snapshots_dir("main").is_dir());
    assert!(!repo.current_path("main").exists());
}

// S2: a trivial commit content-addresses both the file and its index.
#[test]
fn test_trivial_commit() {
    let (_dir, repo) = init_repo();
    fs::write(repo.root().join("a.txt"), b"hello\n").unwrap();

    let snapshot = commit_with(&repo, "first");
    assert_eq!(snapshot.description, "first");
    assert_eq!(snapshot.parent, None);

    let objects = ObjectStore::open(&repo);

    // The blob of a.txt is stored under SHA256("hello\n").
    let blob_hash = hash_bytes(b"hello\n");
    assert!(objects.exists(&blob_hash));
    assert_eq!(objects.get(&blob_hash).unwrap(), b"hello\n");

    // The snapshot's index_hash is the SHA-256 of the one-entry index blob.
    let index_bytes = objects.get(&snapshot.index_hash).unwrap();
    assert_eq!(hash_bytes(&index_bytes), snapshot.index_hash);
    let index = Index::decode(&index_bytes).unwrap();
    assert_eq!(index.len(), 1);
    assert_eq!(index.find("a.txt").unwrap().hash, blob_hash);

    // CURRENT now names the snapshot.
    assert_eq!(repo.read_current("main").unwrap(), Some(snapshot.id));
}

// S3: a commit with no filesystem changes creates nothing.
#[test]
fn test_no_op_commit() {
    let (_dir, repo) = init_repo();
    fs::write(repo.root().join("a.txt"), b"hello\n").unwrap();
    commit_with(&repo, "first");
    assert_eq!(snapshot_count(&repo), 1);

    match commit_derived(&repo) {
        CommitOutcome::NoChanges => {}
        CommitOutcome::Created { .. } => panic!("expected no changes"),
    }
    assert_eq!(snapshot_count(&repo), 1);
}

// S4: modify, commit, restore -2 brings the old contents back.
#[test]
fn test_modify_and_restore() {
    let (_dir, repo) = init_repo();
    let path = repo.root().join("a.txt");
    fs::write(&path, b"hello\n").unwrap();
    let first = commit_with(&repo, "first");

    // -N resolution orders by the second-resolution timestamp.
    std::thread::sleep(Duration::from_millis(1100));
    fs::write(&path, b"world\n").unwrap();
    commit_with(&repo, "second");

    let summary = restore(&repo, "-2", &RestoreOptions::default()).unwrap();
    assert_eq!(summary.id, first.id);
    assert_eq!(fs::read(&path).unwrap(), b"hello\n");
    assert_eq!(repo.read_current("main").unwrap(), Some(first.id));
}

// S5: restore deletes files the target snapshot does not contain.
#[test]
fn test_restore_removes_extra_files() {
    let (_dir, repo) = init_repo();
    fs::write(repo.root().join("a.txt"), b"hello\n").unwrap();
    commit_with(&repo, "first");

    std::thread::sleep(Duration::from_millis(1100));
    fs::write(repo.root().join("b.txt"), b"extra\n").unwrap();
    commit_with(&repo, "with-b");

    let summary = restore(&repo, "-2", &RestoreOptions::default()).unwrap();
    assert_eq!(summary.pruned, 1);
    assert!(!repo.root().join("b.txt").exists());
    assert!(repo.root().join("a.txt").exists());
}

// S6: ambiguous prefix reported with all matches; unique prefix deletes.
#[test]
fn test_delete_prefix_resolution() {
    let (_dir, repo) = init_repo();
    let store = SnapshotStore::open(&repo, "main").unwrap();

    // Fabricate two snapshots sharing a 5-char prefix.
    for (id, ts) in [
        ("abcde111-0000-4000-8000-000000000001", 100),
        ("abcde222-0000-4000-8000-000000000002", 200),
    ] {
        let snapshot = Snapshot::from_json(&format!(
            r#"{{
                "id": "{}",
                "parent": null,
                "description": "fixture",
                "timestamp": "2024-01-18T12:30:{:02}Z",
                "index_hash": "{}",
                "git_status": [],
                "git_dirty": 0
            }}"#,
            id,
            ts % 60,
            hash_bytes(b"index").to_hex()
        ))
        .unwrap();
        store.write(&snapshot).unwrap();
    }

    let err = delete_snapshot(&repo, "abcd", None, Duration::from_secs(1)).unwrap_err();
    match err.downcast_ref::<FracError>() {
        Some(FracError::SnapshotAmbiguous { matches, .. }) => assert_eq!(matches.len(), 2),
        other => panic!("expected ambiguous, got {:?}", other),
    }

    delete_snapshot(
        &repo,
        "abcde111-0000-4000-8000-000000000001",
        None,
        Duration::from_secs(1),
    )
    .unwrap();

    // Now unique.
    let deleted = delete_snapshot(&repo, "abcd", None, Duration::from_secs(1)).unwrap();
    assert_eq!(deleted, "abcde222-0000-4000-8000-000000000002");
    assert_eq!(snapshot_count(&repo), 0);
}

// Property 2: restore reproduces the captured tree from any later state.
#[test]
fn test_round_trip_full_tree() {
    let (_dir, repo) = init_repo();
    fs::write(repo.root().join("a.txt"), b"alpha\n").unwrap();
    fs::create_dir_all(repo.root().join("sub/deep")).unwrap();
    fs::write(repo.root().join("sub/b.txt"), b"beta\n").unwrap();
    fs::write(repo.root().join("sub/deep/c.bin"), [0u8, 1, 2, 3]).unwrap();

    let captured = tree_contents(repo.root());
    let first = commit_with(&repo, "baseline");

    // Mutate heavily.
    fs::remove_file(repo.root().join("a.txt")).unwrap();
    fs::write(repo.root().join("sub/b.txt"), b"changed\n").unwrap();
    fs::write(repo.root().join("new.txt"), b"new\n").unwrap();
    commit_with(&repo, "mutated");

    restore(&repo, &first.id, &RestoreOptions::default()).unwrap();
    assert_eq!(tree_contents(repo.root()), captured);
}

// Restore puts recorded permission bits back.
#[test]
fn test_restore_preserves_mode() {
    let (_dir, repo) = init_repo();
    let script = repo.root().join("run.sh");
    fs::write(&script, b"#!/bin/sh\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    let first = commit_with(&repo, "exec");

    fs::remove_file(&script).unwrap();
    commit_with(&repo, "gone");

    restore(&repo, &first.id, &RestoreOptions::default()).unwrap();
    let mode = fs::symlink_metadata(&script).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
}

// Restore prunes emptied directories but leaves ignored files alone.
#[test]
fn test_restore_prunes_dirs_and_spares_ignored() {
    let (_dir, repo) = init_repo();
    fs::write(repo.root().join(".fracignore"), b"*.log\n").unwrap();
    fs::write(repo.root().join("a.txt"), b"a\n").unwrap();
    let first = commit_with(&repo, "first");

    fs::create_dir_all(repo.root().join("scratch")).unwrap();
    fs::write(repo.root().join("scratch/tmp.txt"), b"tmp\n").unwrap();
    commit_with(&repo, "second");
    fs::write(repo.root().join("debug.log"), b"ignored\n").unwrap();

    restore(&repo, &first.id, &RestoreOptions::default()).unwrap();
    assert!(!repo.root().join("scratch").exists());
    assert_eq!(fs::read(repo.root().join("debug.log")).unwrap(), b"ignored\n");
}

// A dirty tree gets a safety snapshot before the restore rewrites it.
#[test]
fn test_restore_captures_safety_snapshot() {
    let (_dir, repo) = init_repo();
    let path = repo.root().join("a.txt");
    fs::write(&path, b"v1\n").unwrap();
    let first = commit_with(&repo, "first");
    fs::write(&path, b"v2\n").unwrap();
    commit_with(&repo, "second");

    // Uncommitted edit on top of the second snapshot.
    fs::write(&path, b"v3-uncommitted\n").unwrap();

    let summary = restore(&repo, &first.id, &RestoreOptions::default()).unwrap();
    let safety = summary.safety_snapshot.expect("safety snapshot captured");
    assert_eq!(snapshot_count(&repo), 3);
    assert_eq!(fs::read(&path).unwrap(), b"v1\n");

    // The safety snapshot holds the uncommitted state.
    restore(&repo, &safety, &RestoreOptions::default()).unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"v3-uncommitted\n");
}

// Restoring the snapshot CURRENT already names takes no safety snapshot.
#[test]
fn test_restore_to_current_skips_safety() {
    let (_dir, repo) = init_repo();
    let path = repo.root().join("a.txt");
    fs::write(&path, b"v1\n").unwrap();
    let first = commit_with(&repo, "first");

    fs::write(&path, b"scribble\n").unwrap();
    let summary = restore(&repo, &first.id, &RestoreOptions::default()).unwrap();
    assert_eq!(summary.safety_snapshot, None);
    assert_eq!(snapshot_count(&repo), 1);
    assert_eq!(fs::read(&path).unwrap(), b"v1\n");
}

// Derived descriptions: "working", then "working +1", "working +2".
#[test]
fn test_description_increments() {
    let (_dir, repo) = init_repo();
    let path = repo.root().join("a.txt");

    fs::write(&path, b"v1\n").unwrap();
    let s1 = match commit_derived(&repo) {
        CommitOutcome::Created { snapshot, .. } => snapshot,
        _ => panic!("expected snapshot"),
    };
    assert_eq!(s1.description, "working");

    fs::write(&path, b"v2\n").unwrap();
    let s2 = match commit_derived(&repo) {
        CommitOutcome::Created { snapshot, .. } => snapshot,
        _ => panic!("expected snapshot"),
    };
    assert_eq!(s2.description, "working +1");
    assert_eq!(s2.parent, Some(s1.id));

    fs::write(&path, b"v3\n").unwrap();
    let s3 = match commit_derived(&repo) {
        CommitOutcome::Created { snapshot, .. } => snapshot,
        _ => panic!("expected snapshot"),
    };
    assert_eq!(s3.description, "working +2");
}

// A commit whose parent is not the chronological tip gets the divergent
// suffix instead of an increment.
#[test]
fn test_divergent_description() {
    let (_dir, repo) = init_repo();
    let path = repo.root().join("a.txt");

    fs::write(&path, b"v1\n").unwrap();
    let s1 = match commit_derived(&repo) {
        CommitOutcome::Created { snapshot, .. } => snapshot,
        _ => panic!("expected snapshot"),
    };
    std::thread::sleep(Duration::from_millis(1100));

    fs::write(&path, b"v2\n").unwrap();
    match commit_derived(&repo) {
        CommitOutcome::Created { .. } => {}
        _ => panic!("expected snapshot"),
    }
    std::thread::sleep(Duration::from_millis(1100));

    // Step back to s1, then commit something new on top of it.
    restore(&repo, &s1.id, &RestoreOptions::default()).unwrap();
    fs::write(&path, b"v3\n").unwrap();
    let s3 = match commit_derived(&repo) {
        CommitOutcome::Created { snapshot, .. } => snapshot,
        _ => panic!("expected snapshot"),
    };

    let expected_suffix: String = s1.id.chars().take(6).collect();
    assert_eq!(s3.description, format!("working-{}", expected_suffix));
    assert_eq!(s3.parent, Some(s1.id));
}

// A dangling CURRENT (snapshot deleted out from under it) degrades to
// "no prior snapshot" instead of failing the commit.
#[test]
fn test_dangling_current_tolerated() {
    let (_dir, repo) = init_repo();
    fs::write(repo.root().join("a.txt"), b"v1\n").unwrap();
    let s1 = commit_with(&repo, "first");

    // Delete the record but leave CURRENT pointing at it.
    SnapshotStore::open(&repo, "main")
        .unwrap()
        .delete(&s1.id)
        .unwrap();
    assert_eq!(repo.read_current("main").unwrap(), Some(s1.id));

    fs::write(repo.root().join("a.txt"), b"v2\n").unwrap();
    let s2 = match commit_derived(&repo) {
        CommitOutcome::Created { snapshot, .. } => snapshot,
        _ => panic!("expected snapshot"),
    };
    assert_eq!(s2.parent, None);
    assert_eq!(s2.description, "working");
}

// Deleting the snapshot CURRENT names clears CURRENT.
#[test]
fn test_delete_clears_current() {
    let (_dir, repo) = init_repo();
    fs::write(repo.root().join("a.txt"), b"v1\n").unwrap();
    let s1 = commit_with(&repo, "first");

    delete_snapshot(&repo, &s1.id, None, Duration::from_secs(1)).unwrap();
    assert_eq!(repo.read_current("main").unwrap(), None);
}

// Property 8: commit pipelines are mutually exclusive.
#[test]
fn test_commit_blocked_by_held_lock() {
    let (_dir, repo) = init_repo();
    fs::write(repo.root().join("a.txt"), b"v1\n").unwrap();

    let held = RepoLock::try_acquire(&repo).unwrap();
    let options = CommitOptions {
        description: Some("blocked".to_string()),
        lock_timeout: Duration::from_millis(300),
        ..CommitOptions::default()
    };
    let err = commit(&repo, &options, None).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FracError>(),
        Some(FracError::LockTimeout(_))
    ));
    assert_eq!(snapshot_count(&repo), 0);

    drop(held);
    assert!(matches!(
        commit(&repo, &options, None).unwrap(),
        CommitOutcome::Created { .. }
    ));
}

// Property 4 at pipeline level: commit after restore is a no-op.
#[test]
fn test_commit_after_restore_detects_no_changes() {
    let (_dir, repo) = init_repo();
    fs::write(repo.root().join("a.txt"), b"v1\n").unwrap();
    fs::write(repo.root().join("b.txt"), b"b\n").unwrap();
    let first = commit_with(&repo, "first");

    fs::write(repo.root().join("a.txt"), b"v2\n").unwrap();
    commit_with(&repo, "second");

    restore(&repo, &first.id, &RestoreOptions::default()).unwrap();
    match commit_derived(&repo) {
        CommitOutcome::NoChanges => {}
        CommitOutcome::Created { .. } => panic!("restored tree should commit as no changes"),
    }
}

// Property 9 at pipeline level: branches never see each other's snapshots.
#[test]
fn test_branch_partitioned_pipelines() {
    let (_dir, repo) = init_repo();
    let path = repo.root().join("a.txt");

    fs::write(&path, b"main line\n").unwrap();
    let main_options = CommitOptions {
        description: Some("on main".to_string()),
        branch: Some("main".to_string()),
        ..CommitOptions::default()
    };
    let on_main = match commit(&repo, &main_options, None).unwrap() {
        CommitOutcome::Created { snapshot, .. } => snapshot,
        _ => panic!("expected snapshot"),
    };

    fs::write(&path, b"feature line\n").unwrap();
    let feature_options = CommitOptions {
        description: Some("on feature".to_string()),
        branch: Some("feature/x".to_string()),
        ..CommitOptions::default()
    };
    let on_feature = match commit(&repo, &feature_options, None).unwrap() {
        CommitOutcome::Created { snapshot, .. } => snapshot,
        _ => panic!("expected snapshot"),
    };

    // Each branch lists only its own snapshot.
    let main_store = SnapshotStore::open(&repo, "main").unwrap();
    let feature_store = SnapshotStore::open(&repo, "feature/x").unwrap();
    assert_eq!(main_store.list().unwrap().len(), 1);
    assert_eq!(feature_store.list().unwrap().len(), 1);

    // Prefixes do not resolve across branches.
    let feature_prefix: String = on_feature.id.chars().take(8).collect();
    assert!(main_store.resolve(&feature_prefix).is_err());
    let main_prefix: String = on_main.id.chars().take(8).collect();
    assert!(feature_store.resolve(&main_prefix).is_err());

    // The feature commit has no parent: CURRENT on feature/x was empty.
    assert_eq!(on_feature.parent, None);

    // Per-branch CURRENT files track independently.
    assert_eq!(repo.read_current("main").unwrap(), Some(on_main.id));
    assert_eq!(repo.read_current("feature/x").unwrap(), Some(on_feature.id));
}

// Property 8: two racing commits serialize; the change is captured once.
#[test]
fn test_concurrent_commits_capture_once() {
    let (_dir, repo) = init_repo();
    fs::write(repo.root().join("a.txt"), b"racy\n").unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let repo = repo.clone();
        handles.push(std::thread::spawn(move || {
            let options = CommitOptions {
                description: Some("race".to_string()),
                ..CommitOptions::default()
            };
            commit(&repo, &options, None).unwrap()
        }));
    }

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let created = outcomes
        .iter()
        .filter(|o| matches!(o, CommitOutcome::Created { .. }))
        .count();

    // One writer won; the loser saw the already-captured state.
    assert_eq!(created, 1);
    assert_eq!(snapshot_count(&repo), 1);
}

// The legacy flat layout is migrated the first time a store opens.
#[test]
fn test_legacy_layout_migrated_on_open() {
    let (_dir, repo) = init_repo();
    fs::write(repo.root().join("a.txt"), b"v1\n").unwrap();
    let first = commit_with(&repo, "first");

    // Rewind the on-disk layout to the pre-branch era.
    let branch_dir = repo.branch_dir("main");
    fs::rename(
        repo.snapshots_dir("main"),
        repo.fractyl_dir().join("snapshots"),
    )
    .unwrap();
    fs::rename(
        repo.current_path("main"),
        repo.fractyl_dir().join("CURRENT"),
    )
    .unwrap();
    fs::remove_dir_all(&branch_dir).unwrap();

    // Opening the store migrates; the old snapshot is visible again.
    let store = SnapshotStore::open(&repo, "main").unwrap();
    assert_eq!(store.list().unwrap().len(), 1);
    assert_eq!(repo.read_current("main").unwrap(), Some(first.id.clone()));
    assert!(!repo.fractyl_dir().join("snapshots").exists());

    // And the next commit chains onto the migrated history.
    fs::write(repo.root().join("a.txt"), b"v2\n").unwrap();
    let second = match commit_derived(&repo) {
        CommitOutcome::Created { snapshot, .. } => snapshot,
        _ => panic!("expected snapshot"),
    };
    assert_eq!(second.parent, Some(first.id));
}
