//! Fractyl core - content-addressed snapshots of a working directory
//!
//! A local time machine for arbitrary file state: capture on demand or on a
//! schedule, then list, inspect, diff, restore, and delete snapshots.
//! Snapshots are partitioned by the current source-control branch.

// Global invariants enforced in this crate:
// - Blobs are immutable and addressed by SHA-256 of their bytes
// - An index serializes deterministically; equal bytes mean "no change"
// - The stat cache is an optimization only; losing it never loses data
// - Every mutating pipeline holds the repository lock; read paths never do
// - CURRENT is updated strictly after the snapshot record is durable

pub mod commit;
pub mod daemon;
pub mod diff;
pub mod error;
pub mod hash;
pub mod ignore;
pub mod index;
pub mod lock;
pub mod object_store;
pub mod repo;
pub mod restore;
pub mod scanner;
pub mod scm;
pub mod snapshot;
pub mod stat_index;
pub mod store;

pub use commit::{commit, CommitOptions, CommitOutcome};
pub use error::FracError;
pub use hash::Hash;
pub use index::{Index, IndexEntry};
pub use object_store::ObjectStore;
pub use repo::Repository;
pub use restore::{restore, RestoreOptions, RestoreSummary};
pub use scanner::{ScanProgress, ScanStats};
pub use snapshot::Snapshot;
pub use store::SnapshotStore;
