//! Caller-distinguishable error kinds.
//!
//! Most operations return `anyhow::Result` with path context attached at the
//! failure site. The variants below are the cases a caller needs to match on
//! (resolver outcomes, lock contention, format violations); they are created
//! at the decision point and travel through `anyhow`, where the CLI recovers
//! them by downcast.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FracError {
    /// No `.fractyl` directory in the current directory or any ancestor.
    #[error("not inside a fractyl repository (no .fractyl directory found)")]
    NotAtRoot,

    /// The resolver found no snapshot for the given identifier.
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// The resolver found more than one snapshot for a prefix.
    #[error("ambiguous snapshot prefix '{prefix}' matches: {}", .matches.join(", "))]
    SnapshotAmbiguous {
        prefix: String,
        matches: Vec<String>,
    },

    /// Prefix inputs must be at least 4 hex characters.
    #[error("snapshot prefix '{0}' is too short (minimum 4 characters)")]
    PrefixTooShort(String),

    /// A durable file failed its magic/version/checksum validation.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// The repository lock is held by another process (non-blocking probe).
    #[error("repository is locked by another process")]
    LockBusy,

    /// The repository lock could not be acquired within the timeout.
    #[error("timed out waiting for repository lock after {0} seconds")]
    LockTimeout(u64),
}
