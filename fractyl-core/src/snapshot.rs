//! Snapshot record and JSON codec
//!
//! A snapshot is an immutable metadata envelope: id, optional parent id,
//! description, timestamp, the hash of its serialized index blob, and the
//! source-control state observed at capture time. Parent pointers form a DAG
//! per branch; roots have no parent.
//!
//! Persisted as one JSON document per snapshot. Timestamps use strict
//! `%Y-%m-%dT%H:%M:%SZ`; `git_dirty` serializes as 0/1; unknown fields are
//! ignored on load so newer writers stay readable.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::Hash;
use crate::scm::ScmInfo;

/// Strict timestamp format shared by serializer and parser.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Snapshot {
    /// UUID of this snapshot.
    pub id: String,
    /// Parent snapshot id; None for roots (serialized as null).
    pub parent: Option<String>,
    pub description: String,
    #[serde(with = "timestamp_format")]
    pub timestamp: DateTime<Utc>,
    /// Hash of the serialized index blob in the object store.
    pub index_hash: Hash,
    #[serde(default)]
    pub git_status: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    #[serde(default, with = "dirty_flag")]
    pub git_dirty: bool,
}

impl Snapshot {
    /// Assemble a new record from pipeline state and the SCM probe result.
    pub fn new(
        id: String,
        parent: Option<String>,
        description: String,
        timestamp: DateTime<Utc>,
        index_hash: Hash,
        scm: ScmInfo,
    ) -> Snapshot {
        Snapshot {
            id,
            parent,
            description,
            timestamp,
            index_hash,
            git_status: scm.status,
            git_branch: scm.branch,
            git_commit: scm.commit,
            git_dirty: scm.dirty,
        }
    }

    /// Serialize to JSON (deterministic field order from the struct).
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize snapshot to JSON")
    }

    /// Deserialize from JSON. Unknown fields are ignored.
    pub fn from_json(json: &str) -> Result<Snapshot> {
        serde_json::from_str(json).context("failed to deserialize snapshot from JSON")
    }
}

/// Generate a snapshot id.
pub fn new_snapshot_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

mod timestamp_format {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    use super::TIMESTAMP_FORMAT;

    pub fn serialize<S: Serializer>(
        ts: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        let naive = NaiveDateTime::parse_from_str(&s, TIMESTAMP_FORMAT)
            .map_err(serde::de::Error::custom)?;
        Ok(naive.and_utc())
    }
}

mod dirty_flag {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dirty: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*dirty))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        let n = i64::deserialize(deserializer)?;
        Ok(n != 0)
    }
}
