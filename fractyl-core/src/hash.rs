//! SHA-256 hash primitives
//!
//! Every blob, index, and snapshot reference is addressed by the SHA-256 of
//! its bytes, rendered as 64 lower-case hex characters. Equality is bytewise;
//! the all-zero hash is reserved as a sentinel and never addresses content.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::FracError;

/// Raw hash width in bytes.
pub const HASH_LEN: usize = 32;

/// Hex rendering width.
pub const HEX_LEN: usize = 64;

/// Read buffer for streaming file hashes.
const CHUNK_SIZE: usize = 8 * 1024;

/// A SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    /// Reserved sentinel; never the address of stored content.
    pub const ZERO: Hash = Hash([0u8; HASH_LEN]);

    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Hash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_LEN]
    }

    /// 64-char lower-case hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-char hex string. Rejects wrong lengths and non-hex input.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != HEX_LEN {
            return Err(FracError::InvalidFormat(format!(
                "hash must be {} hex characters, got {}",
                HEX_LEN,
                s.len()
            ))
            .into());
        }
        let bytes = hex::decode(s)
            .map_err(|e| FracError::InvalidFormat(format!("invalid hex in hash: {}", e)))?;
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&bytes);
        Ok(Hash(out))
    }

    /// First `n` bytes of the digest, for truncated storage.
    pub fn prefix(&self, n: usize) -> &[u8] {
        &self.0[..n.min(HASH_LEN)]
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Hash an in-memory buffer.
pub fn hash_bytes(buf: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(buf);
    Hash(hasher.finalize().into())
}

/// Hash a file by streaming it in 8 KiB chunks.
pub fn hash_file(path: &Path) -> Result<Hash> {
    let mut file = File::open(path)
        .with_context(|| format!("failed to open file for hashing: {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("failed to read file for hashing: {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Hash(hasher.finalize().into()))
}
