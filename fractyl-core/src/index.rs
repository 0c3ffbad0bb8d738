//! In-memory index and its binary codec
//!
//! An index is an ordered list of `(path, hash, mode, size, mtime)` entries
//! describing one tree state. Paths use forward slashes, are repo-relative,
//! and are unique within an index. The serialized form is deterministic given
//! the same entries in insertion order, which is what lets the commit
//! pipeline detect "no change" by comparing bytes.
//!
//! Serialized layout (little-endian):
//!
//! ```text
//! magic "FIDX" | u32 version=1 | u32 count |
//!   repeated { u16 path_len | path bytes | 32 hash bytes |
//!              u32 mode | i64 size | i64 mtime }
//! ```
//!
//! An index is itself content-addressed: its bytes are stored as a blob whose
//! hash is the `index_hash` referenced by a snapshot.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::error::FracError;
use crate::hash::{Hash, HASH_LEN};
use crate::repo;

pub const INDEX_MAGIC: &[u8; 4] = b"FIDX";
pub const INDEX_VERSION: u32 = 1;

/// One tracked file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Repo-relative path, forward slashes, no leading slash.
    pub path: String,
    pub hash: Hash,
    /// POSIX mode bits.
    pub mode: u32,
    pub size: u64,
    /// Seconds since epoch.
    pub mtime: i64,
}

/// Ordered sequence of entries with O(1) path lookup.
#[derive(Debug, Default, Clone)]
pub struct Index {
    entries: Vec<IndexEntry>,
    by_path: HashMap<String, usize>,
}

impl Index {
    pub fn new() -> Index {
        Index::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert with last-write-wins semantics on duplicate paths. A duplicate
    /// keeps its original position in the entry order.
    pub fn add(&mut self, entry: IndexEntry) {
        match self.by_path.get(&entry.path) {
            Some(&i) => self.entries[i] = entry,
            None => self.add_direct(entry),
        }
    }

    /// O(1) append that assumes the path is not already present. Used by the
    /// scanner fast path, where uniqueness is guaranteed by construction.
    pub fn add_direct(&mut self, entry: IndexEntry) {
        debug_assert!(!self.by_path.contains_key(&entry.path));
        self.by_path.insert(entry.path.clone(), self.entries.len());
        self.entries.push(entry);
    }

    /// Remove an entry by path, preserving the order of the rest.
    pub fn remove(&mut self, path: &str) -> Option<IndexEntry> {
        let i = self.by_path.remove(path)?;
        let entry = self.entries.remove(i);
        for idx in self.by_path.values_mut() {
            if *idx > i {
                *idx -= 1;
            }
        }
        Some(entry)
    }

    pub fn find(&self, path: &str) -> Option<&IndexEntry> {
        self.by_path.get(path).map(|&i| &self.entries[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter()
    }

    /// Serialize to the FIDX binary form.
    pub fn encode(&self) -> Vec<u8> {
        // Fixed per-entry cost past the path: hash + mode + size + mtime.
        let fixed = HASH_LEN + 4 + 8 + 8 + 2;
        let cap = 12 + self
            .entries
            .iter()
            .map(|e| fixed + e.path.len())
            .sum::<usize>();
        let mut out = Vec::with_capacity(cap);

        out.extend_from_slice(INDEX_MAGIC);
        out.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());

        for entry in &self.entries {
            let path = entry.path.as_bytes();
            out.extend_from_slice(&(path.len() as u16).to_le_bytes());
            out.extend_from_slice(path);
            out.extend_from_slice(entry.hash.as_bytes());
            out.extend_from_slice(&entry.mode.to_le_bytes());
            out.extend_from_slice(&(entry.size as i64).to_le_bytes());
            out.extend_from_slice(&entry.mtime.to_le_bytes());
        }

        out
    }

    /// Parse the FIDX binary form. Magic/version/truncation failures are
    /// `FracError::InvalidFormat`.
    pub fn decode(data: &[u8]) -> Result<Index> {
        let mut cursor = Cursor { data, pos: 0 };

        let magic = cursor.take(4)?;
        if magic != INDEX_MAGIC {
            return Err(FracError::InvalidFormat("bad index magic".into()).into());
        }
        let version = cursor.read_u32()?;
        if version != INDEX_VERSION {
            return Err(FracError::InvalidFormat(format!(
                "unsupported index version {} (expected {})",
                version, INDEX_VERSION
            ))
            .into());
        }
        let count = cursor.read_u32()? as usize;

        let mut index = Index::new();
        for _ in 0..count {
            let path_len = cursor.read_u16()? as usize;
            let path_bytes = cursor.take(path_len)?;
            let path = std::str::from_utf8(path_bytes)
                .map_err(|_| FracError::InvalidFormat("index path is not UTF-8".into()))?
                .to_string();

            let mut hash_bytes = [0u8; HASH_LEN];
            hash_bytes.copy_from_slice(cursor.take(HASH_LEN)?);

            let mode = cursor.read_u32()?;
            let size = cursor.read_i64()? as u64;
            let mtime = cursor.read_i64()?;

            if index.find(&path).is_some() {
                return Err(
                    FracError::InvalidFormat(format!("duplicate index path: {}", path)).into(),
                );
            }
            index.add_direct(IndexEntry {
                path,
                hash: Hash::from_bytes(hash_bytes),
                mode,
                size,
                mtime,
            });
        }

        Ok(index)
    }

    /// Atomically write the serialized index to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        repo::atomic_write(path, &self.encode())
            .with_context(|| format!("failed to save index: {}", path.display()))
    }

    /// Load an index from `path`. An absent file is an empty index.
    pub fn load(path: &Path) -> Result<Index> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Index::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read index: {}", path.display()))
            }
        };
        Index::decode(&data).with_context(|| format!("failed to parse index: {}", path.display()))
    }
}

/// Bounds-checked byte reader for the decoder.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(FracError::InvalidFormat("truncated index".into()).into());
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    fn entry(path: &str, contents: &[u8]) -> IndexEntry {
        IndexEntry {
            path: path.to_string(),
            hash: hash_bytes(contents),
            mode: 0o100644,
            size: contents.len() as u64,
            mtime: 1_700_000_000,
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut index = Index::new();
        index.add_direct(entry("a.txt", b"hello\n"));
        index.add_direct(entry("dir/b.txt", b"world\n"));

        let bytes = index.encode();
        let decoded = Index::decode(&bytes).unwrap();

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.find("a.txt"), index.find("a.txt"));
        assert_eq!(decoded.find("dir/b.txt"), index.find("dir/b.txt"));
        // Deterministic: re-encoding yields identical bytes.
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut bytes = Index::new().encode();
        bytes[0] = b'X';
        let err = Index::decode(&bytes).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FracError>(),
            Some(FracError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let mut bytes = Index::new().encode();
        bytes[4] = 99;
        assert!(Index::decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let mut index = Index::new();
        index.add_direct(entry("a.txt", b"hello\n"));
        let bytes = index.encode();
        assert!(Index::decode(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_add_last_write_wins() {
        let mut index = Index::new();
        index.add(entry("a.txt", b"one"));
        index.add(entry("b.txt", b"two"));
        index.add(entry("a.txt", b"three"));

        assert_eq!(index.len(), 2);
        assert_eq!(index.find("a.txt").unwrap().hash, hash_bytes(b"three"));
        // Position preserved: a.txt still serializes first.
        let decoded = Index::decode(&index.encode()).unwrap();
        assert_eq!(decoded.iter().next().unwrap().path, "a.txt");
    }

    #[test]
    fn test_remove_preserves_order_and_lookup() {
        let mut index = Index::new();
        index.add_direct(entry("a", b"1"));
        index.add_direct(entry("b", b"2"));
        index.add_direct(entry("c", b"3"));

        let removed = index.remove("b").unwrap();
        assert_eq!(removed.path, "b");
        assert_eq!(index.len(), 2);
        assert!(index.find("b").is_none());
        assert_eq!(index.find("c").unwrap().hash, hash_bytes(b"3"));

        let order: Vec<_> = index.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(order, vec!["a", "c"]);
        assert!(index.remove("missing").is_none());
    }

    #[test]
    fn test_load_absent_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::load(&dir.path().join("none.bin")).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");

        let mut index = Index::new();
        index.add_direct(entry("x/y.txt", b"zzz"));
        index.save(&path).unwrap();

        let loaded = Index::load(&path).unwrap();
        assert_eq!(loaded.encode(), index.encode());
    }
}
