//! Persistent per-branch stat-index
//!
//! A binary cache of "what the scanner last saw on disk": one fixed-size
//! record of stat metadata per tracked path, with paths in a trailing
//! variable-length section so the fixed region can be memory-mapped and
//! walked without allocation. An in-memory map (path -> record slot) gives
//! O(1) lookup.
//!
//! This file is an optimization only. Losing or corrupting it must not lose
//! user data: any magic/version/checksum failure is treated as "not present"
//! and the scanner degrades to a full rehash.
//!
//! On-disk layout (little-endian):
//!
//! ```text
//! header (40 bytes):
//!   magic "FRAC" | u32 version | u32 count | u32 checksum |
//!   branch [16, NUL-padded] | u64 timestamp
//! record (92 bytes each):
//!   i64 mtime_sec | i64 mtime_nsec | i64 ctime_sec | i64 ctime_nsec |
//!   u64 size | u64 inode | u64 device |
//!   u32 mode | u32 uid | u32 gid |
//!   hash prefix [20] | u16 path_len | u16 flags
//! paths: concatenated UTF-8, in record order
//! ```
//!
//! The checksum is CRC-32 of the record and path sections. The stored hash
//! prefix is the first 20 bytes of the full SHA-256 and is a redundancy field
//! only; authoritative hashes live in the object store and index blobs.

use std::collections::HashMap;
use std::fs::{File, Metadata};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use memmap2::Mmap;

use crate::hash::Hash;
use crate::repo::{self, Repository};

pub const STAT_INDEX_MAGIC: &[u8; 4] = b"FRAC";
pub const STAT_INDEX_VERSION: u32 = 1;

const HEADER_SIZE: usize = 40;
const RECORD_SIZE: usize = 92;
const BRANCH_FIELD: usize = 16;
const HASH_PREFIX_LEN: usize = 20;

/// Record carries real data (guards against half-written records).
pub const FLAG_PRESENT: u16 = 0x1;

/// Last-seen stat metadata for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatRecord {
    pub path: String,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
    pub ctime_sec: i64,
    pub ctime_nsec: i64,
    pub size: u64,
    pub inode: u64,
    pub device: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub hash_prefix: [u8; HASH_PREFIX_LEN],
    pub flags: u16,
}

impl StatRecord {
    fn from_stat(path: &str, meta: &Metadata, hash: &Hash) -> StatRecord {
        let mut hash_prefix = [0u8; HASH_PREFIX_LEN];
        hash_prefix.copy_from_slice(hash.prefix(HASH_PREFIX_LEN));
        StatRecord {
            path: path.to_string(),
            mtime_sec: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
            ctime_sec: meta.ctime(),
            ctime_nsec: meta.ctime_nsec(),
            size: meta.size(),
            inode: meta.ino(),
            device: meta.dev(),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            hash_prefix,
            flags: FLAG_PRESENT,
        }
    }
}

/// Comparison of a recorded stat against the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatStatus {
    /// All of (mtime_sec, size, inode, mode, ctime_sec) match.
    Unchanged,
    Changed,
    /// No record for the path.
    New,
}

/// Branch-scoped stat cache with O(1) path lookup.
#[derive(Debug)]
pub struct StatIndex {
    branch: String,
    /// Seconds since epoch of the last successful save; 0 when never saved.
    timestamp: u64,
    records: Vec<StatRecord>,
    by_path: HashMap<String, usize>,
}

impl StatIndex {
    /// Fresh, empty index for `branch`.
    pub fn empty(branch: &str) -> StatIndex {
        StatIndex {
            branch: branch.to_string(),
            timestamp: 0,
            records: Vec::new(),
            by_path: HashMap::new(),
        }
    }

    /// Memory-map and parse the on-disk file if present and valid; any
    /// corruption or version mismatch degrades to an empty index.
    pub fn open(repo: &Repository, branch: &str) -> StatIndex {
        let path = repo.stat_index_path(branch);
        match Self::load(&path, branch) {
            Ok(index) => index,
            Err(e) => {
                if path.exists() {
                    log::warn!(
                        "stat-index {} unusable, rebuilding cold: {:#}",
                        path.display(),
                        e
                    );
                }
                StatIndex::empty(branch)
            }
        }
    }

    fn load(path: &Path, branch: &str) -> Result<StatIndex> {
        let file = File::open(path)
            .with_context(|| format!("failed to open stat-index: {}", path.display()))?;
        // Safety: the map is read-only and parsed into owned storage before
        // this function returns; mutation of the file during the parse is
        // excluded by the repository lock held by every writer.
        let map = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to map stat-index: {}", path.display()))?;
        Self::parse(&map, branch)
    }

    fn parse(data: &[u8], branch: &str) -> Result<StatIndex> {
        use crate::error::FracError::InvalidFormat;

        if data.len() < HEADER_SIZE {
            return Err(InvalidFormat("stat-index shorter than header".into()).into());
        }
        if &data[0..4] != STAT_INDEX_MAGIC {
            return Err(InvalidFormat("bad stat-index magic".into()).into());
        }
        let version = read_u32(data, 4);
        if version != STAT_INDEX_VERSION {
            return Err(InvalidFormat(format!(
                "unsupported stat-index version {} (expected {})",
                version, STAT_INDEX_VERSION
            ))
            .into());
        }
        let count = read_u32(data, 8) as usize;
        let checksum = read_u32(data, 12);
        let timestamp = read_u64(data, 32);

        let records_end = HEADER_SIZE
            .checked_add(count.checked_mul(RECORD_SIZE).ok_or_else(|| {
                InvalidFormat("stat-index record count overflows".into())
            })?)
            .ok_or_else(|| InvalidFormat("stat-index record count overflows".into()))?;
        if records_end > data.len() {
            return Err(InvalidFormat("stat-index truncated in record section".into()).into());
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data[HEADER_SIZE..]);
        if hasher.finalize() != checksum {
            return Err(InvalidFormat("stat-index checksum mismatch".into()).into());
        }

        let mut records = Vec::with_capacity(count);
        let mut by_path = HashMap::with_capacity(count);
        let mut path_pos = records_end;

        for i in 0..count {
            let base = HEADER_SIZE + i * RECORD_SIZE;
            let path_len = read_u16(data, base + 88) as usize;
            let flags = read_u16(data, base + 90);

            if path_pos + path_len > data.len() {
                return Err(InvalidFormat("stat-index truncated in path section".into()).into());
            }
            let path = std::str::from_utf8(&data[path_pos..path_pos + path_len])
                .map_err(|_| InvalidFormat("stat-index path is not UTF-8".into()))?
                .to_string();
            path_pos += path_len;

            // Half-written records never get their PRESENT bit; drop them.
            if flags & FLAG_PRESENT == 0 {
                continue;
            }

            let mut hash_prefix = [0u8; HASH_PREFIX_LEN];
            hash_prefix.copy_from_slice(&data[base + 68..base + 88]);

            by_path.insert(path.clone(), records.len());
            records.push(StatRecord {
                path,
                mtime_sec: read_i64(data, base),
                mtime_nsec: read_i64(data, base + 8),
                ctime_sec: read_i64(data, base + 16),
                ctime_nsec: read_i64(data, base + 24),
                size: read_u64(data, base + 32),
                inode: read_u64(data, base + 40),
                device: read_u64(data, base + 48),
                mode: read_u32(data, base + 56),
                uid: read_u32(data, base + 60),
                gid: read_u32(data, base + 64),
                hash_prefix,
                flags,
            });
        }

        Ok(StatIndex {
            branch: branch.to_string(),
            timestamp,
            records,
            by_path,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Seconds since epoch of the last save; 0 when the cache is cold.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn lookup(&self, path: &str) -> Option<&StatRecord> {
        self.by_path.get(path).map(|&i| &self.records[i])
    }

    /// Tracked paths in record order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.path.as_str())
    }

    /// Compare the recorded stat for `path` against `meta`.
    pub fn status(&self, path: &str, meta: &Metadata) -> StatStatus {
        match self.lookup(path) {
            None => StatStatus::New,
            Some(rec) => {
                if rec.mtime_sec == meta.mtime()
                    && rec.size == meta.size()
                    && rec.inode == meta.ino()
                    && rec.mode == meta.mode()
                    && rec.ctime_sec == meta.ctime()
                {
                    StatStatus::Unchanged
                } else {
                    StatStatus::Changed
                }
            }
        }
    }

    /// Insert or overwrite the record for `path`.
    pub fn update(&mut self, path: &str, meta: &Metadata, hash: &Hash) {
        let record = StatRecord::from_stat(path, meta, hash);
        match self.by_path.get(path) {
            Some(&i) => self.records[i] = record,
            None => {
                self.by_path.insert(path.to_string(), self.records.len());
                self.records.push(record);
            }
        }
    }

    /// Drop the record for `path` via move-last-to-hole, then rebuild the
    /// lookup table (entries moved, so slot numbers are stale).
    pub fn remove(&mut self, path: &str) -> bool {
        let Some(i) = self.by_path.get(path).copied() else {
            return false;
        };
        self.records.swap_remove(i);
        self.rebuild_lookup();
        true
    }

    fn rebuild_lookup(&mut self) {
        self.by_path.clear();
        for (i, rec) in self.records.iter().enumerate() {
            self.by_path.insert(rec.path.clone(), i);
        }
    }

    /// Reorder records to match `paths` (the freshly emitted index order);
    /// unnamed records keep their relative order at the tail. Removal moves
    /// records around, so without this the next scan would iterate (and
    /// emit) entries in a different order than the index it just produced.
    pub fn reorder_to<'a, I>(&mut self, paths: I)
    where
        I: Iterator<Item = &'a str>,
    {
        let mut ordered = Vec::with_capacity(self.records.len());
        let mut taken = vec![false; self.records.len()];
        for path in paths {
            if let Some(&i) = self.by_path.get(path) {
                if !taken[i] {
                    ordered.push(self.records[i].clone());
                    taken[i] = true;
                }
            }
        }
        for (i, rec) in self.records.iter().enumerate() {
            if !taken[i] {
                ordered.push(rec.clone());
            }
        }
        self.records = ordered;
        self.rebuild_lookup();
    }

    /// Atomically rewrite the on-disk file and stamp the save time.
    pub fn save(&mut self, repo: &Repository) -> Result<()> {
        self.timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut body =
            Vec::with_capacity(self.records.len() * RECORD_SIZE + self.paths_blob_len());
        for rec in &self.records {
            body.extend_from_slice(&rec.mtime_sec.to_le_bytes());
            body.extend_from_slice(&rec.mtime_nsec.to_le_bytes());
            body.extend_from_slice(&rec.ctime_sec.to_le_bytes());
            body.extend_from_slice(&rec.ctime_nsec.to_le_bytes());
            body.extend_from_slice(&rec.size.to_le_bytes());
            body.extend_from_slice(&rec.inode.to_le_bytes());
            body.extend_from_slice(&rec.device.to_le_bytes());
            body.extend_from_slice(&rec.mode.to_le_bytes());
            body.extend_from_slice(&rec.uid.to_le_bytes());
            body.extend_from_slice(&rec.gid.to_le_bytes());
            body.extend_from_slice(&rec.hash_prefix);
            body.extend_from_slice(&(rec.path.len() as u16).to_le_bytes());
            body.extend_from_slice(&rec.flags.to_le_bytes());
        }
        for rec in &self.records {
            body.extend_from_slice(rec.path.as_bytes());
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        let checksum = hasher.finalize();

        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.extend_from_slice(STAT_INDEX_MAGIC);
        out.extend_from_slice(&STAT_INDEX_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.records.len() as u32).to_le_bytes());
        out.extend_from_slice(&checksum.to_le_bytes());

        let mut branch_field = [0u8; BRANCH_FIELD];
        let branch_bytes = self.branch.as_bytes();
        let n = branch_bytes.len().min(BRANCH_FIELD - 1);
        branch_field[..n].copy_from_slice(&branch_bytes[..n]);
        out.extend_from_slice(&branch_field);

        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&body);

        let path = repo.stat_index_path(&self.branch);
        repo::atomic_write(&path, &out)
            .with_context(|| format!("failed to save stat-index: {}", path.display()))
    }

    fn paths_blob_len(&self) -> usize {
        self.records.iter().map(|r| r.path.len()).sum()
    }
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(b)
}

fn read_i64(data: &[u8], at: usize) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[at..at + 8]);
    i64::from_le_bytes(b)
}
