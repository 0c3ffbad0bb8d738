//! Content-addressed object store
//!
//! Blobs are immutable files named by the SHA-256 of their contents, fanned
//! out by the first two hex characters: `objects/<hex[0..2]>/<hex[2..]>`.
//! Payloads are stored verbatim — no header, no compression. `put_*` is
//! idempotent; concurrent writers of the same hash write identical bytes, so
//! no filesystem-level locking is required.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::hash::{self, Hash};
use crate::repo::Repository;

/// Copy buffer for streaming blob reads/writes.
const COPY_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct ObjectStore {
    objects_dir: PathBuf,
}

impl ObjectStore {
    pub fn open(repo: &Repository) -> ObjectStore {
        ObjectStore {
            objects_dir: repo.objects_dir(),
        }
    }

    /// On-disk path for a hash: two-char fan-out directory + remainder.
    pub fn object_path(&self, hash: &Hash) -> PathBuf {
        let hex = hash.to_hex();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }

    /// True iff a regular file exists at the object path.
    pub fn exists(&self, hash: &Hash) -> bool {
        self.object_path(hash)
            .metadata()
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Hash `src` and store its contents if not already present.
    pub fn put_file(&self, src: &Path) -> Result<Hash> {
        let hash = hash::hash_file(src)?;
        if self.exists(&hash) {
            return Ok(hash);
        }

        let dest = self.object_path(&hash);
        let mut reader = File::open(src)
            .with_context(|| format!("failed to open source file: {}", src.display()))?;
        self.write_object(&hash, &dest, |out| {
            let mut buf = [0u8; COPY_CHUNK];
            loop {
                let n = reader
                    .read(&mut buf)
                    .with_context(|| format!("failed to read source file: {}", src.display()))?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).with_context(|| {
                    format!("failed to write object: {}", dest.display())
                })?;
            }
            Ok(())
        })?;
        Ok(hash)
    }

    /// Store an in-memory buffer.
    pub fn put_bytes(&self, buf: &[u8]) -> Result<Hash> {
        let hash = hash::hash_bytes(buf);
        if self.exists(&hash) {
            return Ok(hash);
        }

        let dest = self.object_path(&hash);
        self.write_object(&hash, &dest, |out| {
            out.write_all(buf)
                .with_context(|| format!("failed to write object: {}", dest.display()))
        })?;
        Ok(hash)
    }

    /// Read a whole blob into memory. Fails if the blob is absent.
    pub fn get(&self, hash: &Hash) -> Result<Vec<u8>> {
        let path = self.object_path(hash);
        fs::read(&path).with_context(|| format!("blob {} not found in object store", hash))
    }

    /// Stream a blob's contents to `dest`, creating parent directories.
    /// The caller sets the file mode separately.
    pub fn restore_to(&self, hash: &Hash, dest: &Path) -> Result<()> {
        let src = self.object_path(hash);
        let mut reader = File::open(&src)
            .with_context(|| format!("blob {} not found in object store", hash))?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }
        let mut writer = File::create(dest)
            .with_context(|| format!("failed to create file: {}", dest.display()))?;

        let mut buf = [0u8; COPY_CHUNK];
        loop {
            let n = reader
                .read(&mut buf)
                .with_context(|| format!("failed to read blob: {}", src.display()))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .with_context(|| format!("failed to write file: {}", dest.display()))?;
        }
        Ok(())
    }

    /// Write an object through a temp file in the same fan-out directory, then
    /// rename into place. A failed write unlinks the temp file so no partial
    /// blob is ever visible under the object's name.
    fn write_object<F>(&self, hash: &Hash, dest: &Path, fill: F) -> Result<()>
    where
        F: FnOnce(&mut File) -> Result<()>,
    {
        let parent = dest
            .parent()
            .expect("object path always has a fan-out parent");
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;

        let temp = parent.join(format!(".tmp-{}-{}", std::process::id(), hash.to_hex()));
        let mut file = File::create(&temp)
            .with_context(|| format!("failed to create temp object: {}", temp.display()))?;

        let result = fill(&mut file).and_then(|()| {
            file.sync_all()
                .with_context(|| format!("failed to sync object: {}", temp.display()))
        });
        drop(file);

        if let Err(e) = result {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }

        fs::rename(&temp, dest)
            .with_context(|| format!("failed to rename object into place: {}", dest.display()))?;
        Ok(())
    }
}
