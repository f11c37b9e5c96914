//! Content-addressed on-disk cache of generated kernel sources.
//!
//! The key of an entry is the BLAKE3 digest of its text, so identical
//! configurations always land on the same file and concurrent writers of
//! the same source cannot conflict.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::Result;

/// File extension of cache entries.
pub const EXTENSION: &str = "attn";

/// Hex digest of `source`.
pub fn digest(source: &str) -> String {
    blake3::hash(source.as_bytes()).to_hex().to_string()
}

/// Where a source was stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub digest: String,
    pub path: PathBuf,
    /// False when an identical entry already existed.
    pub created: bool,
}

/// Directory of `{digest}.attn` files.
#[derive(Clone, Debug)]
pub struct KernelCache {
    dir: PathBuf,
}

impl KernelCache {
    /// Open (and create if needed) the cache directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, digest: &str) -> PathBuf {
        self.dir.join(format!("{digest}.{EXTENSION}"))
    }

    fn temp_with(&self, source: &str) -> Result<NamedTempFile> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(source.as_bytes())?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }

    /// Store `source` unless an entry with its digest exists.
    ///
    /// The text is written to a temporary file in the cache directory and
    /// linked into place without replacing anything, so readers never see
    /// a partial file.
    pub fn store(&self, source: &str) -> Result<CacheEntry> {
        let digest = digest(source);
        let path = self.path_for(&digest);
        if path.exists() {
            debug!(%digest, "kernel cache hit");
            return Ok(CacheEntry {
                digest,
                path,
                created: false,
            });
        }
        let created = match self.temp_with(source)?.persist_noclobber(&path) {
            Ok(_) => true,
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => false,
            Err(e) => return Err(e.error.into()),
        };
        debug!(%digest, path = %path.display(), created, "stored kernel source");
        Ok(CacheEntry {
            digest,
            path,
            created,
        })
    }

    /// Replace the entry for `source`, whatever the file currently holds.
    pub fn overwrite(&self, source: &str) -> Result<CacheEntry> {
        let digest = digest(source);
        let path = self.path_for(&digest);
        self.temp_with(source)?
            .persist(&path)
            .map_err(|e| e.error)?;
        debug!(%digest, "rewrote kernel source");
        Ok(CacheEntry {
            digest,
            path,
            created: true,
        })
    }

    pub fn read(&self, digest: &str) -> Result<String> {
        Ok(fs::read_to_string(self.path_for(digest))?)
    }

    /// Number of `.attn` files in the directory.
    pub fn len(&self) -> Result<usize> {
        let mut n = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == EXTENSION) {
                n += 1;
            }
        }
        Ok(n)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
