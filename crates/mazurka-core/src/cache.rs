//! The mapped-file-cache seam.
//!
//! A real deployment plugs in a shared mmap cache; the engine only ever
//! calls [`FileCache::map`] just before sending a body and
//! [`FileCache::unmap`] when the connection lets go of it.  The built-in
//! [`ReadCache`] simply reads the file, which keeps the engine self-contained
//! for tests and small setups.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

/// A mapped file body plus the identity it was mapped under.
#[derive(Debug, Clone)]
pub struct FileMap {
    pub bytes: Arc<[u8]>,
    pub size: u64,
    pub mtime: Option<SystemTime>,
}

impl FileMap {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

pub trait FileCache: Send + Sync {
    fn map(&self, path: &Path, meta: &fs::Metadata) -> io::Result<FileMap>;
    /// Release a mapping.  Read-based implementations have nothing to do.
    fn unmap(&self, map: FileMap) {
        drop(map);
    }
}

/// Whole-file read implementation of the cache seam.
#[derive(Debug, Default)]
pub struct ReadCache;

impl FileCache for ReadCache {
    fn map(&self, path: &Path, meta: &fs::Metadata) -> io::Result<FileMap> {
        let bytes = fs::read(path)?;
        Ok(FileMap {
            size: bytes.len() as u64,
            bytes: bytes.into(),
            mtime: meta.modified().ok(),
        })
    }
}
