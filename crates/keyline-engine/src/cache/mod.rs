//! Content-addressed on-disk cache.
//!
//! The cache root holds two independent namespaces:
//!
//! ```text
//! <root>/
//!   raw/<collection>/<item>/<file>             verified source tile
//!   raw/<collection>/<item>/<file>.meta.json   checksum + freshness record
//!   derived/<cache key>/entry.json             contributing tiles, file list
//!   derived/<cache key>/dem_clip.tif ...       derived artifacts
//! ```
//!
//! Every entry is written to a temporary name in the same directory and made
//! visible with a rename, so readers never observe a partial entry. Several
//! processes may share one root; the rename is the only synchronisation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;

use crate::{EngineError, Result};

pub mod derived;
pub mod key;
pub mod prune;
pub mod raw;

pub use derived::{DerivedCache, DerivedEntry, DerivedLookup};
pub use key::CacheKey;
pub use prune::{prune, EvictionPolicy, PruneReport};
pub use raw::RawTileCache;

/// Raw tile namespace directory name.
pub const RAW_DIR: &str = "raw";

/// Derived artifact namespace directory name.
pub const DERIVED_DIR: &str = "derived";

/// Both cache namespaces under one root directory.
#[derive(Debug)]
pub struct ContentAddressedCache {
    root: PathBuf,
    raw: RawTileCache,
    derived: DerivedCache,
}

impl ContentAddressedCache {
    /// Open (creating if needed) a cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let raw = RawTileCache::open(root.join(RAW_DIR))?;
        let derived = DerivedCache::open(root.join(DERIVED_DIR))?;
        Ok(Self { root, raw, derived })
    }

    /// Cache root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Raw tile namespace.
    pub fn raw(&self) -> &RawTileCache {
        &self.raw
    }

    /// Derived artifact namespace.
    pub fn derived(&self) -> &DerivedCache {
        &self.derived
    }

    /// Entry counts and sizes of both namespaces.
    pub fn stats(&self) -> Result<CacheStats> {
        let (raw_tiles, raw_bytes) = self.raw.usage()?;
        let (derived_entries, derived_bytes) = self.derived.usage()?;
        Ok(CacheStats {
            raw_tiles,
            raw_bytes,
            derived_entries,
            derived_bytes,
        })
    }
}

/// Summary of cache usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    /// Verified raw tiles.
    pub raw_tiles: usize,
    /// Bytes used by the raw namespace.
    pub raw_bytes: u64,
    /// Published derived entries.
    pub derived_entries: usize,
    /// Bytes used by the derived namespace.
    pub derived_bytes: u64,
}

/// Record a use of an entry by bumping the file's modification time.
pub(crate) fn touch(path: &Path) {
    let result = fs::File::options()
        .append(true)
        .open(path)
        .and_then(|f| f.set_modified(SystemTime::now()));
    if let Err(e) = result {
        tracing::debug!(path = %path.display(), error = %e, "Could not update last-use time");
    }
}

/// Modification time of `path`.
pub(crate) fn modified(path: &Path) -> Result<SystemTime> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| EngineError::io(path, e))
}

/// Total size of regular files below `path`.
pub(crate) fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path).map_err(|e| EngineError::io(path, e))? {
        let entry = entry.map_err(|e| EngineError::io(path, e))?;
        let file_type = entry.file_type().map_err(|e| EngineError::io(entry.path(), e))?;
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata().map_err(|e| EngineError::io(entry.path(), e))?.len();
        }
    }
    Ok(total)
}

/// Whether a directory entry name belongs to an in-progress or abandoned write.
pub(crate) fn is_temporary_name(name: &str) -> bool {
    name.starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_both_namespaces() {
        let dir = TempDir::new().unwrap();
        let cache = ContentAddressedCache::open(dir.path().join("cache")).unwrap();
        assert!(cache.root().join(RAW_DIR).is_dir());
        assert!(cache.root().join(DERIVED_DIR).is_dir());
        assert_eq!(cache.stats().unwrap(), CacheStats::default());
    }

    #[test]
    fn test_dir_size_is_recursive() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/one"), [0u8; 10]).unwrap();
        fs::write(dir.path().join("a/b/two"), [0u8; 5]).unwrap();
        assert_eq!(dir_size(dir.path()).unwrap(), 15);
    }
}
