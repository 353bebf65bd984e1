//! Derived artifact namespace.
//!
//! Each entry is a directory named by its [`CacheKey`] containing the
//! artifact files and an `entry.json` record of the tiles it was computed
//! from. Entries are built in a private `.tmp-*` directory and renamed into
//! place in one step.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::key::CacheKey;
use crate::cache::raw::write_json_atomic;
use crate::cache::{dir_size, is_temporary_name, touch};
use crate::catalog::TileIdentity;
use crate::telemetry::{CACHE_HITS, CACHE_MISSES};
use crate::{EngineError, Result};

/// Name of the record file inside an entry directory.
pub const ENTRY_FILE: &str = "entry.json";

/// Record stored with each derived entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedEntryMetadata {
    /// Key of the entry.
    pub key: CacheKey,
    /// Tiles the entry was computed from, with the checksums and freshness
    /// tokens current at the time.
    pub tiles: Vec<TileIdentity>,
    /// Artifact file names, relative to the entry directory.
    pub files: Vec<String>,
    /// Creation time (RFC 3339).
    pub created_at: String,
    /// Version of the engine that wrote the entry.
    pub engine_version: String,
}

/// A published derived entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedEntry {
    dir: PathBuf,
    metadata: DerivedEntryMetadata,
}

impl DerivedEntry {
    /// Entry key.
    pub fn key(&self) -> &CacheKey {
        &self.metadata.key
    }

    /// Entry directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of one artifact file.
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Stored record.
    pub fn metadata(&self) -> &DerivedEntryMetadata {
        &self.metadata
    }
}

/// Outcome of looking up a key.
#[derive(Debug, Clone, PartialEq)]
pub enum DerivedLookup {
    /// A valid entry exists.
    Hit(DerivedEntry),
    /// Nothing stored under the key.
    Miss,
    /// An entry exists but must not be served.
    Stale(String),
}

/// Derived artifact store keyed by [`CacheKey`].
#[derive(Debug)]
pub struct DerivedCache {
    dir: PathBuf,
}

impl DerivedCache {
    /// Open (creating if needed) the namespace at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| EngineError::io(&dir, e))?;
        Ok(Self { dir })
    }

    /// Namespace directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory of the entry for `key`.
    pub fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.as_str())
    }

    /// Look up `key`, validating it against the current tile identities.
    ///
    /// An entry whose recorded tiles differ from `tiles` in any checksum or
    /// freshness token is reported as stale.
    pub fn lookup(&self, key: &CacheKey, tiles: &[TileIdentity]) -> DerivedLookup {
        let dir = self.entry_dir(key);
        let record = dir.join(ENTRY_FILE);
        if !dir.exists() {
            return DerivedLookup::Miss;
        }
        let metadata: DerivedEntryMetadata = match fs::read_to_string(&record)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()))
        {
            Ok(m) => m,
            Err(e) => return DerivedLookup::Stale(format!("unreadable entry record: {}", e)),
        };

        if metadata.key != *key {
            return DerivedLookup::Stale("entry record names a different key".to_string());
        }
        let mut recorded = metadata.tiles.clone();
        recorded.sort();
        let mut current = tiles.to_vec();
        current.sort();
        if recorded != current {
            return DerivedLookup::Stale("contributing tiles were superseded upstream".to_string());
        }
        if let Some(missing) = metadata.files.iter().find(|f| !dir.join(f).is_file()) {
            return DerivedLookup::Stale(format!("artifact '{}' is missing", missing));
        }
        DerivedLookup::Hit(DerivedEntry { dir, metadata })
    }

    /// Return the entry for `key`, computing it on a miss or stale entry.
    ///
    /// `compute` receives a private staging directory, writes the artifacts
    /// into it and returns their file names. The staging directory becomes
    /// the entry only if `compute` succeeds; otherwise it is removed.
    ///
    /// The boolean is `true` when the entry was served from the cache.
    pub fn get_or_compute<F>(&self, key: &CacheKey, tiles: &[TileIdentity], compute: F) -> Result<(DerivedEntry, bool)>
    where
        F: FnOnce(&Path) -> Result<Vec<String>>,
    {
        match self.lookup(key, tiles) {
            DerivedLookup::Hit(entry) => {
                touch(&entry.dir.join(ENTRY_FILE));
                metrics::counter!(CACHE_HITS.name, "namespace" => "derived").increment(1);
                debug!(key = %key, "Derived cache hit");
                return Ok((entry, true));
            }
            DerivedLookup::Stale(reason) => {
                info!(key = %key, reason = %reason, "Derived entry is stale; recomputing");
            }
            DerivedLookup::Miss => debug!(key = %key, "Derived cache miss"),
        }
        metrics::counter!(CACHE_MISSES.name, "namespace" => "derived").increment(1);

        let staging = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempdir_in(&self.dir)
            .map_err(|e| EngineError::io(&self.dir, e))?;

        let mut files = compute(staging.path())?;
        files.sort();
        files.dedup();
        for name in &files {
            let path = staging.path().join(name);
            if !path.is_file() {
                return Err(EngineError::io(
                    path,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "computed artifact is missing"),
                ));
            }
        }

        let mut recorded = tiles.to_vec();
        recorded.sort();
        let metadata = DerivedEntryMetadata {
            key: key.clone(),
            tiles: recorded,
            files,
            created_at: Utc::now().to_rfc3339(),
            engine_version: crate::VERSION.to_string(),
        };
        write_json_atomic(staging.path(), &staging.path().join(ENTRY_FILE), &metadata)?;

        let entry = self.publish(staging.path(), key, tiles, metadata)?;
        info!(key = %key, "Derived entry published");
        Ok((entry, false))
    }

    fn publish(
        &self,
        staging: &Path,
        key: &CacheKey,
        tiles: &[TileIdentity],
        metadata: DerivedEntryMetadata,
    ) -> Result<DerivedEntry> {
        let target = self.entry_dir(key);

        if target.exists() {
            if let DerivedLookup::Hit(entry) = self.lookup(key, tiles) {
                debug!(key = %key, "Entry published concurrently; discarding ours");
                return Ok(entry);
            }
            let aside = self
                .dir
                .join(format!(".stale-{}-{:016x}", key.as_str(), rand::random::<u64>()));
            match fs::rename(&target, &aside) {
                Ok(()) => {
                    if let Err(e) = fs::remove_dir_all(&aside) {
                        warn!(path = %aside.display(), error = %e, "Could not remove replaced entry");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(EngineError::io(&target, e)),
            }
        }

        if let Err(e) = fs::rename(staging, &target) {
            // Lost a race against another writer with the same key.
            if let DerivedLookup::Hit(entry) = self.lookup(key, tiles) {
                return Ok(entry);
            }
            return Err(EngineError::io(&target, e));
        }
        Ok(DerivedEntry { dir: target, metadata })
    }

    /// Remove the entry for `key`, if present.
    pub fn remove(&self, key: &CacheKey) -> Result<()> {
        let dir = self.entry_dir(key);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::io(dir, e)),
        }
    }

    /// Number of published entries and bytes used (temporary dirs included).
    pub fn usage(&self) -> Result<(usize, u64)> {
        let mut entries = 0;
        for entry in fs::read_dir(&self.dir).map_err(|e| EngineError::io(&self.dir, e))? {
            let entry = entry.map_err(|e| EngineError::io(&self.dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_dir() && !is_temporary_name(&name) {
                entries += 1;
            }
        }
        Ok((entries, dir_size(&self.dir)?))
    }
}
