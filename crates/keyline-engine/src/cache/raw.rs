//! Raw tile namespace.
//!
//! ## Thread safety
//!
//! Fetches for different tiles run concurrently. For the same tile only one
//! fetch is ever in flight within a process: the first caller downloads,
//! later callers wait on a condition variable and then pick up the published
//! file. If the download fails the waiters wake up and the next one in line
//! tries again with its own fetch.

use std::collections::HashSet;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::cache::{is_temporary_name, touch};
use crate::catalog::TileIdentity;
use crate::telemetry::{CACHE_HITS, CACHE_MISSES, TILE_DOWNLOADS, TILE_DOWNLOAD_BYTES};
use crate::{EngineError, Result};

const METADATA_SUFFIX: &str = ".meta.json";

/// Sidecar record written next to each verified tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTileMetadata {
    /// Identity the tile was fetched for.
    pub identity: TileIdentity,
    /// SHA-256 of the stored file.
    pub sha256: String,
    /// Size of the stored file.
    pub size_bytes: u64,
    /// Whether `sha256` was checked against a catalog checksum.
    pub verified: bool,
    /// When the tile was fetched (RFC 3339).
    pub fetched_at: String,
}

/// Writer adapter that hashes everything written through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Raw tile store keyed by [`TileIdentity`].
#[derive(Debug)]
pub struct RawTileCache {
    dir: PathBuf,
    in_flight: Mutex<HashSet<String>>,
    fetch_complete: Condvar,
}

/// Removes the in-flight marker and wakes waiters, on every exit path.
struct InFlightGuard<'a> {
    cache: &'a RawTileCache,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        // A poisoned lock still holds a usable set; clear our marker regardless.
        let mut in_flight = match self.cache.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        in_flight.remove(&self.key);
        drop(in_flight);
        self.cache.fetch_complete.notify_all();
    }
}

impl RawTileCache {
    /// Open (creating if needed) the namespace at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| EngineError::io(&dir, e))?;
        Ok(Self {
            dir,
            in_flight: Mutex::new(HashSet::new()),
            fetch_complete: Condvar::new(),
        })
    }

    /// Namespace directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory holding the files of one catalog item.
    pub fn item_dir(&self, identity: &TileIdentity) -> PathBuf {
        self.dir
            .join(sanitize(&identity.collection_id))
            .join(sanitize(&identity.item_id))
    }

    /// Final location of a tile.
    pub fn tile_path(&self, identity: &TileIdentity) -> PathBuf {
        self.item_dir(identity).join(sanitize(&identity.file_id))
    }

    fn metadata_path(&self, identity: &TileIdentity) -> PathBuf {
        self.item_dir(identity)
            .join(format!("{}{}", sanitize(&identity.file_id), METADATA_SUFFIX))
    }

    /// Read the sidecar record of a stored tile, if any.
    pub fn metadata(&self, identity: &TileIdentity) -> Option<RawTileMetadata> {
        let text = fs::read_to_string(self.metadata_path(identity)).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Path of a stored tile that is valid for `identity`.
    ///
    /// A stored tile is valid when its record matches the identity's checksum
    /// and freshness token and the file size is unchanged.
    pub fn lookup(&self, identity: &TileIdentity) -> Option<PathBuf> {
        let meta = self.metadata(identity)?;
        if meta.identity != *identity {
            debug!(tile = %identity.label(), "Stored tile was superseded upstream");
            return None;
        }
        let path = self.tile_path(identity);
        let size = fs::metadata(&path).ok()?.len();
        (size == meta.size_bytes).then_some(path)
    }

    /// Return the local path of `identity`, fetching it on a miss.
    ///
    /// `fetch` writes the tile content into the provided sink. The content is
    /// hashed while it is written; if the identity carries a checksum and the
    /// digest differs the download is discarded and
    /// [`EngineError::Integrity`] returned. Only verified content is renamed
    /// into place.
    pub fn get_or_fetch<F>(&self, identity: &TileIdentity, fetch: F) -> Result<PathBuf>
    where
        F: FnOnce(&mut dyn Write) -> Result<u64>,
    {
        if let Some(path) = self.hit(identity) {
            return Ok(path);
        }

        let key = identity.label();
        {
            let mut in_flight = self.lock()?;
            loop {
                if !in_flight.contains(&key) {
                    break;
                }
                debug!(tile = %key, "Waiting for in-flight fetch");
                in_flight = self
                    .fetch_complete
                    .wait(in_flight)
                    .map_err(|_| EngineError::CacheLockPoisoned)?;
            }
            // Published while we waited.
            if let Some(path) = self.hit(identity) {
                return Ok(path);
            }
            in_flight.insert(key.clone());
        }
        let _guard = InFlightGuard { cache: self, key };

        metrics::counter!(CACHE_MISSES.name, "namespace" => "raw").increment(1);
        self.download(identity, fetch)
    }

    fn hit(&self, identity: &TileIdentity) -> Option<PathBuf> {
        let path = self.lookup(identity)?;
        touch(&self.metadata_path(identity));
        metrics::counter!(CACHE_HITS.name, "namespace" => "raw").increment(1);
        debug!(tile = %identity.label(), "Raw cache hit");
        Some(path)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashSet<String>>> {
        self.in_flight.lock().map_err(|_| EngineError::CacheLockPoisoned)
    }

    fn download<F>(&self, identity: &TileIdentity, fetch: F) -> Result<PathBuf>
    where
        F: FnOnce(&mut dyn Write) -> Result<u64>,
    {
        let item_dir = self.item_dir(identity);
        fs::create_dir_all(&item_dir).map_err(|e| EngineError::io(&item_dir, e))?;

        let temp = NamedTempFile::new_in(&item_dir).map_err(|e| EngineError::io(&item_dir, e))?;
        let (size_bytes, actual) = {
            let mut writer = HashingWriter {
                inner: BufWriter::new(temp.as_file()),
                hasher: Sha256::new(),
                written: 0,
            };
            fetch(&mut writer)?;
            writer.flush().map_err(|e| EngineError::io(temp.path(), e))?;
            (writer.written, hex::encode(writer.hasher.finalize()))
        };

        let verified = match &identity.checksum {
            Some(expected) if *expected != actual => {
                warn!(tile = %identity.label(), expected = %expected, actual = %actual, "Checksum mismatch; discarding download");
                if let Err(e) = temp.close() {
                    warn!(dir = %item_dir.display(), error = %e, "Failed to remove discarded download");
                }
                let empty = fs::read_dir(&item_dir).map(|mut d| d.next().is_none()).unwrap_or(false);
                if empty {
                    if let Err(e) = fs::remove_dir(&item_dir) {
                        warn!(dir = %item_dir.display(), error = %e, "Failed to remove empty tile directory");
                    }
                }
                return Err(EngineError::Integrity {
                    item_id: identity.item_id.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
            Some(_) => true,
            None => {
                warn!(tile = %identity.label(), sha256 = %actual, "No catalog checksum; recording computed digest unverified");
                false
            }
        };

        temp.as_file().sync_all().map_err(|e| EngineError::io(temp.path(), e))?;

        // An old record must never vouch for the new file, so it goes first.
        let meta_path = self.metadata_path(identity);
        match fs::remove_file(&meta_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(EngineError::io(&meta_path, e)),
        }

        let tile_path = self.tile_path(identity);
        temp.persist(&tile_path)
            .map_err(|e| EngineError::io(&tile_path, e.error))?;

        let metadata = RawTileMetadata {
            identity: identity.clone(),
            sha256: actual,
            size_bytes,
            verified,
            fetched_at: Utc::now().to_rfc3339(),
        };
        write_json_atomic(&item_dir, &meta_path, &metadata)?;

        metrics::counter!(TILE_DOWNLOADS.name).increment(1);
        metrics::counter!(TILE_DOWNLOAD_BYTES.name).increment(size_bytes);
        info!(tile = %identity.label(), bytes = size_bytes, verified, "Tile cached");
        Ok(tile_path)
    }

    /// Number of stored tiles and bytes used.
    pub fn usage(&self) -> Result<(usize, u64)> {
        let mut tiles = 0;
        let mut bytes = 0;
        for item_dir in item_dirs(&self.dir)? {
            for entry in fs::read_dir(&item_dir).map_err(|e| EngineError::io(&item_dir, e))? {
                let entry = entry.map_err(|e| EngineError::io(&item_dir, e))?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let len = entry.metadata().map_err(|e| EngineError::io(entry.path(), e))?.len();
                bytes += len;
                if !name.ends_with(METADATA_SUFFIX) && !is_temporary_name(&name) {
                    tiles += 1;
                }
            }
        }
        Ok((tiles, bytes))
    }
}

/// `<dir>/<collection>/<item>` directories.
pub(crate) fn item_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for collection in fs::read_dir(dir).map_err(|e| EngineError::io(dir, e))? {
        let collection = collection.map_err(|e| EngineError::io(dir, e))?.path();
        if !collection.is_dir() {
            continue;
        }
        for item in fs::read_dir(&collection).map_err(|e| EngineError::io(&collection, e))? {
            let item = item.map_err(|e| EngineError::io(&collection, e))?.path();
            if item.is_dir() {
                out.push(item);
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Strip the tile-meta suffix from a sidecar file name.
pub(crate) fn tile_name_of_metadata(name: &str) -> Option<&str> {
    name.strip_suffix(METADATA_SUFFIX)
}

/// Serialize `value` to a temp file in `dir` and rename it to `path`.
pub(crate) fn write_json_atomic<T: Serialize>(dir: &Path, path: &Path, value: &T) -> Result<()> {
    let mut temp = NamedTempFile::new_in(dir).map_err(|e| EngineError::io(dir, e))?;
    serde_json::to_writer_pretty(&mut temp, value)?;
    temp.as_file().sync_all().map_err(|e| EngineError::io(temp.path(), e))?;
    temp.persist(path).map_err(|e| EngineError::io(path, e.error))?;
    Ok(())
}

/// Keep identifiers usable as single path components.
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    match cleaned.trim_start_matches('.') {
        "" => "_".to_string(),
        rest => rest.to_string(),
    }
}
