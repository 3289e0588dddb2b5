//! On-disk cache of the last verified catalog
//!
//! Layout of the cache directory:
//!
//! ```text
//! brokers.json          raw payload exactly as it was signed
//! brokers.meta.json     {"timestamp": <ms>, "etag": "...", "sha256": "sha256:<hex>"}
//! refresh_state.json    {"lastCheckedAt": <ms>}
//! ```
//!
//! Every file is replaced by writing a uniquely named temp file in the same
//! directory, syncing it, and renaming it over the target. The metadata
//! carries the payload digest, so a reader that races a writer (or a crash
//! between the two renames) sees a mismatch and reports a miss instead of
//! pairing one save's payload with another save's metadata.
//!
//! The store never evaluates expiry. That is the loader's policy decision.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::trust::hasher::hash_bytes;

pub const PAYLOAD_FILE: &str = "brokers.json";
pub const METADATA_FILE: &str = "brokers.meta.json";
pub const REFRESH_STATE_FILE: &str = "refresh_state.json";

/// Cache persistence errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to create cache directory {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write cache file {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove cache file {path}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode {path}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// `touch` needs an intact cache to revalidate
    #[error("No usable cached catalog in {dir}")]
    NoCache { dir: PathBuf },

    #[error("Cache task did not complete")]
    Join(#[from] tokio::task::JoinError),
}

/// A verified payload together with its fetch metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedCatalog {
    /// Raw bytes as served and signed; never the re-serialized records
    pub payload: Vec<u8>,
    pub fetched_at_epoch_ms: u64,
    pub etag: Option<String>,
}

impl CachedCatalog {
    pub fn new(payload: Vec<u8>, fetched_at_epoch_ms: u64, etag: Option<String>) -> Self {
        Self {
            payload,
            fetched_at_epoch_ms,
            etag,
        }
    }

    /// Age at `now_ms`; zero when the clock is behind the fetch time
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.fetched_at_epoch_ms)
    }

    /// True once the age is strictly greater than `window`
    pub fn is_expired(&self, now_ms: u64, window: Duration) -> bool {
        u128::from(self.age_ms(now_ms)) > window.as_millis()
    }

    pub fn fetched_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let millis = i64::try_from(self.fetched_at_epoch_ms).ok()?;
        chrono::DateTime::from_timestamp_millis(millis)
    }
}

/// Contents of `brokers.meta.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    /// Fetch (or last revalidation) time, epoch milliseconds
    pub timestamp: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    /// Digest of the payload file this metadata describes
    pub sha256: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshState {
    last_checked_at: u64,
}

/// Current wall clock time in epoch milliseconds
pub fn now_epoch_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// File-backed catalog cache rooted at one directory
#[derive(Debug, Clone)]
pub struct CatalogStore {
    dir: PathBuf,
}

impl CatalogStore {
    /// The directory is created lazily on the first write
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn payload_path(&self) -> PathBuf {
        self.dir.join(PAYLOAD_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    fn refresh_state_path(&self) -> PathBuf {
        self.dir.join(REFRESH_STATE_FILE)
    }

    /// Read the cached catalog, or `None` if it is absent or inconsistent
    pub fn load(&self) -> Option<CachedCatalog> {
        let metadata = self.read_metadata()?;

        let payload_path = self.payload_path();
        let payload = match fs::read(&payload_path) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("Cache payload {} unreadable: {}", payload_path.display(), e);
                return None;
            }
        };

        let digest = hash_bytes(&payload);
        if digest != metadata.sha256 {
            warn!(
                "Cache payload digest {} does not match metadata {}; ignoring cache",
                digest, metadata.sha256
            );
            return None;
        }

        trace!(
            "Loaded cached catalog ({} bytes, timestamp {})",
            payload.len(),
            metadata.timestamp
        );
        Some(CachedCatalog {
            payload,
            fetched_at_epoch_ms: metadata.timestamp,
            etag: metadata.etag,
        })
    }

    /// Persist a verified catalog, replacing any previous one
    pub fn save(&self, catalog: &CachedCatalog) -> Result<(), StoreError> {
        self.ensure_dir()?;

        let metadata = CacheMetadata {
            timestamp: catalog.fetched_at_epoch_ms,
            etag: catalog.etag.clone(),
            sha256: hash_bytes(&catalog.payload),
        };

        write_atomic(&self.payload_path(), &catalog.payload)?;
        self.write_json(&self.metadata_path(), &metadata)?;

        debug!(
            "Saved catalog to {} ({} bytes, etag {:?})",
            self.dir.display(),
            catalog.payload.len(),
            catalog.etag
        );
        Ok(())
    }

    /// Move the cache timestamp to `now_ms` without touching the payload
    pub fn touch(&self, now_ms: u64) -> Result<(), StoreError> {
        let cached = self.load().ok_or_else(|| StoreError::NoCache {
            dir: self.dir.clone(),
        })?;

        let metadata = CacheMetadata {
            timestamp: now_ms,
            etag: cached.etag,
            sha256: hash_bytes(&cached.payload),
        };
        self.write_json(&self.metadata_path(), &metadata)
    }

    /// Remove every cache file; missing files are fine
    pub fn clear(&self) -> Result<(), StoreError> {
        for path in [
            self.metadata_path(),
            self.payload_path(),
            self.refresh_state_path(),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::Remove { path, source: e }),
            }
        }
        Ok(())
    }

    /// When the remote was last successfully contacted
    pub fn last_checked_at(&self) -> Option<u64> {
        let path = self.refresh_state_path();
        let raw = fs::read(&path).ok()?;
        match serde_json::from_slice::<RefreshState>(&raw) {
            Ok(state) => Some(state.last_checked_at),
            Err(e) => {
                debug!("Ignoring unreadable {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn record_check(&self, now_ms: u64) -> Result<(), StoreError> {
        self.ensure_dir()?;
        self.write_json(
            &self.refresh_state_path(),
            &RefreshState {
                last_checked_at: now_ms,
            },
        )
    }

    fn read_metadata(&self) -> Option<CacheMetadata> {
        let path = self.metadata_path();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!("No cache metadata at {}", path.display());
                return None;
            }
            Err(e) => {
                warn!("Cache metadata {} unreadable: {}", path.display(), e);
                return None;
            }
        };

        match serde_json::from_slice(&raw) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!("Cache metadata {} is corrupt: {}", path.display(), e);
                None
            }
        }
    }

    fn ensure_dir(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(|e| StoreError::CreateDir {
            path: self.dir.clone(),
            source: e,
        })
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Encode {
            path: path.to_path_buf(),
            source: e,
        })?;
        write_atomic(path, &bytes)
    }
}

/// Write `content` to a synced temp file beside `path`, then rename it over `path`
fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let written = fs::File::create(&tmp_path).and_then(|mut file| {
        file.write_all(content)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(StoreError::Write {
            path: tmp_path,
            source: e,
        });
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        StoreError::Write {
            path: path.to_path_buf(),
            source: e,
        }
    })
}
