//! Cache Store - Fingerprint-Addressed Asset Storage
//!
//! Pure storage, no policy. Entries are append-only: writing the same bytes
//! twice is a no-op, writing different bytes under an existing key is a
//! `CacheConflict`.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::asset::{Asset, AssetKey, CachedAsset};
use crate::hashing::sha256_hex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Cache conflict for key {key}: existing entry has different content")]
    CacheConflict { key: AssetKey },

    #[error("Cache store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt cache entry {key}: {reason}")]
    Corrupt { key: AssetKey, reason: String },
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Key -> asset storage shared by every worker of a run.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &AssetKey) -> Result<Option<CachedAsset>, StoreError>;

    fn put(&self, entry: &CachedAsset) -> Result<(), StoreError>;

    /// Drop every entry, returning how many were removed.
    fn clear(&self) -> Result<usize, StoreError>;
}

fn check_idempotent(existing: &CachedAsset, incoming: &CachedAsset) -> Result<(), StoreError> {
    if existing.asset.bytes() == incoming.asset.bytes() {
        debug!(key = %incoming.key.short(), "idempotent cache rewrite");
        Ok(())
    } else {
        warn!(key = %incoming.key, "cache conflict: different bytes under existing key");
        Err(StoreError::CacheConflict {
            key: incoming.key.clone(),
        })
    }
}

/// In-process store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<AssetKey, CachedAsset>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("cache lock poisoned".to_string())
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &AssetKey) -> Result<Option<CachedAsset>, StoreError> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, entry: &CachedAsset) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        match entries.get(&entry.key) {
            Some(existing) => check_idempotent(existing, entry),
            None => {
                entries.insert(entry.key.clone(), entry.clone());
                Ok(())
            }
        }
    }

    fn clear(&self) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        let removed = entries.len();
        entries.clear();
        Ok(removed)
    }
}

/// On-disk entry: metadata and payload in one file, so a single rename
/// publishes both.
#[derive(Debug, Serialize, Deserialize)]
struct EntryRecord {
    key: AssetKey,
    created_at: DateTime<Utc>,
    content_type: String,
    sha256: String,
    data_base64: String,
}

/// Filesystem-backed store with 2-char sharding.
///
/// Layout: `<root>/objects/<first 2 hex chars>/<remaining hex chars>.json`
pub struct FsCacheStore {
    objects_dir: PathBuf,
}

impl FsCacheStore {
    /// Create a store rooted at `root`. Creates `root/objects/` if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let objects_dir = root.as_ref().join("objects");
        fs::create_dir_all(&objects_dir)?;
        Ok(Self { objects_dir })
    }

    fn entry_path(&self, key: &AssetKey) -> PathBuf {
        let (shard, hex) = key.shard();
        self.objects_dir
            .join(shard)
            .join(format!("{}.json", &hex[shard.len()..]))
    }

    fn read_entry(&self, key: &AssetKey, path: &Path) -> Result<Option<CachedAsset>, StoreError> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let corrupt = |reason: String| StoreError::Corrupt {
            key: key.clone(),
            reason,
        };

        let record: EntryRecord =
            serde_json::from_slice(&content).map_err(|e| corrupt(e.to_string()))?;
        if &record.key != key {
            return Err(corrupt(format!("entry is for key {}", record.key)));
        }
        let data = base64::engine::general_purpose::STANDARD
            .decode(record.data_base64.as_bytes())
            .map_err(|e| corrupt(e.to_string()))?;
        if sha256_hex(&data) != record.sha256 {
            return Err(corrupt("payload hash mismatch".to_string()));
        }

        Ok(Some(CachedAsset {
            key: record.key,
            asset: Asset::new(data, record.content_type),
            created_at: record.created_at,
        }))
    }
}

impl CacheStore for FsCacheStore {
    fn get(&self, key: &AssetKey) -> Result<Option<CachedAsset>, StoreError> {
        self.read_entry(key, &self.entry_path(key))
    }

    fn put(&self, entry: &CachedAsset) -> Result<(), StoreError> {
        let path = self.entry_path(&entry.key);
        if let Some(existing) = self.read_entry(&entry.key, &path)? {
            return check_idempotent(&existing, entry);
        }

        let shard_dir = path
            .parent()
            .ok_or_else(|| StoreError::Unavailable("entry path has no parent".into()))?;
        fs::create_dir_all(shard_dir)?;

        let record = EntryRecord {
            key: entry.key.clone(),
            created_at: entry.created_at,
            content_type: entry.asset.content_type().to_string(),
            sha256: entry.asset.sha256(),
            data_base64: base64::engine::general_purpose::STANDARD.encode(entry.asset.bytes()),
        };
        let body = serde_json::to_vec(&record)
            .map_err(|e| StoreError::Unavailable(format!("serialize entry: {e}")))?;

        // Atomic publish: temp file in the same shard, then a no-clobber rename.
        let mut tmp = NamedTempFile::new_in(shard_dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => {
                debug!(key = %entry.key.short(), bytes = entry.asset.len(), "cache entry written");
                Ok(())
            }
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                // Lost a race with another writer; the winner must agree with us.
                match self.read_entry(&entry.key, &path)? {
                    Some(existing) => check_idempotent(&existing, entry),
                    None => Err(StoreError::Unavailable(
                        "entry vanished after concurrent write".into(),
                    )),
                }
            }
            Err(e) => Err(e.error.into()),
        }
    }

    fn clear(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        for shard in fs::read_dir(&self.objects_dir)? {
            let shard = shard?.path();
            if !shard.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&shard)? {
                let path = entry?.path();
                if path.extension().map_or(false, |e| e == "json") {
                    removed += 1;
                }
            }
            fs::remove_dir_all(&shard)?;
        }
        Ok(removed)
    }
}
