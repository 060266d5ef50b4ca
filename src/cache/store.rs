//! Disk-backed result store.
//!
//! Each store is an LMDB environment owning a single key→value database.
//! Stores never evict on their own: correctness (never silently lose a
//! cached, possibly expensive result) is prioritized over bounded disk
//! usage, so the map size is a large but finite ceiling and operators manage
//! growth out of band. LMDB's lock protocol gives multiple cooperating
//! processes on one machine a multi-reader/single-writer discipline over a
//! shared store directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::TempDir;

use super::key::CacheKey;
use crate::error::{Error, Result, StoreError};

/// Size ceiling for a store's memory map. Entries are never evicted below it.
const MAP_SIZE: usize = 1 << 40; // 1 TiB

/// Bounded transparent retry on transient transaction contention.
const CONTENTION_RETRIES: u32 = 5;
const CONTENTION_DELAY: Duration = Duration::from_millis(25);

/// On-disk representation of one cache entry.
#[derive(Serialize, Deserialize)]
struct Envelope {
    value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
}

/// One named, disk-backed key→value store.
pub struct Store {
    env: Env,
    db: Database<Bytes, Bytes>,
    path: PathBuf,
    // Keeps a temporary store's directory alive for the store's lifetime.
    _tempdir: Option<TempDir>,
}

impl Store {
    fn open(path: &Path, tempdir: Option<TempDir>) -> std::result::Result<Self, StoreError> {
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(MAP_SIZE)
                .max_dbs(1)
                .open(path)
        }
        .map_err(|e| StoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| StoreError::DbOpen(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        Ok(Self {
            env,
            db,
            path: path.to_path_buf(),
            _tempdir: tempdir,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up a key. Entries past their expiry read as absent.
    pub fn get(&self, key: &CacheKey) -> std::result::Result<Option<Value>, StoreError> {
        let encoded = key.encode();
        self.with_contention_retry(|| {
            let rtxn = self
                .env
                .read_txn()
                .map_err(|e| StoreError::Transaction(e.to_string()))?;
            match self
                .db
                .get(&rtxn, &encoded)
                .map_err(|e| StoreError::Transaction(e.to_string()))?
            {
                Some(bytes) => {
                    let envelope: Envelope = serde_json::from_slice(bytes)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?;
                    if let Some(expires_at) = envelope.expires_at {
                        if expires_at <= Utc::now() {
                            return Ok(None);
                        }
                    }
                    Ok(Some(envelope.value))
                }
                None => Ok(None),
            }
        })
    }

    /// Store a value under a key, overwriting any previous entry.
    pub fn set(
        &self,
        key: &CacheKey,
        value: Value,
        expire: Option<Duration>,
        tag: Option<&str>,
    ) -> std::result::Result<(), StoreError> {
        let envelope = Envelope {
            value,
            expires_at: expire.and_then(|d| {
                chrono::Duration::from_std(d)
                    .ok()
                    .map(|d| Utc::now() + d)
            }),
            tag: tag.map(str::to_string),
        };
        let bytes =
            serde_json::to_vec(&envelope).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let encoded = key.encode();

        self.with_contention_retry(|| {
            let mut wtxn = self
                .env
                .write_txn()
                .map_err(|e| StoreError::Transaction(e.to_string()))?;
            self.db
                .put(&mut wtxn, &encoded, &bytes)
                .map_err(|e| StoreError::Transaction(e.to_string()))?;
            wtxn.commit()
                .map_err(|e| StoreError::Transaction(e.to_string()))
        })
    }

    /// Delete a key. With `allow_missing` unset, deleting an absent key
    /// fails with [`StoreError::MissingKey`].
    pub fn delete(&self, key: &CacheKey, allow_missing: bool) -> std::result::Result<(), StoreError> {
        let encoded = key.encode();
        let deleted = self.with_contention_retry(|| {
            let mut wtxn = self
                .env
                .write_txn()
                .map_err(|e| StoreError::Transaction(e.to_string()))?;
            let deleted = self
                .db
                .delete(&mut wtxn, &encoded)
                .map_err(|e| StoreError::Transaction(e.to_string()))?;
            wtxn.commit()
                .map_err(|e| StoreError::Transaction(e.to_string()))?;
            Ok(deleted)
        })?;

        if !deleted && !allow_missing {
            return Err(StoreError::MissingKey);
        }
        Ok(())
    }

    pub fn contains(&self, key: &CacheKey) -> std::result::Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    fn with_contention_retry<T>(
        &self,
        mut op: impl FnMut() -> std::result::Result<T, StoreError>,
    ) -> std::result::Result<T, StoreError> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e @ StoreError::Transaction(_)) if attempt + 1 < CONTENTION_RETRIES => {
                    attempt += 1;
                    tracing::warn!(store = %self.path.display(), attempt, "store contention, retrying: {e}");
                    std::thread::sleep(CONTENTION_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Owns every open store of one configuration, one per resolved path.
///
/// Constructed explicitly (typically inside a
/// [`CallContext`](crate::call::CallContext)) so independent configurations
/// can coexist in tests. Within a registry, `get_or_create` returns the same
/// `Arc<Store>` for the same resolved path; LMDB requires one environment
/// per path per process, so registries must not share a path.
pub struct StoreRegistry {
    default_path: RwLock<Option<PathBuf>>,
    stores: Mutex<HashMap<PathBuf, Arc<Store>>>,
    temp: Mutex<Option<Arc<Store>>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self {
            default_path: RwLock::new(None),
            stores: Mutex::new(HashMap::new()),
            temp: Mutex::new(None),
        }
    }

    pub fn set_default_path(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        tracing::info!(path = %path.display(), "default cache path configured");
        *self.default_path.write().expect("poisoned lock") = Some(path);
    }

    pub fn default_path(&self) -> Option<PathBuf> {
        self.default_path.read().expect("poisoned lock").clone()
    }

    /// Open (or return the already-open) store at `path`; `None` resolves
    /// the configured default path or fails with
    /// [`Error::NoDefaultPathConfigured`].
    pub fn get_or_create(&self, path: Option<&Path>) -> Result<Arc<Store>> {
        let requested = match path {
            Some(p) => p.to_path_buf(),
            None => self
                .default_path()
                .ok_or(Error::NoDefaultPathConfigured)?,
        };

        std::fs::create_dir_all(&requested).map_err(StoreError::Io)?;
        let resolved = requested
            .canonicalize()
            .map_err(StoreError::Io)?;

        let mut stores = self.stores.lock().expect("poisoned lock");
        if let Some(store) = stores.get(&resolved) {
            return Ok(store.clone());
        }
        let store = Arc::new(Store::open(&resolved, None)?);
        stores.insert(resolved, store.clone());
        Ok(store)
    }

    /// The registry's process-lifetime temporary store, created on first use.
    pub fn temporary(&self) -> Result<Arc<Store>> {
        let mut temp = self.temp.lock().expect("poisoned lock");
        if let Some(store) = temp.as_ref() {
            return Ok(store.clone());
        }
        let dir = TempDir::new().map_err(StoreError::Io)?;
        let dir_path = dir.path().to_path_buf();
        let store = Arc::new(Store::open(&dir_path, Some(dir))?);
        *temp = Some(store.clone());
        Ok(store)
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}
