//! Durable key-value storage capability
//!
//! The host environment supplies an asynchronous key-value store. The core
//! only relies on `get`/`set` over whole values and treats the host as the
//! linearization point for individual key writes.
//!
//! Two implementations ship with the core: `MemoryStorage` for tests and
//! hosts without durable storage, and `FileStorage` which keeps every key in
//! a single JSON document on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::config::{StorageBackend, StorageConfig};
use crate::errors::PersistenceError;

/// Values keyed by storage key
pub type StorageMap = BTreeMap<String, Value>;

// ----------------------------------------------------------------------------
// Storage Trait
// ----------------------------------------------------------------------------

/// Asynchronous durable key-value storage supplied by the host
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    /// Read the given keys. Missing keys are absent from the result.
    async fn get(&self, keys: &[String]) -> Result<StorageMap, PersistenceError>;

    /// Write every entry of `items`
    async fn set(&self, items: StorageMap) -> Result<(), PersistenceError>;

    /// Delete the given keys
    async fn remove(&self, keys: &[String]) -> Result<(), PersistenceError>;

    /// List all stored keys
    async fn keys(&self) -> Result<Vec<String>, PersistenceError>;
}

/// Shared storage handle
pub type SharedStorage = Arc<dyn KeyValueStorage>;

// ----------------------------------------------------------------------------
// Memory Storage Implementation
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryInner {
    data: Mutex<StorageMap>,
    unavailable: AtomicBool,
    writes: AtomicU64,
}

/// In-memory storage for tests and memory-only hosts
///
/// Clones share the same data, so a test can drop every store built on one
/// handle and reopen them against another to simulate a process restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<MemoryInner>,
}

impl MemoryStorage {
    /// Create a new empty memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated host failure: every operation errors while unavailable
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Check if storage is currently accepting operations
    pub fn is_available(&self) -> bool {
        !self.inner.unavailable.load(Ordering::SeqCst)
    }

    /// Number of successful `set` calls
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Read a single value without going through the async trait
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StorageMap> {
        // A poisoned map is still a complete map: every mutation is one insert or remove.
        self.inner
            .data
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self) -> Result<(), PersistenceError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(PersistenceError::Unavailable)
        }
    }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn get(&self, keys: &[String]) -> Result<StorageMap, PersistenceError> {
        self.check()?;
        let data = self.lock();
        Ok(keys
            .iter()
            .filter_map(|key| data.get(key).map(|value| (key.clone(), value.clone())))
            .collect())
    }

    async fn set(&self, items: StorageMap) -> Result<(), PersistenceError> {
        self.check()?;
        self.lock().extend(items);
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<(), PersistenceError> {
        self.check()?;
        let mut data = self.lock();
        for key in keys {
            data.remove(key);
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, PersistenceError> {
        self.check()?;
        Ok(self.lock().keys().cloned().collect())
    }
}

// ----------------------------------------------------------------------------
// File Storage Implementation
// ----------------------------------------------------------------------------

/// Storage backed by one JSON document on disk
///
/// Each write rewrites the whole document through a temporary file and a
/// rename, so readers never observe a partially written snapshot.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStorage {
    /// Create a storage handle for the document at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Path of the backing document
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<StorageMap, PersistenceError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(StorageMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StorageMap::new()),
            Err(e) => Err(PersistenceError::Read {
                key: self.path.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn write_document(&self, document: &StorageMap) -> Result<(), PersistenceError> {
        let write_err = |e: std::io::Error| PersistenceError::Write {
            key: self.path.display().to_string(),
            reason: e.to_string(),
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
            }
        }

        let bytes = serde_json::to_vec_pretty(document)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(write_err)?;
        debug!("Wrote storage document {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl KeyValueStorage for FileStorage {
    async fn get(&self, keys: &[String]) -> Result<StorageMap, PersistenceError> {
        let mut document = self.read_document().await?;
        Ok(keys
            .iter()
            .filter_map(|key| document.remove(key).map(|value| (key.clone(), value)))
            .collect())
    }

    async fn set(&self, items: StorageMap) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;
        document.extend(items);
        self.write_document(&document).await
    }

    async fn remove(&self, keys: &[String]) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;
        for key in keys {
            document.remove(key);
        }
        self.write_document(&document).await
    }

    async fn keys(&self) -> Result<Vec<String>, PersistenceError> {
        Ok(self.read_document().await?.into_keys().collect())
    }
}

// ----------------------------------------------------------------------------
// Factory Functions
// ----------------------------------------------------------------------------

/// Create the storage backend described by `config`
pub fn create_storage(config: &StorageConfig) -> SharedStorage {
    match config.backend {
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        StorageBackend::File => Arc::new(FileStorage::new(config.path.clone())),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
