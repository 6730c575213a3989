//! In-memory storage module with write-through persistence.
//!
//! Provides a thread-safe key-value store where:
//! - The in-memory map is the only source for reads
//! - Every mutation reaches the durable backend before memory changes
//! - At most one mutation is in flight at a time, so conditional
//!   writes (add/replace) cannot race each other

use crate::backend::{Backend, BackendError};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, trace, warn};

/// A single cached item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The stored value
    pub value: Bytes,
    /// Client-supplied flags, kept verbatim
    pub flags: Bytes,
}

impl Entry {
    pub fn new(value: impl Into<Bytes>, flags: impl Into<Bytes>) -> Self {
        Self {
            value: value.into(),
            flags: flags.into(),
        }
    }
}

/// Which precondition a write is subject to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Store unconditionally
    Set,
    /// Store only if the key is absent
    Add,
    /// Store only if the key is present
    Replace,
}

/// Result of a storage operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageResult {
    /// Operation succeeded
    Stored,
    /// Item was not stored (add on existing key, replace on missing key)
    NotStored,
    /// Successfully deleted
    Deleted,
    /// Item not found
    NotFound,
}

/// Errors surfaced by store mutations. Memory is untouched when one is returned.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("persistence failed: {0}")]
    Persistence(#[from] BackendError),
}

/// Thread-safe cache storage mirrored to a durable backend
pub struct Store {
    /// The authoritative map
    data: RwLock<HashMap<Bytes, Entry>>,
    /// Serialises mutations; held across the backend call
    write_lock: Mutex<()>,
    backend: Arc<dyn Backend>,
}

impl Store {
    /// Build a store from everything the backend holds.
    ///
    /// Must complete before any connection is accepted; an error here is
    /// fatal to startup.
    pub fn load(backend: Arc<dyn Backend>) -> Result<Arc<Self>, StoreError> {
        let entries = backend.load_all()?;
        let data: HashMap<Bytes, Entry> = entries.into_iter().collect();
        info!(items = data.len(), "Loaded store from backend");

        Ok(Arc::new(Self {
            data: RwLock::new(data),
            write_lock: Mutex::new(()),
            backend,
        }))
    }

    /// Get an item from memory. Never touches the backend.
    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.data.read().get(key).cloned()
    }

    /// Get multiple items, hits only, in the order requested
    pub fn get_multi<'a, I>(&self, keys: I) -> Vec<(Bytes, Entry)>
    where
        I: IntoIterator<Item = &'a Bytes>,
    {
        keys.into_iter()
            .filter_map(|key| self.get(key).map(|item| (key.clone(), item)))
            .collect()
    }

    /// Store an item subject to `mode`'s precondition.
    ///
    /// The precondition is checked and the write applied under the
    /// mutation lock. The backend is written first; memory is updated
    /// only once that succeeds.
    pub fn store(
        &self,
        mode: WriteMode,
        key: Bytes,
        entry: Entry,
    ) -> Result<StorageResult, StoreError> {
        let _guard = self.write_lock.lock();

        let exists = self.data.read().contains_key(&key);
        let allowed = match mode {
            WriteMode::Set => true,
            WriteMode::Add => !exists,
            WriteMode::Replace => exists,
        };
        if !allowed {
            trace!(?mode, key = ?key, "Precondition failed");
            return Ok(StorageResult::NotStored);
        }

        if let Err(e) = self.backend.insert(&key, &entry) {
            warn!(key = ?key, error = %e, "Failed to persist item");
            return Err(e.into());
        }

        trace!(?mode, key = ?key, "Item stored");
        self.data.write().insert(key, entry);
        Ok(StorageResult::Stored)
    }

    /// Store unconditionally
    pub fn set(&self, key: Bytes, entry: Entry) -> Result<StorageResult, StoreError> {
        self.store(WriteMode::Set, key, entry)
    }

    /// Store only if the key is absent
    pub fn add(&self, key: Bytes, entry: Entry) -> Result<StorageResult, StoreError> {
        self.store(WriteMode::Add, key, entry)
    }

    /// Store only if the key is present
    pub fn replace(&self, key: Bytes, entry: Entry) -> Result<StorageResult, StoreError> {
        self.store(WriteMode::Replace, key, entry)
    }

    /// Delete an item. The key stays present if the backend refuses.
    pub fn delete(&self, key: &[u8]) -> Result<StorageResult, StoreError> {
        let _guard = self.write_lock.lock();

        if !self.data.read().contains_key(key) {
            return Ok(StorageResult::NotFound);
        }

        if let Err(e) = self.backend.delete(key) {
            warn!(key = ?Bytes::copy_from_slice(key), error = %e, "Failed to persist delete");
            return Err(e.into());
        }

        self.data.write().remove(key);
        trace!(key = ?Bytes::copy_from_slice(key), "Item deleted");
        Ok(StorageResult::Deleted)
    }

    /// Flush all items from the backend, then from memory
    pub fn flush_all(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();

        if let Err(e) = self.backend.delete_all() {
            warn!(error = %e, "Failed to persist flush");
            return Err(e.into());
        }

        self.data.write().clear();
        info!("Flushed all items");
        Ok(())
    }

    /// Number of distinct keys currently held
    pub fn len(&self) -> usize {
        self.data.read().len()
    }
}
