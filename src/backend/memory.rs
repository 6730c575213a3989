//! Process-local backend. Survives store reloads, not process restarts.

use super::{Backend, BackendError};
use crate::storage::Entry;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<Bytes, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mirrored entries.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Backend for MemoryBackend {
    fn load_all(&self) -> Result<Vec<(Bytes, Entry)>, BackendError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect())
    }

    fn insert(&self, key: &[u8], entry: &Entry) -> Result<(), BackendError> {
        self.entries
            .lock()
            .insert(Bytes::copy_from_slice(key), entry.clone());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), BackendError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn delete_all(&self) -> Result<(), BackendError> {
        self.entries.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_overwrites() {
        let backend = MemoryBackend::new();
        backend.insert(b"k", &Entry::new("v1", "0")).unwrap();
        backend.insert(b"k", &Entry::new("v2", "7")).unwrap();

        let all = backend.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].1, Entry::new("v2", "7"));
    }

    #[test]
    fn test_delete_and_clear() {
        let backend = MemoryBackend::new();
        backend.insert(b"a", &Entry::new("1", "0")).unwrap();
        backend.insert(b"b", &Entry::new("2", "0")).unwrap();

        backend.delete(b"a").unwrap();
        backend.delete(b"missing").unwrap();
        assert_eq!(backend.len(), 1);

        backend.delete_all().unwrap();
        assert!(backend.load_all().unwrap().is_empty());
    }
}
