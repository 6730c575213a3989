//! Durable backends mirroring the in-memory store.
//!
//! The store writes through to a backend on every mutation and reads it
//! exactly once, at startup. Calls are synchronous; callers on the async
//! runtime reach them through `spawn_blocking`.

mod memory;
mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use crate::config::{BackendType, Config};
use crate::storage::Entry;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Errors raised by a durable backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Narrow persistence interface consumed by [`crate::storage::Store`].
pub trait Backend: Send + Sync {
    /// Read every persisted entry.
    fn load_all(&self) -> Result<Vec<(Bytes, Entry)>, BackendError>;

    /// Insert or overwrite one entry.
    fn insert(&self, key: &[u8], entry: &Entry) -> Result<(), BackendError>;

    /// Remove one entry. Removing an absent key is not an error.
    fn delete(&self, key: &[u8]) -> Result<(), BackendError>;

    /// Remove every entry.
    fn delete_all(&self) -> Result<(), BackendError>;
}

/// Open the backend selected by the configuration.
pub fn open(config: &Config) -> Result<Arc<dyn Backend>, BackendError> {
    match config.backend {
        BackendType::Sqlite => {
            info!(path = %config.database.display(), "Opening sqlite backend");
            Ok(Arc::new(SqliteBackend::open(&config.database)?))
        }
        BackendType::Memory => {
            info!("Using in-memory backend, entries will not survive a restart");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}
