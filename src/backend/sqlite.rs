//! SQLite-backed persistence.
//!
//! Schema:
//! - `cache`: (k BLOB PRIMARY KEY, data BLOB, flags BLOB)
//!
//! A single connection serialises all statements. The store already
//! allows only one mutation in flight, so there is nothing to pool.

use super::{Backend, BackendError};
use crate::storage::Entry;
use bytes::Bytes;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::debug;

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| BackendError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "FULL")?;

        Self::init(conn)
    }

    /// Open a private in-memory database.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, BackendError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, BackendError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS cache (
                k BLOB PRIMARY KEY,
                data BLOB NOT NULL,
                flags BLOB NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl Backend for SqliteBackend {
    fn load_all(&self) -> Result<Vec<(Bytes, Entry)>, BackendError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT k, data, flags FROM cache")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, data, flags) = row?;
            entries.push((Bytes::from(key), Entry::new(data, flags)));
        }

        debug!(count = entries.len(), "Loaded entries from sqlite");
        Ok(entries)
    }

    fn insert(&self, key: &[u8], entry: &Entry) -> Result<(), BackendError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO cache (k, data, flags) VALUES (?1, ?2, ?3)
             ON CONFLICT(k) DO UPDATE SET data = excluded.data, flags = excluded.flags",
        )?;
        stmt.execute(params![key, &entry.value[..], &entry.flags[..]])?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), BackendError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("DELETE FROM cache WHERE k = ?1")?;
        stmt.execute(params![key])?;
        Ok(())
    }

    fn delete_all(&self) -> Result<(), BackendError> {
        self.conn.lock().execute("DELETE FROM cache", [])?;
        Ok(())
    }
}
