//! Command execution.
//!
//! Maps a framed command to its effect on the store and the reply bytes.
//! Holds no per-connection state.

use crate::connection::Frame;
use crate::protocol::{Command, Response, StorageHeader};
use crate::stats::Stats;
use crate::storage::{Entry, StorageResult, Store, WriteMode};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tracing::{debug, trace};

/// What the connection should do with the outcome of a frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    /// Write these bytes back
    Data(BytesMut),
    /// Tear the connection down without replying
    Close,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<Store>,
    stats: Arc<Stats>,
}

impl Dispatcher {
    pub fn new(store: Arc<Store>, stats: Arc<Stats>) -> Self {
        Self { store, stats }
    }

    /// Whether executing `frame` may call into the durable backend.
    pub fn touches_backend(frame: &Frame) -> bool {
        matches!(
            frame,
            Frame::Storage { .. } | Frame::Command(Command::Delete { .. } | Command::FlushAll)
        )
    }

    /// Execute one frame. May block on the backend for mutations.
    pub fn execute(&self, frame: Frame) -> Reply {
        match frame {
            Frame::Command(command) => self.execute_command(command),
            Frame::Storage { header, payload } => {
                Reply::Data(self.execute_storage_command(header, payload))
            }
            Frame::Invalid(e) => {
                debug!(error = %e, "Protocol error");
                Reply::Data(Response::client_error(&e.to_string()))
            }
        }
    }

    /// Execute a command that carries no data block
    fn execute_command(&self, command: Command) -> Reply {
        let response = match command {
            Command::Get { keys } => {
                let items = self.store.get_multi(&keys);
                let hits = items.len() as u64;
                self.stats.record_get(hits, keys.len() as u64 - hits);

                let mut response = BytesMut::new();
                for (key, item) in items {
                    Response::value(&mut response, &key, &item.value);
                }
                response.extend_from_slice(Response::end());
                response
            }

            Command::Delete { key } => match self.store.delete(&key) {
                Ok(StorageResult::Deleted) => {
                    self.stats.record_delete(true);
                    BytesMut::from(Response::deleted())
                }
                Ok(_) => {
                    self.stats.record_delete(false);
                    BytesMut::from(Response::not_found())
                }
                Err(e) => Response::server_error(&e.to_string()),
            },

            Command::FlushAll => {
                self.stats.record_flush();
                match self.store.flush_all() {
                    Ok(()) => BytesMut::from(Response::ok()),
                    Err(e) => Response::server_error(&e.to_string()),
                }
            }

            Command::Stats => {
                let mut response = BytesMut::new();
                for (name, value) in self.stats.snapshot(self.store.len()) {
                    Response::stat(&mut response, name, &value);
                }
                response.extend_from_slice(Response::end());
                response
            }

            Command::Version => BytesMut::from(Response::version()),

            Command::Quit => return Reply::Close,

            Command::Unknown(name) => {
                debug!(command = %name, "Unknown command");
                BytesMut::from(Response::error())
            }

            // Connection framing turns every storage header into Frame::Storage
            Command::Store(_) => {
                unreachable!("storage header dispatched without its data block")
            }
        };

        Reply::Data(response)
    }

    /// Execute a storage command (set, add, replace)
    fn execute_storage_command(&self, header: StorageHeader, payload: Bytes) -> BytesMut {
        trace!(
            mode = ?header.mode,
            key = ?header.key,
            bytes = header.bytes,
            exptime = header.exptime,
            "Processing storage command"
        );
        self.stats.record_set();

        let entry = Entry {
            value: payload,
            flags: header.flags,
        };

        let result = match header.mode {
            WriteMode::Set => self.store.set(header.key, entry),
            WriteMode::Add => self.store.add(header.key, entry),
            WriteMode::Replace => self.store.replace(header.key, entry),
        };

        match result {
            Ok(StorageResult::Stored) => BytesMut::from(Response::stored()),
            Ok(_) => BytesMut::from(Response::not_stored()),
            Err(e) => Response::server_error(&e.to_string()),
        }
    }
}
