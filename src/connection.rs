//! Connection state machine for framing a client byte stream.
//!
//! Each connection accumulates bytes and tracks whether it is waiting for
//! a command line or for the data block of a storage command. The
//! listener's table of live connections also lives here.

use crate::protocol::{self, Command, ProtocolError, Response, StorageHeader};
use bytes::{Bytes, BytesMut};
use slab::Slab;
use std::net::SocketAddr;
use std::time::Instant;
use thiserror::Error;

/// Current framing state of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Waiting for a `\r\n`-terminated command line.
    AwaitingLine,
    /// Waiting for `bytes + 2` bytes of data block for this header.
    AwaitingPayload(StorageHeader),
}

/// A unit of work extracted from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A command that needs no data block
    Command(Command),
    /// A storage command together with its data block
    Storage {
        header: StorageHeader,
        payload: Bytes,
    },
    /// A line that failed to parse; the stream is still in sync
    Invalid(ProtocolError),
}

/// Framing failures. The stream cannot be resynchronised after one, so
/// the connection is closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("line too long")]
    LineTooLong,
    #[error("object too large for cache")]
    ValueTooLarge,
    #[error("bad data chunk")]
    BadDataChunk,
}

impl FrameError {
    /// Final reply sent before the connection is torn down.
    pub fn reply(&self) -> BytesMut {
        match self {
            FrameError::ValueTooLarge => Response::server_error(&self.to_string()),
            _ => Response::client_error(&self.to_string()),
        }
    }
}

/// Size limits applied while framing.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_line_length: usize,
    pub max_value_size: usize,
}

/// Per-connection framing state.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    mode: Mode,
    read_buf: BytesMut,
    /// Prefix of `read_buf` already searched for a terminator
    scanned: usize,
    limits: Limits,
}

impl Connection {
    /// Create a new connection in the initial line-reading state.
    pub fn new(id: u64, limits: Limits) -> Self {
        Self {
            id,
            mode: Mode::AwaitingLine,
            read_buf: BytesMut::new(),
            scanned: 0,
            limits,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    #[cfg(test)]
    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    /// Buffer that socket reads append to.
    pub fn read_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    /// Append received bytes.
    #[cfg(test)]
    pub fn feed(&mut self, data: &[u8]) {
        self.read_buf.extend_from_slice(data);
    }

    /// Extract the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        loop {
            match std::mem::replace(&mut self.mode, Mode::AwaitingLine) {
                Mode::AwaitingLine => {
                    let Some(line_end) = find_crlf(&self.read_buf, self.scanned) else {
                        // A trailing '\r' may still be completed by the next read
                        if self.read_buf.len() > self.limits.max_line_length + 1 {
                            return Err(FrameError::LineTooLong);
                        }
                        self.scanned = self.read_buf.len().saturating_sub(1);
                        return Ok(None);
                    };
                    if line_end > self.limits.max_line_length {
                        return Err(FrameError::LineTooLong);
                    }

                    let mut line = self.read_buf.split_to(line_end + 2);
                    line.truncate(line_end);
                    self.scanned = 0;

                    match protocol::parse_line(&line) {
                        Ok(Command::Store(header)) => {
                            if header.bytes > self.limits.max_value_size {
                                return Err(FrameError::ValueTooLarge);
                            }
                            self.mode = Mode::AwaitingPayload(header);
                        }
                        Ok(command) => return Ok(Some(Frame::Command(command))),
                        Err(e) => return Ok(Some(Frame::Invalid(e))),
                    }
                }
                Mode::AwaitingPayload(header) => {
                    let needed = header.bytes + 2;
                    if self.read_buf.len() < needed {
                        self.mode = Mode::AwaitingPayload(header);
                        return Ok(None);
                    }

                    let mut payload = self.read_buf.split_to(needed);
                    if &payload[header.bytes..] != b"\r\n" {
                        return Err(FrameError::BadDataChunk);
                    }
                    payload.truncate(header.bytes);

                    return Ok(Some(Frame::Storage {
                        header,
                        payload: payload.freeze(),
                    }));
                }
            }
        }
    }
}

/// Find `\r\n` in buffer, starting the search at `from`.
fn find_crlf(buffer: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|pos| from + pos)
}

/// What the listener records about a live connection.
#[derive(Debug)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer: SocketAddr,
    pub opened_at: Instant,
}

/// Registry of active connections using slab allocation.
///
/// Owned by the listener task. Slots are reused; connection ids come from
/// a monotonic counter and never are.
pub struct ConnectionRegistry {
    connections: Slab<ConnectionInfo>,
    max_connections: usize,
    next_id: u64,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
            next_id: 1,
        }
    }

    /// Register a new connection.
    ///
    /// Returns `(slot, id)`, or `None` if the registry is at capacity.
    pub fn insert(&mut self, peer: SocketAddr) -> Option<(usize, u64)> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        let slot = self.connections.insert(ConnectionInfo {
            id,
            peer,
            opened_at: Instant::now(),
        });
        Some((slot, id))
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, slot: usize) -> Option<ConnectionInfo> {
        self.connections.try_remove(slot)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }
}
