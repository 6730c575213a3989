//! Memcached text protocol parser and response generator.
//!
//! Parses single command lines (terminator already stripped):
//! - Retrieval: get
//! - Storage: set, add, replace (header only, the data block is framed
//!   by the connection)
//! - Deletion: delete, flush_all
//! - Other: stats, version, quit
//!
//! Keys, flags and values are treated as opaque bytes.

use crate::storage::WriteMode;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Maximum key length allowed by memcached protocol
pub const MAX_KEY_LENGTH: usize = 250;

/// Header of a storage command; the data block follows on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageHeader {
    pub mode: WriteMode,
    pub key: Bytes,
    pub flags: Bytes,
    /// Accepted but never enforced
    pub exptime: i64,
    /// Declared length of the data block
    pub bytes: usize,
}

/// Parsed memcached command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Get one or more keys
    Get { keys: Vec<Bytes> },

    /// set/add/replace; needs a data block before it can run
    Store(StorageHeader),

    /// Delete a key
    Delete { key: Bytes },

    /// Flush all items
    FlushAll,

    /// Get server statistics
    Stats,

    /// Get server version
    Version,

    /// Close connection
    Quit,

    /// Anything else, including an empty line
    Unknown(String),
}

/// Recoverable protocol errors, reported as `CLIENT_ERROR <msg>`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("bad command line format")]
    BadFormat,
    #[error("key too long")]
    KeyTooLong,
}

/// Parse one command line.
///
/// The command name is everything before the first space; the rest of the
/// line is the argument string (empty when there is no space).
pub fn parse_line(line: &[u8]) -> Result<Command, ProtocolError> {
    let (name, args) = match line.iter().position(|&b| b == b' ') {
        Some(pos) => (&line[..pos], &line[pos + 1..]),
        None => (line, &line[line.len()..]),
    };

    let parts: Vec<&[u8]> = args
        .split(|&b| b == b' ')
        .filter(|part| !part.is_empty())
        .collect();

    match name {
        b"get" => parse_get(&parts),
        b"set" => parse_storage(&parts, WriteMode::Set),
        b"add" => parse_storage(&parts, WriteMode::Add),
        b"replace" => parse_storage(&parts, WriteMode::Replace),
        b"delete" => parse_delete(&parts),
        b"flush_all" => parse_flush_all(&parts),
        b"stats" => Ok(Command::Stats),
        b"version" => Ok(Command::Version),
        b"quit" => Ok(Command::Quit),
        _ => Ok(Command::Unknown(String::from_utf8_lossy(name).into_owned())),
    }
}

/// Parse get command. An empty key list is a plain miss.
fn parse_get(parts: &[&[u8]]) -> Result<Command, ProtocolError> {
    let keys = parts
        .iter()
        .map(|&key| checked_key(key))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Command::Get { keys })
}

/// Parse storage command header
fn parse_storage(parts: &[&[u8]], mode: WriteMode) -> Result<Command, ProtocolError> {
    // Format: <command> <key> <flags> <exptime> <bytes> [noreply]
    if parts.len() != 4 && parts.len() != 5 {
        return Err(ProtocolError::BadFormat);
    }

    let key = checked_key(parts[0])?;
    let exptime = parse_number::<i64>(parts[2])?;
    let bytes = parse_number::<usize>(parts[3])?;

    // noreply is accepted and ignored

    Ok(Command::Store(StorageHeader {
        mode,
        key,
        flags: Bytes::copy_from_slice(parts[1]),
        exptime,
        bytes,
    }))
}

/// Parse delete command
fn parse_delete(parts: &[&[u8]]) -> Result<Command, ProtocolError> {
    // Format: delete <key> [noreply]
    match parts {
        [key] | [key, _] => Ok(Command::Delete {
            key: checked_key(key)?,
        }),
        _ => Err(ProtocolError::BadFormat),
    }
}

/// Parse flush_all command
fn parse_flush_all(parts: &[&[u8]]) -> Result<Command, ProtocolError> {
    // Format: flush_all [delay] [noreply]; the delay has no effect
    if parts.len() > 2 {
        return Err(ProtocolError::BadFormat);
    }
    Ok(Command::FlushAll)
}

fn checked_key(key: &[u8]) -> Result<Bytes, ProtocolError> {
    if key.len() > MAX_KEY_LENGTH {
        return Err(ProtocolError::KeyTooLong);
    }
    Ok(Bytes::copy_from_slice(key))
}

fn parse_number<T: std::str::FromStr>(field: &[u8]) -> Result<T, ProtocolError> {
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ProtocolError::BadFormat)
}

/// Response generator for memcached protocol
pub struct Response;

impl Response {
    /// Generate a VALUE block. Flags are always reported as 0.
    pub fn value(out: &mut BytesMut, key: &[u8], data: &[u8]) {
        out.extend_from_slice(b"VALUE ");
        out.extend_from_slice(key);
        out.extend_from_slice(format!(" 0 {}\r\n", data.len()).as_bytes());
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\n");
    }

    /// Generate END response
    pub fn end() -> &'static [u8] {
        b"END\r\n"
    }

    /// Generate STORED response
    pub fn stored() -> &'static [u8] {
        b"STORED\r\n"
    }

    /// Generate NOT_STORED response
    pub fn not_stored() -> &'static [u8] {
        b"NOT_STORED\r\n"
    }

    /// Generate NOT_FOUND response
    pub fn not_found() -> &'static [u8] {
        b"NOT_FOUND\r\n"
    }

    /// Generate DELETED response
    pub fn deleted() -> &'static [u8] {
        b"DELETED\r\n"
    }

    /// Generate OK response
    pub fn ok() -> &'static [u8] {
        b"OK\r\n"
    }

    /// Generate ERROR response
    pub fn error() -> &'static [u8] {
        b"ERROR\r\n"
    }

    /// Generate CLIENT_ERROR response
    pub fn client_error(msg: &str) -> BytesMut {
        BytesMut::from(format!("CLIENT_ERROR {msg}\r\n").as_bytes())
    }

    /// Generate SERVER_ERROR response
    pub fn server_error(msg: &str) -> BytesMut {
        BytesMut::from(format!("SERVER_ERROR {msg}\r\n").as_bytes())
    }

    /// Generate VERSION response
    pub fn version() -> &'static [u8] {
        concat!("VERSION mcstore ", env!("CARGO_PKG_VERSION"), "\r\n").as_bytes()
    }

    /// Generate a STAT line
    pub fn stat(out: &mut BytesMut, name: &str, value: &str) {
        out.extend_from_slice(format!("STAT {name} {value}\r\n").as_bytes());
    }
}
