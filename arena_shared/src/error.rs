//! Error taxonomy.
//!
//! Library code reports typed errors; binaries wrap them in `anyhow`.
//! - `CapacityExceeded`: entity table full.
//! - `DecodeError`: a complete frame carried a malformed envelope.
//! - `FrameError`: the byte stream itself can no longer be framed.
//! - `ConnectionError`: socket failure or close, scoped to one connection.
//! - `ConfigError`: invalid configuration or startup bind failure.

use std::net::SocketAddr;

use thiserror::Error;

use crate::ecs::EntityId;

/// No free slot left in the entity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("entity table full ({capacity} slots in use)")]
pub struct CapacityExceeded {
    pub capacity: usize,
}

/// Malformed envelope body.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("truncated {field}: needed {needed} bytes, {remaining} left")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),
    #[error("unknown event {0:?}")]
    UnknownEvent(String),
    #[error("event {event} expects {expected} payload floats, got {got}")]
    PayloadLength {
        event: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("event {0} carries a non-finite value")]
    NonFinite(&'static str),
    #[error("unknown entity kind {0}")]
    UnknownKind(f32),
    #[error("expected event {expected}, got {got}")]
    UnexpectedEvent { expected: &'static str, got: String },
}

/// Unrecoverable framing failure; the stream cannot be resynchronised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame length {len} exceeds limit {max}")]
    TooLarge { len: usize, max: usize },
}

/// Failure scoped to a single client connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("peer closed the connection")]
    Closed,
    #[error("socket i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing: {0}")]
    Frame(#[from] FrameError),
}

/// Invalid configuration or failure to bring the server up.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("bad address {0:?}")]
    Address(String),
}

/// Roster misuse by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SimError {
    #[error(transparent)]
    Capacity(#[from] CapacityExceeded),
    #[error("no session for player {0}")]
    UnknownPlayer(EntityId),
}
