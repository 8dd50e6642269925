//! Per-client connection state.
//!
//! Sockets are never awaited: reads and writes use `try_read`/`try_write`
//! and stop at `WouldBlock`, so one slow peer cannot stall the tick loop.
//! Each connection holds at most one outbound buffer. A new snapshot is
//! only queued once the previous one has fully drained.

use std::{
    fmt, io,
    net::SocketAddr,
    time::{Duration, Instant},
};

use arena_shared::{
    ecs::EntityId,
    error::ConnectionError,
    net::FrameDecoder,
};
use bytes::{Buf, Bytes};
use tokio::net::TcpStream;

/// Reads per poll before yielding to other connections.
const MAX_READS_PER_POLL: usize = 16;

/// Non-blocking byte stream.
pub trait Transport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl Transport for TcpStream {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, no player yet.
    Connecting,
    /// Player joined; receives snapshots.
    Established,
    /// Refused; the last frame is still being written.
    Draining,
    /// Waiting to be torn down.
    Closed,
}

pub struct Connection<T = TcpStream> {
    id: ConnId,
    peer: SocketAddr,
    transport: T,
    state: ConnState,
    decoder: FrameDecoder,
    outbound: Option<Bytes>,
    player: Option<EntityId>,
    skipped: u64,
    drain_started: Option<Instant>,
}

impl<T: Transport> Connection<T> {
    pub fn new(id: ConnId, peer: SocketAddr, transport: T) -> Self {
        Self {
            id,
            peer,
            transport,
            state: ConnState::Connecting,
            decoder: FrameDecoder::default(),
            outbound: None,
            player: None,
            skipped: 0,
            drain_started: None,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn player(&self) -> Option<EntityId> {
        self.player
    }

    /// Snapshots dropped because the previous one had not drained.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn has_pending(&self) -> bool {
        self.outbound.is_some()
    }

    pub fn establish(&mut self, player: EntityId) {
        self.player = Some(player);
        self.state = ConnState::Established;
    }

    pub fn close(&mut self) {
        self.state = ConnState::Closed;
    }

    /// Closes once the pending buffer has been written. Nothing more is
    /// read from or queued to a draining connection.
    pub fn close_after_flush(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Draining;
        self.drain_started = Some(Instant::now());
        if self.outbound.is_none() {
            self.state = ConnState::Closed;
        }
    }

    /// Gives up on a draining connection that has not flushed in `timeout`.
    pub fn drain_expired(&self, timeout: Duration) -> bool {
        self.state == ConnState::Draining && self.drain_started.is_some_and(|t| t.elapsed() >= timeout)
    }

    /// Takes the player id so teardown happens once.
    pub fn take_player(&mut self) -> Option<EntityId> {
        self.player.take()
    }

    /// Drains the socket and returns every complete frame body.
    pub fn poll_read(&mut self, scratch: &mut [u8]) -> Result<Vec<Bytes>, ConnectionError> {
        for _ in 0..MAX_READS_PER_POLL {
            match self.transport.try_read(scratch) {
                Ok(0) => return Err(ConnectionError::Closed),
                Ok(n) => self.decoder.extend(&scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let mut frames = Vec::new();
        while let Some(frame) = self.decoder.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Queues `frame` unless a previous one is still draining. Returns
    /// whether it was queued.
    pub fn queue(&mut self, frame: Bytes) -> bool {
        if self.outbound.is_some() {
            self.skipped += 1;
            return false;
        }
        self.outbound = Some(frame);
        true
    }

    /// Writes as much of the pending buffer as the socket takes.
    pub fn flush(&mut self) -> Result<(), ConnectionError> {
        while let Some(buf) = self.outbound.as_mut() {
            match self.transport.try_write(buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    buf.advance(n);
                    if !buf.has_remaining() {
                        self.outbound = None;
                        if self.state == ConnState::Draining {
                            self.state = ConnState::Closed;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
