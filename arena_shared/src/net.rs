//! Wire protocol.
//!
//! Every message is one length-prefixed frame:
//!
//! ```text
//! [u32 body length][i32 origin][u32 len][subject utf-8][u32 len][event utf-8][u32 n][f32 * n]
//! ```
//!
//! All integers and floats are big-endian. The body is an [`Envelope`]; it is
//! decoded into a typed [`ClientCommand`] or [`ServerMessage`] right at the
//! boundary and the raw float payload goes no further.

use std::{fmt, str::FromStr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};

use crate::{
    ecs::{EntityId, EntityRecord, RECORD_WIDTH},
    error::{ConnectionError, DecodeError, FrameError},
    math::Vec2,
};

/// Largest accepted frame body. A full snapshot of the default table is
/// about 45 KiB.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Origin id used by the server.
pub const SERVER_ORIGIN: i32 = -1;

const LEN_PREFIX: usize = 4;
const USERNAME_SEPARATOR: char = '\0';

/// Generic message carried in every frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub origin_id: i32,
    pub subject: String,
    pub event: String,
    pub payload: Vec<f32>,
}

impl Envelope {
    pub fn new(origin_id: i32, subject: impl Into<String>, event: Event, payload: Vec<f32>) -> Self {
        Self {
            origin_id,
            subject: subject.into(),
            event: event.as_str().to_owned(),
            payload,
        }
    }

    fn body_len(&self) -> usize {
        4 + 4 + self.subject.len() + 4 + self.event.len() + 4 + 4 * self.payload.len()
    }

    /// Writes the body (without length prefix).
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.body_len());
        buf.put_i32(self.origin_id);
        put_str(buf, &self.subject);
        put_str(buf, &self.event);
        buf.put_u32(self.payload.len() as u32);
        for v in &self.payload {
            buf.put_f32(*v);
        }
    }

    /// Encodes a complete frame, ready to be written to a socket.
    pub fn encode_frame(&self) -> Bytes {
        let len = self.body_len();
        let mut buf = BytesMut::with_capacity(LEN_PREFIX + len);
        buf.put_u32(len as u32);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Parses one frame body. The whole body must be consumed.
    pub fn decode(mut body: &[u8]) -> Result<Self, DecodeError> {
        let origin_id = take(&mut body, 4, "origin id")?.get_i32();
        let subject = take_str(&mut body, "subject")?;
        let event = take_str(&mut body, "event")?;
        let count = take(&mut body, 4, "payload count")?.get_u32() as usize;
        let needed = count.checked_mul(4).unwrap_or(usize::MAX);
        let mut floats = take(&mut body, needed, "payload")?;
        let payload = (0..count).map(|_| floats.get_f32()).collect();
        if !body.is_empty() {
            return Err(DecodeError::TrailingBytes(body.len()));
        }
        Ok(Self {
            origin_id,
            subject,
            event,
            payload,
        })
    }

    pub fn event(&self) -> Result<Event, DecodeError> {
        self.event.parse()
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Splits `n` bytes off the front of `body`.
fn take<'a>(body: &mut &'a [u8], n: usize, field: &'static str) -> Result<&'a [u8], DecodeError> {
    if body.len() < n {
        return Err(DecodeError::Truncated {
            field,
            needed: n,
            remaining: body.len(),
        });
    }
    let (head, rest) = body.split_at(n);
    *body = rest;
    Ok(head)
}

fn take_str(body: &mut &[u8], field: &'static str) -> Result<String, DecodeError> {
    let len = take(body, 4, field)?.get_u32() as usize;
    let raw = take(body, len, field)?;
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|_| DecodeError::InvalidUtf8(field))
}

/// Reassembles frames from arbitrarily split byte chunks.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

impl FrameDecoder {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_len,
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame body, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_len,
            });
        }
        if self.buf.len() < LEN_PREFIX + len {
            self.buf.reserve(LEN_PREFIX + len - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(LEN_PREFIX);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

/// Closed set of protocol events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    JoinAcknowledge,
    JoinReject,
    RequestSteer,
    RequestShoot,
    UpdateFull,
}

impl Event {
    pub fn as_str(self) -> &'static str {
        match self {
            Event::JoinAcknowledge => "join-acknowledge",
            Event::JoinReject => "join-reject",
            Event::RequestSteer => "request-steer",
            Event::RequestShoot => "request-shoot",
            Event::UpdateFull => "update-full",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Event {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "join-acknowledge" => Event::JoinAcknowledge,
            "join-reject" => Event::JoinReject,
            "request-steer" => Event::RequestSteer,
            "request-shoot" => Event::RequestShoot,
            "update-full" => Event::UpdateFull,
            other => return Err(DecodeError::UnknownEvent(other.to_owned())),
        })
    }
}

/// Client to server request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClientCommand {
    Steer(Vec2),
    Shoot(Vec2),
}

impl ClientCommand {
    pub fn event(self) -> Event {
        match self {
            ClientCommand::Steer(_) => Event::RequestSteer,
            ClientCommand::Shoot(_) => Event::RequestShoot,
        }
    }

    pub fn to_envelope(self, origin_id: i32) -> Envelope {
        let (ClientCommand::Steer(dir) | ClientCommand::Shoot(dir)) = self;
        Envelope::new(origin_id, "", self.event(), vec![dir.x, dir.y])
    }

    pub fn from_envelope(env: &Envelope) -> Result<Self, DecodeError> {
        let event = env.event()?;
        let make: fn(Vec2) -> Self = match event {
            Event::RequestSteer => ClientCommand::Steer,
            Event::RequestShoot => ClientCommand::Shoot,
            other => {
                return Err(DecodeError::UnexpectedEvent {
                    expected: "request-steer or request-shoot",
                    got: other.as_str().to_owned(),
                })
            }
        };
        let [x, y] = env.payload[..] else {
            return Err(DecodeError::PayloadLength {
                event: event.as_str(),
                expected: 2,
                got: env.payload.len(),
            });
        };
        let dir = Vec2::new(x, y);
        if !dir.is_finite() {
            return Err(DecodeError::NonFinite(event.as_str()));
        }
        Ok(make(dir))
    }
}

/// One leaderboard line of a full update.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaderboardRow {
    pub username: String,
    pub score: u32,
    pub player: EntityId,
}

/// Complete world snapshot sent every tick.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FullUpdate {
    /// Highest score first.
    pub leaderboard: Vec<LeaderboardRow>,
    pub remaining_secs: f32,
    /// Every slot of the table, free ones included.
    pub entities: Vec<EntityRecord>,
}

impl FullUpdate {
    pub fn to_envelope(&self) -> Envelope {
        let n = self.leaderboard.len();
        let mut payload = Vec::with_capacity(2 * n + 1 + self.entities.len() * RECORD_WIDTH);
        payload.extend(self.leaderboard.iter().map(|r| r.score as f32));
        payload.extend(self.leaderboard.iter().map(|r| r.player.0 as f32));
        payload.push(self.remaining_secs);
        for rec in &self.entities {
            rec.write_floats(&mut payload);
        }
        let names: Vec<&str> = self.leaderboard.iter().map(|r| r.username.as_str()).collect();
        let subject = names.join(&USERNAME_SEPARATOR.to_string());
        Envelope::new(SERVER_ORIGIN, subject, Event::UpdateFull, payload)
    }

    fn from_envelope(env: &Envelope) -> Result<Self, DecodeError> {
        let names: Vec<&str> = if env.subject.is_empty() {
            Vec::new()
        } else {
            env.subject.split(USERNAME_SEPARATOR).collect()
        };
        let n = names.len();
        let header = 2 * n + 1;
        let table_len = env.payload.len().checked_sub(header);
        let Some(table_len) = table_len.filter(|len| len % RECORD_WIDTH == 0) else {
            return Err(DecodeError::PayloadLength {
                event: Event::UpdateFull.as_str(),
                expected: header,
                got: env.payload.len(),
            });
        };
        let scores = &env.payload[..n];
        let ids = &env.payload[n..2 * n];
        let leaderboard = names
            .iter()
            .zip(scores.iter().zip(ids))
            .map(|(name, (&score, &id))| LeaderboardRow {
                username: (*name).to_owned(),
                score: score.round().max(0.0) as u32,
                player: EntityId(id.round().max(0.0) as u32),
            })
            .collect();
        let entities = env.payload[header..]
            .chunks_exact(RECORD_WIDTH)
            .map(EntityRecord::from_floats)
            .collect::<Result<Vec<_>, _>>()?;
        debug_assert_eq!(entities.len() * RECORD_WIDTH, table_len);
        Ok(Self {
            leaderboard,
            remaining_secs: env.payload[2 * n],
            entities,
        })
    }
}

/// Server to client message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    JoinAcknowledge { player: EntityId },
    JoinReject { reason: String },
    FullUpdate(FullUpdate),
}

impl ServerMessage {
    pub fn to_envelope(&self) -> Envelope {
        match self {
            ServerMessage::JoinAcknowledge { player } => Envelope::new(
                SERVER_ORIGIN,
                "",
                Event::JoinAcknowledge,
                vec![player.0 as f32],
            ),
            ServerMessage::JoinReject { reason } => {
                Envelope::new(SERVER_ORIGIN, reason.as_str(), Event::JoinReject, Vec::new())
            }
            ServerMessage::FullUpdate(update) => update.to_envelope(),
        }
    }

    pub fn encode_frame(&self) -> Bytes {
        self.to_envelope().encode_frame()
    }

    pub fn from_envelope(env: &Envelope) -> Result<Self, DecodeError> {
        match env.event()? {
            Event::JoinAcknowledge => {
                let [id] = env.payload[..] else {
                    return Err(DecodeError::PayloadLength {
                        event: Event::JoinAcknowledge.as_str(),
                        expected: 1,
                        got: env.payload.len(),
                    });
                };
                if !(id.is_finite() && id >= 0.0) {
                    return Err(DecodeError::NonFinite(Event::JoinAcknowledge.as_str()));
                }
                Ok(ServerMessage::JoinAcknowledge {
                    player: EntityId(id.round() as u32),
                })
            }
            Event::JoinReject => Ok(ServerMessage::JoinReject {
                reason: env.subject.clone(),
            }),
            Event::UpdateFull => Ok(ServerMessage::FullUpdate(FullUpdate::from_envelope(env)?)),
            other => Err(DecodeError::UnexpectedEvent {
                expected: "a server event",
                got: other.as_str().to_owned(),
            }),
        }
    }
}

/// Async framed TCP connection, used by the client link thread.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn connect(addr: &str) -> Result<Self, ConnectionError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    /// Splits into halves that can be driven from separate tasks.
    pub fn into_split(self) -> (FramedReader, FramedWriter) {
        let (rd, wr) = self.stream.into_split();
        (FramedReader::new(rd), FramedWriter { wr })
    }
}

/// Read half: yields whole frame bodies however the bytes arrive.
#[derive(Debug)]
pub struct FramedReader {
    rd: OwnedReadHalf,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl FramedReader {
    const CHUNK: usize = 16 * 1024;

    fn new(rd: OwnedReadHalf) -> Self {
        Self {
            rd,
            decoder: FrameDecoder::default(),
            chunk: vec![0u8; Self::CHUNK],
        }
    }

    /// Next frame body. `Closed` once the peer shuts its end.
    pub async fn recv_frame(&mut self) -> Result<Bytes, ConnectionError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(frame);
            }
            let n = self.rd.read(&mut self.chunk).await?;
            if n == 0 {
                return Err(ConnectionError::Closed);
            }
            self.decoder.extend(&self.chunk[..n]);
        }
    }
}

/// Write half.
#[derive(Debug)]
pub struct FramedWriter {
    wr: OwnedWriteHalf,
}

impl FramedWriter {
    pub async fn send(&mut self, env: &Envelope) -> Result<(), ConnectionError> {
        self.wr.write_all(&env.encode_frame()).await?;
        Ok(())
    }

    /// Half-closes the socket; the peer reads end of stream.
    pub async fn shutdown(&mut self) -> Result<(), ConnectionError> {
        self.wr.shutdown().await?;
        Ok(())
    }
}
