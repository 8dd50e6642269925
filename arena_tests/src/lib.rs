//! Helpers shared by the socket-level tests.

use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use arena_server::{server::bind_ephemeral_with, GameServer, ShutdownFlag};
use arena_shared::{
    config::{ArenaConfig, SimConfig},
    ecs::EntityId,
    net::{ClientCommand, Envelope, FrameDecoder, ServerMessage},
};
use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    task::JoinHandle,
};

/// How long a test waits for any single server message.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Small, seeded world with a fast tick.
pub fn test_config() -> ArenaConfig {
    ArenaConfig {
        update_interval_secs: 0.01,
        poll_timeout_ms: 1,
        sim: SimConfig {
            entity_capacity: 128,
            history_depth: 32,
            min_stars: 8,
            trap_count: 2,
            seed: Some(1),
            ..SimConfig::default()
        },
        ..ArenaConfig::default()
    }
}

/// A server running on its own task. Stopping it hands the server back so
/// tests can inspect the final world.
pub struct RunningServer {
    pub addr: SocketAddr,
    shutdown: ShutdownFlag,
    handle: JoinHandle<anyhow::Result<GameServer>>,
}

impl RunningServer {
    pub async fn start(cfg: ArenaConfig) -> anyhow::Result<Self> {
        let mut server = bind_ephemeral_with(cfg).await?;
        let addr = server.local_addr()?;
        let shutdown = server.shutdown_flag();
        let handle = tokio::spawn(async move {
            server.run().await?;
            Ok(server)
        });
        Ok(Self {
            addr,
            shutdown,
            handle,
        })
    }

    pub async fn stop(self) -> anyhow::Result<GameServer> {
        self.shutdown.request();
        self.handle.await.context("server task panicked")?
    }
}

/// Bare framed socket, for poking at the server below the client link.
pub struct RawClient {
    stream: TcpStream,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("connect")?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::default(),
            chunk: vec![0; 64 * 1024],
        }
    }

    pub async fn send(&mut self, cmd: ClientCommand) -> anyhow::Result<()> {
        self.send_raw(&cmd.to_envelope(-1).encode_frame()).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Next complete frame body, or `None` when the server closed.
    pub async fn recv_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }
            let n = tokio::time::timeout(RECV_TIMEOUT, self.stream.read(&mut self.chunk))
                .await
                .context("timed out waiting for the server")??;
            if n == 0 {
                return Ok(None);
            }
            self.decoder.extend(&self.chunk[..n]);
        }
    }

    pub async fn recv(&mut self) -> anyhow::Result<ServerMessage> {
        let Some(frame) = self.recv_frame().await? else {
            bail!("server closed the connection");
        };
        Ok(ServerMessage::from_envelope(&Envelope::decode(&frame)?)?)
    }

    /// Reads until `pick` returns a value.
    pub async fn recv_until<T>(&mut self, mut pick: impl FnMut(&ServerMessage) -> Option<T>) -> anyhow::Result<T> {
        loop {
            let msg = self.recv().await?;
            if let Some(v) = pick(&msg) {
                return Ok(v);
            }
        }
    }

    /// Connects and waits for the join acknowledgement.
    pub async fn join(addr: SocketAddr) -> anyhow::Result<(Self, EntityId)> {
        let mut client = Self::connect(addr).await?;
        match client.recv().await? {
            ServerMessage::JoinAcknowledge { player } => Ok((client, player)),
            other => bail!("expected join-acknowledge, got {other:?}"),
        }
    }
}
