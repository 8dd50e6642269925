//! Client network link.
//!
//! The link owns the socket on a dedicated thread with its own runtime. The
//! game side only ever sees two bounded queues:
//! - inbound: decoded [`ServerMessage`]s
//! - outbound: [`ClientCommand`]s to send
//!
//! Dropping the outbound side (or calling [`ClientLink::shutdown`]) half-closes
//! the socket; the thread exits once the server closes its end.

use std::{sync::mpsc as std_mpsc, thread::JoinHandle};

use anyhow::Context;
use arena_shared::{
    error::ConnectionError,
    net::{ClientCommand, Envelope, FramedReader, ReliableConn, ServerMessage},
};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, info, warn};

/// The server identifies clients by their connection, not by origin id.
const UNASSIGNED_ORIGIN: i32 = -1;

/// Handle to a running network thread.
pub struct ClientLink {
    inbound: mpsc::Receiver<ServerMessage>,
    outbound: Option<mpsc::Sender<ClientCommand>>,
    thread: Option<JoinHandle<()>>,
    closed: bool,
}

impl ClientLink {
    /// Connects to `addr` and starts the network thread. Returns once the
    /// connection is established or has failed.
    pub fn spawn(addr: &str, capacity: usize) -> anyhow::Result<Self> {
        let capacity = capacity.max(1);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);

        let addr = addr.to_owned();
        let thread = std::thread::Builder::new()
            .name("arena-net".into())
            .spawn(move || run_link(addr, in_tx, out_rx, ready_tx))
            .context("spawn network thread")?;

        ready_rx
            .recv()
            .context("network thread exited during connect")?
            .context("connect")?;

        Ok(Self {
            inbound: in_rx,
            outbound: Some(out_tx),
            thread: Some(thread),
            closed: false,
        })
    }

    /// Drains every message that has arrived so far.
    pub fn poll(&mut self) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        loop {
            match self.inbound.try_recv() {
                Ok(msg) => out.push(msg),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
        out
    }

    /// Waits for the next message. `None` once the link has closed.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        let msg = self.inbound.recv().await;
        if msg.is_none() {
            self.closed = true;
        }
        msg
    }

    /// Queues a command without waiting. A full queue drops the command;
    /// the next sample replaces it anyway.
    pub fn send(&mut self, cmd: ClientCommand) -> Result<(), ConnectionError> {
        let Some(tx) = self.outbound.as_ref() else {
            return Err(ConnectionError::Closed);
        };
        match tx.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(cmd)) => {
                debug!(?cmd, "outbound queue full, command dropped");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => {
                self.closed = true;
                Err(ConnectionError::Closed)
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Half-closes the connection. Messages already queued stay readable.
    pub fn close(&mut self) {
        self.outbound = None;
        self.inbound.close();
        self.closed = true;
    }

    /// Closes and waits for the network thread, which exits once the server
    /// has closed its end. Blocks; call it from outside any runtime.
    pub fn shutdown(mut self) {
        self.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("network thread panicked");
            }
        }
    }
}

fn run_link(
    addr: String,
    inbound: mpsc::Sender<ServerMessage>,
    mut outbound: mpsc::Receiver<ClientCommand>,
    ready: std_mpsc::SyncSender<Result<(), ConnectionError>>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };

    rt.block_on(async move {
        let conn = match ReliableConn::connect(&addr).await {
            Ok(conn) => conn,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let _ = ready.send(Ok(()));
        info!(server = %addr, "connected");

        let (mut rd, mut wr) = conn.into_split();
        let writer = tokio::spawn(async move {
            while let Some(cmd) = outbound.recv().await {
                if let Err(e) = wr.send(&cmd.to_envelope(UNASSIGNED_ORIGIN)).await {
                    warn!(error = %e, "send failed");
                    return;
                }
            }
            let _ = wr.shutdown().await;
        });

        match read_loop(&mut rd, &inbound).await {
            Ok(()) | Err(ConnectionError::Closed) => info!("disconnected"),
            Err(e) => warn!(error = %e, "connection failed"),
        }
        writer.abort();
    });
}

/// Reads frames until the server closes or the game side goes away.
async fn read_loop(rd: &mut FramedReader, inbound: &mpsc::Sender<ServerMessage>) -> Result<(), ConnectionError> {
    loop {
        let frame = rd.recv_frame().await?;
        let msg = match Envelope::decode(&frame).and_then(|env| ServerMessage::from_envelope(&env)) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "dropping malformed server message");
                continue;
            }
        };
        if let ServerMessage::JoinReject { reason } = &msg {
            warn!(%reason, "join rejected");
        }
        if inbound.send(msg).await.is_err() {
            return Ok(());
        }
    }
}
