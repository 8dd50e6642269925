//! Server implementation.
//!
//! One thread drives everything. Each pass of the loop:
//! - waits for a new connection, at most until the next tick or the poll
//!   timeout, whichever is sooner
//! - runs queued console lines
//! - reads every socket and applies decoded commands to the world
//! - steps the world and broadcasts a snapshot when the update interval
//!   has elapsed
//! - flushes outbound buffers and tears down closed connections
//!
//! A failing connection only ever affects its own player.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use arena_shared::{
    config::{ArenaConfig, SimConfig},
    console::{CommandLine, Console, CvarFlags, CvarValue, Exec},
    ecs::EntityId,
    error::{ConfigError, ConnectionError, DecodeError, SimError},
    net::{ClientCommand, Envelope, ServerMessage},
    world::{CommandOutcome, StepReport, World},
};
use bytes::Bytes;
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::conn::{ConnId, ConnState, Connection};

const READ_SCRATCH: usize = 64 * 1024;
/// How long a refused socket may take to receive its reject.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Cooperative stop signal, checked once per loop pass.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why an inbound frame was not applied.
#[derive(Debug, Error)]
enum DispatchError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Sim(#[from] SimError),
}

pub struct GameServer {
    cfg: ArenaConfig,
    pub console: Console,
    world: World,
    listener: TcpListener,
    conns: BTreeMap<ConnId, Connection>,
    next_conn: u64,
    shutdown: ShutdownFlag,
    console_rx: Option<mpsc::Receiver<String>>,
    next_tick: Instant,
    scratch: Vec<u8>,
    last_report: StepReport,
}

impl GameServer {
    /// Binds the listener and populates a fresh world.
    pub async fn bind(cfg: ArenaConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let addr = cfg.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ConfigError::Bind { addr, source })?;

        let mut world = World::new(cfg.sim.clone());
        world.populate();

        let mut console = Console::new();
        Self::register_console(&mut console, &cfg);

        Ok(Self {
            next_tick: Instant::now() + cfg.update_interval(),
            cfg,
            console,
            world,
            listener,
            conns: BTreeMap::new(),
            next_conn: 1,
            shutdown: ShutdownFlag::default(),
            console_rx: None,
            scratch: vec![0; READ_SCRATCH],
            last_report: StepReport::default(),
        })
    }

    fn register_console(console: &mut Console, cfg: &ArenaConfig) {
        console.register_cvar(
            "sv_maxclients",
            CvarValue::Int(cfg.max_clients as i64),
            "Connections beyond this are rejected",
            CvarFlags::NOTIFY,
        );
        console.register_cvar(
            "sv_shoot_cooldown",
            CvarValue::Float(f64::from(cfg.sim.shoot_cooldown_secs)),
            "Seconds between accepted shots, 0 trusts the client",
            CvarFlags::NOTIFY,
        );
        console.describe_command("status", "status: tick, connections and leaderboard");
        console.describe_command("kick", "kick <player id>: disconnect a player");
        console.describe_command("rewind", "rewind on|off: toggle global rewind");
        console.describe_command("quit", "quit: stop the server");
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.cfg
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.conns.values()
    }

    pub fn last_report(&self) -> &StepReport {
        &self.last_report
    }

    /// Runs until shutdown is requested.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        info!(
            addr = %self.local_addr()?,
            interval = ?self.cfg.update_interval(),
            "server running"
        );
        while !self.shutdown.is_requested() {
            self.poll_once().await;
        }
        info!(tick = self.world.tick(), "server stopped");
        Ok(())
    }

    /// Runs until `ticks` more simulation steps have happened.
    pub async fn run_for_ticks(&mut self, ticks: u64) {
        let target = self.world.tick() + ticks;
        while self.world.tick() < target && !self.shutdown.is_requested() {
            self.poll_once().await;
        }
    }

    /// One pass of the server loop.
    pub async fn poll_once(&mut self) {
        let wait = self
            .next_tick
            .saturating_duration_since(Instant::now())
            .min(self.cfg.poll_timeout());

        let accepted = tokio::select! {
            res = self.listener.accept() => Some(res),
            _ = tokio::time::sleep(wait) => None,
        };
        match accepted {
            Some(Ok((stream, peer))) => self.establish(stream, peer),
            Some(Err(e)) => warn!(error = %e, "accept failed"),
            None => {}
        }

        self.process_console();
        self.poll_network();

        let now = Instant::now();
        if now >= self.next_tick {
            self.tick();
            let interval = self.cfg.update_interval();
            self.next_tick += interval;
            if self.next_tick < now {
                // Fell behind by more than a tick; do not try to catch up.
                self.next_tick = now + interval;
            }
        }

        self.flush_all();
        self.teardown();
    }

    fn max_clients(&self) -> usize {
        self.console
            .get_int("sv_maxclients")
            .map_or(self.cfg.max_clients, |v| v.max(0) as usize)
    }

    /// Connections holding or waiting for a player slot.
    fn active_count(&self) -> usize {
        self.conns
            .values()
            .filter(|c| matches!(c.state(), ConnState::Connecting | ConnState::Established))
            .count()
    }

    /// Admits a new connection: player entity, roster entry, then the
    /// acknowledgement. Rejected sockets drain their reply before closing.
    fn establish(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = ConnId(self.next_conn);
        self.next_conn += 1;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(conn = %id, error = %e, "set_nodelay failed");
        }
        let mut conn = Connection::new(id, peer, stream);

        let reply = if self.active_count() >= self.max_clients() {
            warn!(conn = %id, %peer, "rejecting connection: server full");
            ServerMessage::JoinReject {
                reason: "server full".into(),
            }
        } else {
            let name = self.world.random_name();
            match self.world.add_player(name) {
                Ok(player) => {
                    conn.establish(player);
                    info!(conn = %id, %peer, player = %player, "client joined");
                    ServerMessage::JoinAcknowledge { player }
                }
                Err(e) => {
                    warn!(conn = %id, %peer, error = %e, "rejecting connection");
                    ServerMessage::JoinReject {
                        reason: e.to_string(),
                    }
                }
            }
        };
        let refused = matches!(reply, ServerMessage::JoinReject { .. });
        conn.queue(reply.encode_frame());
        if refused {
            conn.close_after_flush();
        }
        if let Err(e) = conn.flush() {
            debug!(conn = %id, error = %e, "initial write failed");
            conn.close();
        }
        self.conns.insert(id, conn);
    }

    fn process_console(&mut self) {
        let Some(rx) = self.console_rx.as_mut() else {
            return;
        };
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        for line in lines {
            match self.exec_console(&line) {
                Ok(out) => {
                    for l in out {
                        println!("{l}");
                    }
                }
                Err(e) => println!("error: {e:#}"),
            }
        }
    }

    /// Executes one console line.
    pub fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        match self.console.exec(line)? {
            Exec::Output(out) => {
                self.apply_cvars();
                Ok(out)
            }
            Exec::Forward(cmd) => self.run_command(&cmd),
        }
    }

    fn apply_cvars(&mut self) {
        if let Some(secs) = self.console.get_float("sv_shoot_cooldown") {
            self.world.set_shoot_cooldown(secs as f32);
        }
    }

    fn run_command(&mut self, cmd: &CommandLine) -> anyhow::Result<Vec<String>> {
        match cmd.name.as_str() {
            "status" => Ok(self.status()),
            "kick" => {
                let raw = cmd.arg(0).context("usage: kick <player id>")?;
                let player = EntityId(raw.parse().with_context(|| format!("bad player id {raw:?}"))?);
                match self.conns.values_mut().find(|c| c.player() == Some(player)) {
                    Some(conn) => {
                        info!(conn = %conn.id(), player = %player, "kicked");
                        conn.close();
                        Ok(vec![format!("kicked {player}")])
                    }
                    None => Ok(vec![format!("no connection for player {player}")]),
                }
            }
            "rewind" => {
                let on = match cmd.arg(0) {
                    Some("on" | "1") => true,
                    Some("off" | "0") => false,
                    _ => anyhow::bail!("usage: rewind on|off"),
                };
                let now = self.world.set_time_reverse(on);
                info!(requested = on, active = now, "global rewind toggled");
                Ok(vec![match (on, now) {
                    (true, false) => "nothing to rewind".to_owned(),
                    (_, active) => format!("rewind {}", if active { "on" } else { "off" }),
                }])
            }
            "quit" | "exit" => {
                info!("shutdown requested from console");
                self.shutdown.request();
                Ok(vec!["shutting down".to_owned()])
            }
            other => Ok(vec![format!("Unknown command: {other}")]),
        }
    }

    fn status(&self) -> Vec<String> {
        let mut out = vec![
            format!("tick {}", self.world.tick()),
            format!(
                "round {:.0}s left, rewind {}",
                self.world.round_remaining(),
                if self.world.is_time_reversed() { "on" } else { "off" }
            ),
            format!("connections {}", self.conns.len()),
        ];
        for conn in self.conns.values() {
            out.push(format!(
                "  {} {} {:?} player={:?} skipped={}",
                conn.id(),
                conn.peer(),
                conn.state(),
                conn.player().map(|p| p.0),
                conn.skipped()
            ));
        }
        for (rank, entry) in self.world.roster().entries().iter().enumerate() {
            out.push(format!(
                "  {:>2}. {:<12} {:>8}  {}",
                rank + 1,
                entry.username,
                entry.score,
                entry.player
            ));
        }
        out
    }

    /// Reads every connection and applies what arrived.
    fn poll_network(&mut self) {
        for conn in self.conns.values_mut() {
            if matches!(conn.state(), ConnState::Closed | ConnState::Draining) {
                continue;
            }
            let frames = match conn.poll_read(&mut self.scratch) {
                Ok(frames) => frames,
                Err(ConnectionError::Closed) => {
                    info!(conn = %conn.id(), "peer closed connection");
                    conn.close();
                    continue;
                }
                Err(e) => {
                    warn!(conn = %conn.id(), error = %e, "connection failed");
                    conn.close();
                    continue;
                }
            };
            let Some(player) = conn.player() else {
                continue;
            };
            for frame in frames {
                match dispatch(&mut self.world, player, &frame) {
                    Ok(CommandOutcome::Dropped) => {
                        debug!(conn = %conn.id(), "command dropped, world full")
                    }
                    Ok(_) => {}
                    Err(e) => debug!(conn = %conn.id(), error = %e, "ignoring message"),
                }
            }
        }
    }

    /// Steps the world and queues the snapshot for every joined client.
    fn tick(&mut self) {
        let dt = self.cfg.update_interval_secs;
        self.last_report = self.world.step(dt);
        let frame: Bytes = ServerMessage::FullUpdate(self.world.full_update()).encode_frame();

        let mut skipped = 0;
        for conn in self.conns.values_mut() {
            if conn.state() == ConnState::Established && !conn.queue(frame.clone()) {
                skipped += 1;
            }
        }
        debug!(
            tick = self.last_report.tick,
            bytes = frame.len(),
            clients = self.conns.len(),
            skipped,
            "broadcast"
        );
    }

    fn flush_all(&mut self) {
        for conn in self.conns.values_mut() {
            if let Err(e) = conn.flush() {
                if conn.state() != ConnState::Closed {
                    warn!(conn = %conn.id(), error = %e, "write failed");
                }
                conn.close();
            } else if conn.drain_expired(DRAIN_TIMEOUT) {
                debug!(conn = %conn.id(), "drain timed out");
                conn.close();
            }
        }
    }

    /// Removes closed connections together with their players.
    fn teardown(&mut self) {
        let closed: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, c)| c.state() == ConnState::Closed)
            .map(|(id, _)| *id)
            .collect();
        for id in closed {
            let Some(mut conn) = self.conns.remove(&id) else {
                continue;
            };
            if let Some(player) = conn.take_player() {
                if let Err(e) = self.world.remove_player(player) {
                    warn!(conn = %id, error = %e, "player already gone");
                }
            }
            debug!(conn = %id, remaining = self.conns.len(), "connection removed");
        }
    }
}

/// Decodes one frame body and applies it for `player`.
fn dispatch(world: &mut World, player: EntityId, body: &[u8]) -> Result<CommandOutcome, DispatchError> {
    let env = Envelope::decode(body)?;
    let cmd = ClientCommand::from_envelope(&env)?;
    Ok(world.apply(player, cmd)?)
}

/// Helper for tests: a server on an ephemeral localhost port.
pub async fn bind_ephemeral(sim: SimConfig) -> anyhow::Result<GameServer> {
    let cfg = ArenaConfig {
        server_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).to_string(),
        sim,
        ..ArenaConfig::default()
    };
    Ok(GameServer::bind(cfg).await?)
}

/// Helper for tests: like [`bind_ephemeral`] but keeps every other field of `cfg`.
pub async fn bind_ephemeral_with(cfg: ArenaConfig) -> anyhow::Result<GameServer> {
    let cfg = ArenaConfig {
        server_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).to_string(),
        ..cfg
    };
    Ok(GameServer::bind(cfg).await?)
}
