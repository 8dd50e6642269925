//! Headless client binary.
//!
//! Usage:
//!   cargo run -p arena_client -- [--addr 127.0.0.1:40000] [--fps 60] [--secs 0]
//!
//! Connects, then plays as a wander bot: heads for the nearest star with some
//! jitter, fires now and then, and logs the leaderboard every few seconds.
//! `--secs 0` runs until the server goes away.

use std::env;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use arena_client::{
    client::ClientLink,
    input::{InputSampler, InputState},
    view::{JoinState, WorldView},
};
use arena_shared::{
    collision::Bounds,
    config::{ArenaConfig, DEFAULT_PORT},
    ecs::Kind,
    math::Vec2,
};
use rand::Rng;
use tracing::{info, warn};

const VIEWPORT: Vec2 = Vec2 { x: 800.0, y: 600.0 };
const REPORT_EVERY: Duration = Duration::from_secs(5);

struct Args {
    addr: String,
    fps: u32,
    secs: u64,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        addr: format!("127.0.0.1:{DEFAULT_PORT}"),
        fps: 60,
        secs: 0,
    };
    let mut it = env::args().skip(1);
    while let Some(flag) = it.next() {
        let mut value = || it.next().with_context(|| format!("{flag} needs a value"));
        match flag.as_str() {
            "--addr" => args.addr = value()?,
            "--fps" => args.fps = value()?.parse().context("--fps")?,
            "--secs" => args.secs = value()?.parse().context("--secs")?,
            other => bail!("unknown argument {other:?}"),
        }
    }
    Ok(args)
}

/// Picks the keys that roughly point along `want`.
fn keys_toward(want: Vec2) -> InputState {
    const DEAD_ZONE: f32 = 10.0;
    InputState {
        up: want.y > DEAD_ZONE,
        down: want.y < -DEAD_ZONE,
        right: want.x > DEAD_ZONE,
        left: want.x < -DEAD_ZONE,
        fire: false,
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args()?;
    let defaults = ArenaConfig::default();
    info!(server = %args.addr, fps = args.fps, "starting client");

    let mut link = ClientLink::spawn(&args.addr, defaults.link_queue_capacity).context("connect")?;
    let mut view = WorldView::new(
        Bounds::new(defaults.sim.half_width, defaults.sim.half_height),
        VIEWPORT,
    );
    let mut sampler = InputSampler::new();
    let mut rng = rand::thread_rng();

    let frame = Duration::from_secs_f64(1.0 / f64::from(args.fps.max(1)));
    let started = Instant::now();
    let mut last_frame = started;
    let mut last_report = started;
    let mut wander = Vec2::ZERO;

    loop {
        for msg in link.poll() {
            view.apply(msg);
        }
        if let JoinState::Rejected(reason) = view.join_state() {
            warn!(%reason, "join rejected");
            break;
        }
        if link.is_closed() {
            info!("server closed the connection");
            break;
        }
        if args.secs > 0 && started.elapsed() >= Duration::from_secs(args.secs) {
            break;
        }

        let now = Instant::now();
        let dt = (now - last_frame).as_secs_f32();
        last_frame = now;

        if view.local_player().is_some() {
            if rng.gen_bool(0.02) {
                wander = Vec2::new(rng.gen_range(-200.0..200.0), rng.gen_range(-200.0..200.0));
            }
            let mut input = match (view.local_record(), view.nearest(Kind::Star)) {
                (Some(me), Some((_, star))) => keys_toward(star.position - me.position + wander),
                _ => keys_toward(wander),
            };
            input.fire = rng.gen_bool(0.05);

            for cmd in sampler.sample(input, dt) {
                if link.send(cmd).is_err() {
                    break;
                }
            }
        }

        if last_report.elapsed() >= REPORT_EVERY {
            last_report = Instant::now();
            info!(
                updates = view.updates(),
                remaining = view.remaining_secs(),
                score = ?view.local_score(),
                camera = ?view.camera(),
                "status"
            );
            for (rank, row) in view.leaderboard().iter().take(5).enumerate() {
                info!(rank = rank + 1, name = %row.username, score = row.score, "leaderboard");
            }
        }

        std::thread::sleep(frame.saturating_sub(now.elapsed()));
    }

    link.shutdown();
    Ok(())
}
