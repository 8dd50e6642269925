//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p arena_server -- [--config arena.json] [--addr 0.0.0.0:40000] [--seed 7] [--max-clients 16]
//!
//! Console commands:
//!   status           - Show connections and leaderboard
//!   kick <id>        - Disconnect a player
//!   rewind on|off    - Toggle global rewind
//!   quit             - Shutdown server

use std::env;
use std::io::{BufRead, Write};

use anyhow::{bail, Context};
use arena_server::GameServer;
use arena_shared::config::ArenaConfig;
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<ArenaConfig> {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut cfg = ArenaConfig::default();

    // --config first so flags override the file.
    if let Some(i) = args.iter().position(|a| a == "--config") {
        let path = args.get(i + 1).context("--config needs a path")?;
        let text = std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;
        cfg = ArenaConfig::from_json_str(&text).with_context(|| format!("parse {path}"))?;
    }

    let mut it = args.iter();
    while let Some(flag) = it.next() {
        let mut value = || it.next().with_context(|| format!("{flag} needs a value"));
        match flag.as_str() {
            "--config" => {
                value()?;
            }
            "--addr" => cfg.server_addr = value()?.clone(),
            "--seed" => cfg.sim.seed = Some(value()?.parse().context("--seed")?),
            "--max-clients" => cfg.max_clients = value()?.parse().context("--max-clients")?,
            other => bail!("unknown argument {other:?}"),
        }
    }
    Ok(cfg)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(
        addr = %cfg.server_addr,
        interval_secs = cfg.update_interval_secs,
        max_clients = cfg.max_clients,
        "starting server"
    );

    let mut server = GameServer::bind(cfg).await.context("start server")?;

    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

    let shutdown = server.shutdown_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            shutdown.request();
        }
    });

    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'help' for commands, 'quit' to exit.");
    server.run().await
}
