//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p battlebots_server -- [--addr 127.0.0.1:40000] [--tick-hz 64] [--dims 2d]
//!                                     [--subscriber-buffer 256] [--config battle.json]
//!
//! The server accepts bot connections, runs the fixed timestep integrator,
//! and streams position changes to every subscribed bot.
//!
//! Console commands:
//!   status         - Show tick, bot and subscriber counts
//!   bots           - List every bot with position and velocity
//!   quit           - Shutdown server

use std::env;
use std::io::{BufRead, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use battlebots_server::{Battle, BattleServer};
use battlebots_shared::{config::BattleConfig, shutdown::Shutdown};
use tokio::sync::mpsc;
use tracing::{info, warn};

fn parse_args() -> anyhow::Result<BattleConfig> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => BattleConfig::from_json_file(Path::new(&args[i + 1]))?,
        _ => BattleConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(64);
                i += 2;
            }
            "--dims" if i + 1 < args.len() => {
                cfg.dimensions = args[i + 1].parse()?;
                i += 2;
            }
            "--subscriber-buffer" if i + 1 < args.len() => {
                cfg.subscriber_buffer = args[i + 1].parse().unwrap_or(cfg.subscriber_buffer);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

fn exec_console(line: &str, battle: &Battle, shutdown: &Shutdown) -> Vec<String> {
    match line.split_whitespace().next() {
        Some("status") => vec![
            format!("Tick: {}", battle.tick_count()),
            format!("Bots: {}", battle.entities().len()),
            format!("Subscribers: {}", battle.broadcaster().subscriber_count()),
            format!("Dropped slow subscribers: {}", battle.broadcaster().dropped_count()),
        ],
        Some("bots") => battle
            .entities()
            .into_iter()
            .map(|e| format!("  {}: pos={:?} vel={:?}", e.id, e.position, e.velocity))
            .collect(),
        Some("quit" | "exit") => {
            info!("Server shutting down");
            shutdown.cancel();
            Vec::new()
        }
        Some(other) => vec![format!("Unknown command: {other}")],
        None => Vec::new(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(
        addr = %cfg.server_addr,
        tick_hz = cfg.tick_hz,
        dimensions = ?cfg.dimensions,
        subscriber_buffer = cfg.subscriber_buffer,
        "Starting server"
    );

    let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
    let battle = Arc::new(Battle::from_config(&cfg));
    let server = BattleServer::bind(addr, battle.clone())
        .await
        .context("create server")?;
    let shutdown = Shutdown::new();

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

    // Spawn stdin reader thread.
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

    let ticker = tokio::spawn({
        let battle = battle.clone();
        let shutdown = shutdown.clone();
        let tick_hz = cfg.tick_hz;
        async move { battle.run(tick_hz, shutdown).await }
    });
    let serving = tokio::spawn(server.serve(shutdown.clone()));

    println!("Server ready. Type 'status' for info, 'bots' to list bots, 'quit' to exit.");
    println!();

    loop {
        tokio::select! {
            _ = shutdown.canceled() => break,
            line = console_rx.recv() => match line {
                Some(line) => {
                    for out in exec_console(&line, &battle, &shutdown) {
                        println!("{out}");
                    }
                }
                // Stdin closed; keep serving until something else stops us.
                None => shutdown.canceled().await,
            },
        }
    }

    ticker.await.context("tick loop")?;
    if let Err(e) = serving.await.context("accept loop")? {
        warn!(error = %e, "Server exited with error");
    }
    Ok(())
}
