//! Standalone client binary: a bot that wanders at random.
//!
//! Usage:
//!   cargo run -p battlebots_client -- [--addr 127.0.0.1:40000] [--bot-id red]
//!                                     [--control-hz 30] [--move-every 10] [--config battle.json]
//!
//! The bot subscribes to the battle's state stream, mirrors every bot's
//! position, and picks a new random velocity every few control ticks.
//!
//! Console commands:
//!   quit                - Stop the bot

use std::env;
use std::io::BufRead;
use std::path::Path;

use async_trait::async_trait;
use battlebots_client::{run, Bot, Controller, DefaultState};
use battlebots_shared::{config::BattleConfig, math::Vector, shutdown::Shutdown};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info};

struct Args {
    cfg: BattleConfig,
    move_every: u64,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => BattleConfig::from_json_file(Path::new(&args[i + 1]))?,
        _ => BattleConfig::default(),
    };
    let mut move_every = 10;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--bot-id" if i + 1 < args.len() => {
                cfg.bot_id = args[i + 1].clone();
                i += 2;
            }
            "--control-hz" if i + 1 < args.len() => {
                cfg.control_hz = args[i + 1].parse().unwrap_or(cfg.control_hz);
                i += 2;
            }
            "--move-every" if i + 1 < args.len() => {
                move_every = args[i + 1].parse().unwrap_or(move_every);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(Args {
        cfg,
        move_every: move_every.max(1),
    })
}

/// Picks a new random velocity every `every` ticks.
struct RandomMover {
    bot: Bot,
    rng: StdRng,
    every: u64,
    ticks: u64,
}

#[async_trait]
impl Controller<DefaultState> for RandomMover {
    async fn tick(&mut self, state: &DefaultState) -> anyhow::Result<()> {
        self.ticks += 1;
        if self.ticks % self.every != 0 {
            return Ok(());
        }

        let velocity = Vector::planar(self.rng.gen_range(-1.0..1.0), self.rng.gen_range(-1.0..1.0));
        self.bot.move_with(velocity).await?;

        let position = state.get(self.bot.id()).map(|e| e.position);
        debug!(
            tick = self.ticks,
            ?position,
            ?velocity,
            known_bots = state.entities.len(),
            "Moved"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Args { cfg, move_every } = parse_args()?;
    info!(server = %cfg.server_addr, bot = %cfg.bot_id, control_hz = cfg.control_hz, "Starting bot");

    let shutdown = Shutdown::new();

    // Spawn stdin reader thread.
    std::thread::spawn({
        let shutdown = shutdown.clone();
        move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if matches!(line.trim(), "quit" | "exit") {
                    shutdown.cancel();
                    break;
                }
            }
        }
    });

    let result = run::<DefaultState, _, _>(
        &cfg,
        |bot| {
            Ok(RandomMover {
                bot,
                rng: StdRng::from_entropy(),
                every: move_every,
                ticks: 0,
            })
        },
        shutdown.clone(),
    )
    .await;

    match result {
        Err(e) if is_cancel(&e) => {
            info!("Bot stopped");
            Ok(())
        }
        other => other,
    }
}

fn is_cancel(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<battlebots_client::RuntimeError>(),
        Some(battlebots_client::RuntimeError::Canceled)
    )
}
