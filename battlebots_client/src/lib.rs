//! `battlebots_client`
//!
//! Client-side systems:
//! - Battle RPC client (`Move` calls and the `State` event stream)
//! - Local state mirror rebuilt from received events
//! - Bot runtime: a receiver task and a fixed-cadence control loop joined by
//!   a bounded hand-off queue

pub mod client;
pub mod mirror;
pub mod runtime;

pub use client::{BattleClient, Bot, EventStream};
pub use mirror::{DefaultState, State};
pub use runtime::{run, BotRuntime, Controller, EventSource, RuntimeError, RuntimeSettings};
