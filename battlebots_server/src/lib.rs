//! `battlebots_server`
//!
//! Server-side systems:
//! - Authoritative world state with a fixed-timestep integrator
//! - Event fan-out with per-subscriber flow control
//! - The battle RPC service (`Move`, `State`)
//! - TCP transport with one task per connection

pub mod battle;
pub mod broadcast;
pub mod server;
pub mod world;

pub use battle::{Battle, BattleService, UnimplementedBattle};
pub use server::BattleServer;
