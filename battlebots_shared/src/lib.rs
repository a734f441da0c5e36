//! `battlebots_shared`
//!
//! Shared libraries used by both the battle server and bot clients.
//!
//! Design goals:
//! - One vocabulary for bots, vectors and state-change events on both sides.
//! - Explicit, versioned wire messages with a status for every failed call.
//! - Cooperative cancellation through a single cloneable signal.
//! - No `unsafe`.

pub mod config;
pub mod event;
pub mod math;
pub mod net;
pub mod shutdown;
