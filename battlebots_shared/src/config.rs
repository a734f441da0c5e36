//! Configuration system.
//!
//! Loads battle configuration from JSON strings/files. Server and bot read
//! the same document; each ignores the fields meant for the other.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::math::Dimensions;

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleConfig {
    /// Server listen address, e.g. `127.0.0.1:40000`.
    pub server_addr: String,
    /// Fixed simulation tick rate.
    pub tick_hz: u32,
    /// Arena dimensionality.
    #[serde(default)]
    pub dimensions: Dimensions,
    /// Per-subscriber event buffer; overflowing it drops the subscriber.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    /// Bot identity (client only).
    #[serde(default = "default_bot_id")]
    pub bot_id: String,
    /// Control loop rate (client only).
    #[serde(default = "default_control_hz")]
    pub control_hz: u32,
    /// Receiver to control hand-off queue capacity (client only).
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

fn default_subscriber_buffer() -> usize {
    256
}

fn default_bot_id() -> String {
    "bot".to_string()
}

fn default_control_hz() -> u32 {
    30
}

fn default_event_queue_capacity() -> usize {
    64
}

impl Default for BattleConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:40000".to_string(),
            tick_hz: 64,
            dimensions: Dimensions::default(),
            subscriber_buffer: default_subscriber_buffer(),
            bot_id: default_bot_id(),
            control_hz: default_control_hz(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

impl BattleConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg = Self::from_json_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        debug!(path = %path.display(), "Loaded config");
        Ok(cfg)
    }
}
