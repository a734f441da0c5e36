//! State-change events.
//!
//! Every event names one bot (its subject) and carries one kind of change.
//! Events about the same bot are delivered in the order they were produced;
//! nothing is promised across different bots.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::math::Vector;

/// Opaque bot identifier, stable for the lifetime of the bot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BotId(String);

impl BotId {
    pub fn new(id: impl Into<String>) -> Self {
        BotId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BotId {
    fn from(s: &str) -> Self {
        BotId::new(s)
    }
}

impl From<String> for BotId {
    fn from(s: String) -> Self {
        BotId(s)
    }
}

/// What changed about the subject.
///
/// Receivers must tolerate `Unknown`: a newer server may emit kinds this
/// build has never heard of, and those decode to `Unknown` instead of failing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// The bot's authoritative position after a tick.
    Position { position: Vector },
    #[serde(other)]
    Unknown,
}

/// Immutable notification of an authoritative state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub bot: BotId,
    pub event: EventKind,
}

impl StateChangeEvent {
    pub fn position(bot: BotId, position: Vector) -> Self {
        Self {
            bot,
            event: EventKind::Position { position },
        }
    }

    pub fn subject(&self) -> &BotId {
        &self.bot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_event_wire_shape() {
        let ev = StateChangeEvent::position(BotId::new("a"), Vector::planar(1.0, 2.0));
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["bot"], "a");
        assert_eq!(json["event"]["kind"], "position");
        assert_eq!(json["event"]["position"]["x"], 1.0);
    }

    #[test]
    fn unknown_kind_decodes_as_unknown() {
        let raw = r#"{"bot":"a","event":{"kind":"health","hp":3}}"#;
        let ev: StateChangeEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(ev.event, EventKind::Unknown);
        assert_eq!(ev.subject(), &BotId::new("a"));
    }
}
