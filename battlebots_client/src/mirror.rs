//! Local state mirror.
//!
//! The client's read model of the battle, rebuilt from received events. The
//! runtime is generic over `State`, so a bot can keep whatever shape suits
//! its controller; `DefaultState` is the plain id → last-known-fields map.

use std::collections::HashMap;

use battlebots_shared::{
    event::{BotId, EventKind, StateChangeEvent},
    math::Vector,
};

/// Client-side state rebuilt from the event stream.
pub trait State: Send + Sync + 'static {
    /// Builds the empty state before the first event.
    fn init() -> anyhow::Result<Self>
    where
        Self: Sized;

    /// Folds one event into the state. An error stops the bot.
    fn apply_event(&mut self, event: &StateChangeEvent) -> anyhow::Result<()>;
}

/// Last known fields of one bot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MirroredEntity {
    pub position: Vector,
}

#[derive(Debug, Clone, Default)]
pub struct DefaultState {
    pub entities: HashMap<BotId, MirroredEntity>,
}

impl DefaultState {
    pub fn get(&self, id: &BotId) -> Option<&MirroredEntity> {
        self.entities.get(id)
    }
}

impl State for DefaultState {
    fn init() -> anyhow::Result<Self> {
        Ok(Self::default())
    }

    fn apply_event(&mut self, event: &StateChangeEvent) -> anyhow::Result<()> {
        match &event.event {
            EventKind::Position { position } => {
                let ent = self.entities.entry(event.bot.clone()).or_default();
                ent.position = *position;
            }
            // Kinds from a newer server; nothing to mirror yet.
            EventKind::Unknown => {}
        }
        Ok(())
    }
}
