//! Authoritative world state.
//!
//! Holds exactly one entity per known bot and advances positions by explicit
//! Euler integration. `WorldState` itself is plain data; callers own it behind
//! a single exclusive lock (see `battle::Battle`) so a velocity change and a
//! tick never interleave on the same entity.

use std::collections::HashMap;

use battlebots_shared::{
    event::BotId,
    math::{Dimensions, Vector},
};
use tracing::debug;

/// Server-side record of one bot.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: BotId,
    pub position: Vector,
    pub velocity: Vector,
}

impl Entity {
    fn new(id: BotId) -> Self {
        Self {
            id,
            position: Vector::ZERO,
            velocity: Vector::ZERO,
        }
    }
}

#[derive(Debug, Default)]
pub struct WorldState {
    dims: Dimensions,
    entities: HashMap<BotId, Entity>,
}

impl WorldState {
    pub fn new(dims: Dimensions) -> Self {
        Self {
            dims,
            entities: HashMap::new(),
        }
    }

    pub fn get(&self, id: &BotId) -> Option<&Entity> {
        self.entities.get(id)
    }

    /// Returns the entity for `id`, inserting a zeroed one on first reference.
    pub fn create_or_get(&mut self, id: &BotId) -> &Entity {
        self.entry(id)
    }

    /// Sets the velocity of `id`. Position is untouched until the next tick.
    pub fn apply_velocity(&mut self, id: &BotId, velocity: Vector) {
        let velocity = velocity.project(self.dims);
        let ent = self.entry(id);
        ent.velocity = velocity;
    }

    /// Advances every moving entity by `velocity * dt`.
    ///
    /// Returns copies of exactly the entities whose position changed, so the
    /// caller can publish them after releasing the world.
    pub fn integrate(&mut self, dt: f64) -> Vec<Entity> {
        let mut changed = Vec::new();
        for ent in self.entities.values_mut() {
            if ent.velocity.is_zero() {
                continue;
            }
            let next = ent.position + ent.velocity * dt;
            if next != ent.position {
                ent.position = next;
                changed.push(ent.clone());
            }
        }
        changed
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    fn entry(&mut self, id: &BotId) -> &mut Entity {
        if !self.entities.contains_key(id) {
            debug!(bot = %id, "Entity created");
        }
        self.entities
            .entry(id.clone())
            .or_insert_with(|| Entity::new(id.clone()))
    }
}
