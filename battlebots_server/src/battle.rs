//! Battle service.
//!
//! `BattleService` is the RPC-facing surface. Every method has a default that
//! answers `NotImplemented`, so a partially built service still serves calls
//! instead of tearing the process down. `Battle` is the full implementation:
//! it composes the world state with the event broadcaster and drives the
//! fixed-rate tick.
//!
//! Locking discipline: the world sits behind one mutex that is held only for
//! the mutation itself. A tick copies the changed entities out, releases the
//! lock, and only then publishes.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use battlebots_shared::{
    config::BattleConfig,
    event::{BotId, StateChangeEvent},
    math::Dimensions,
    net::{MoveRequest, MoveResponse, StateChangeSubscription, Status},
    shutdown::Shutdown,
};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    broadcast::{EventBroadcaster, Subscription},
    world::{Entity, WorldState},
};

/// RPC surface of the battle server.
///
/// `caller` is the bot bound to the connection the call arrived on.
#[async_trait]
pub trait BattleService: Send + Sync + 'static {
    /// Sets the caller's velocity.
    async fn move_bot(&self, caller: &BotId, req: MoveRequest) -> Result<MoveResponse, Status> {
        let _ = (caller, req);
        Err(Status::unimplemented("Move"))
    }

    /// Opens a state-change event stream.
    async fn state(
        &self,
        caller: &BotId,
        sub: StateChangeSubscription,
    ) -> Result<Subscription, Status> {
        let _ = (caller, sub);
        Err(Status::unimplemented("State"))
    }
}

/// Service with no methods implemented yet.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnimplementedBattle;

impl BattleService for UnimplementedBattle {}

/// Authoritative battle: world state, event fan-out and tick loop.
pub struct Battle {
    world: Mutex<WorldState>,
    broadcaster: EventBroadcaster,
    ticks: AtomicU64,
}

impl Battle {
    pub fn new(dims: Dimensions, subscriber_buffer: usize) -> Self {
        Self {
            world: Mutex::new(WorldState::new(dims)),
            broadcaster: EventBroadcaster::new(subscriber_buffer),
            ticks: AtomicU64::new(0),
        }
    }

    pub fn from_config(cfg: &BattleConfig) -> Self {
        Self::new(cfg.dimensions, cfg.subscriber_buffer)
    }

    fn world(&self) -> MutexGuard<'_, WorldState> {
        self.world.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }

    /// Copy of one entity, if the bot is known.
    pub fn entity(&self, id: &BotId) -> Option<Entity> {
        self.world().get(id).cloned()
    }

    /// Copy of every entity.
    pub fn entities(&self) -> Vec<Entity> {
        self.world().iter().cloned().collect()
    }

    /// Returns the entity for `id`, creating it on first reference.
    pub fn create_or_get(&self, id: &BotId) -> Entity {
        self.world().create_or_get(id).clone()
    }

    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Runs one simulation step and publishes a position event per moved bot.
    ///
    /// Returns the number of events published.
    pub fn tick(&self, dt: f64) -> usize {
        let changed = self.world().integrate(dt);
        self.ticks.fetch_add(1, Ordering::Relaxed);

        for ent in &changed {
            let event = StateChangeEvent::position(ent.id.clone(), ent.position);
            self.broadcaster.publish(&event);
        }
        changed.len()
    }

    /// Ticks at `tick_hz` until `shutdown` is canceled.
    pub async fn run(&self, tick_hz: u32, shutdown: Shutdown) {
        let dt = Duration::from_secs_f64(1.0 / f64::from(tick_hz.max(1)));
        let mut next = Instant::now();
        info!(tick_hz, "Tick loop started");

        loop {
            next += dt;
            tokio::select! {
                _ = shutdown.canceled() => break,
                _ = tokio::time::sleep_until(next) => {}
            }
            let moved = self.tick(dt.as_secs_f64());
            if moved > 0 {
                debug!(tick = self.tick_count(), moved, "Tick");
            }
        }

        info!(ticks = self.tick_count(), "Tick loop stopped");
    }
}

#[async_trait]
impl BattleService for Battle {
    async fn move_bot(&self, caller: &BotId, req: MoveRequest) -> Result<MoveResponse, Status> {
        if !req.velocity.is_finite() {
            return Err(Status::invalid_argument("velocity must be finite"));
        }
        self.world().apply_velocity(caller, req.velocity);
        debug!(bot = %caller, velocity = ?req.velocity, "Velocity applied");
        Ok(MoveResponse::default())
    }

    async fn state(
        &self,
        caller: &BotId,
        _sub: StateChangeSubscription,
    ) -> Result<Subscription, Status> {
        let sub = self.broadcaster.subscribe();
        debug!(bot = %caller, subscriber = sub.id().0, "State stream opened");
        Ok(sub)
    }
}

#[cfg(test)]
mod tests {
    use battlebots_shared::{event::EventKind, math::Vector, net::Code};

    use super::*;

    #[tokio::test]
    async fn unimplemented_service_reports_status() {
        let svc = UnimplementedBattle;
        let caller = BotId::new("a");

        let err = svc
            .move_bot(&caller, MoveRequest { velocity: Vector::ZERO })
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::NotImplemented);

        let err = svc
            .state(&caller, StateChangeSubscription::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code, Code::NotImplemented);
    }

    #[tokio::test]
    async fn move_creates_unknown_caller() {
        let battle = Battle::new(Dimensions::Two, 8);
        let caller = BotId::new("new");
        battle
            .move_bot(&caller, MoveRequest { velocity: Vector::planar(1.0, 1.0) })
            .await
            .unwrap();

        let ent = battle.entity(&caller).unwrap();
        assert_eq!(ent.velocity, Vector::planar(1.0, 1.0));
        assert_eq!(ent.position, Vector::ZERO);
    }

    #[tokio::test]
    async fn non_finite_velocity_is_rejected() {
        let battle = Battle::new(Dimensions::Two, 8);
        let err = battle
            .move_bot(
                &BotId::new("a"),
                MoveRequest { velocity: Vector::planar(f64::NAN, 0.0) },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
        assert!(battle.entity(&BotId::new("a")).is_none());
    }

    #[tokio::test]
    async fn tick_publishes_moved_bots() {
        let battle = Battle::new(Dimensions::Two, 8);
        let mut sub = battle
            .state(&BotId::new("watcher"), StateChangeSubscription::default())
            .await
            .ok()
            .unwrap();

        battle.create_or_get(&BotId::new("idle"));
        battle
            .move_bot(&BotId::new("a"), MoveRequest { velocity: Vector::planar(1.0, 0.0) })
            .await
            .unwrap();

        assert_eq!(battle.tick(0.5), 1);
        assert_eq!(battle.tick(0.5), 1);

        let first = sub.try_recv().unwrap();
        assert_eq!(first.bot, BotId::new("a"));
        assert_eq!(
            first.event,
            EventKind::Position { position: Vector::planar(0.5, 0.0) }
        );
        let second = sub.try_recv().unwrap();
        assert_eq!(
            second.event,
            EventKind::Position { position: Vector::planar(1.0, 0.0) }
        );
        assert_eq!(sub.try_recv(), None);
        assert_eq!(battle.tick_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let battle = std::sync::Arc::new(Battle::new(Dimensions::Two, 8));
        let shutdown = Shutdown::new();
        let handle = tokio::spawn({
            let battle = battle.clone();
            let shutdown = shutdown.clone();
            async move { battle.run(10, shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(battle.tick_count(), 3);
    }
}
