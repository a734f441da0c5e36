//! Event fan-out.
//!
//! Each subscriber owns a bounded queue. `publish` never waits: an event that
//! does not fit drops the subscriber (drop-slow-consumer) and the other
//! subscribers carry on. A dropped subscriber drains what was already queued,
//! then sees the end of its stream with `overflowed()` set.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use battlebots_shared::event::StateChangeEvent;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info};

/// Identifies one registration with the broadcaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

struct Slot {
    tx: mpsc::Sender<StateChangeEvent>,
    overflowed: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    slots: HashMap<SubscriberId, Slot>,
}

struct Shared {
    buffer: usize,
    registry: Mutex<Registry>,
    dropped: AtomicU64,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        // Nothing panics while holding the lock, but stay usable if it ever does.
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fans state-change events out to every live subscription.
#[derive(Clone)]
pub struct EventBroadcaster {
    shared: Arc<Shared>,
}

impl EventBroadcaster {
    /// `buffer` is the per-subscriber queue bound (at least 1).
    pub fn new(buffer: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                buffer: buffer.max(1),
                registry: Mutex::new(Registry::default()),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a new delivery target.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.shared.buffer);
        let overflowed = Arc::new(AtomicBool::new(false));

        let mut registry = self.shared.registry();
        let id = SubscriberId(registry.next_id);
        registry.next_id += 1;
        registry.slots.insert(
            id,
            Slot {
                tx,
                overflowed: overflowed.clone(),
            },
        );
        let total = registry.slots.len();
        drop(registry);

        info!(subscriber = id.0, total, "Subscriber registered");
        Subscription {
            id,
            rx,
            overflowed,
            broadcaster: self.clone(),
        }
    }

    /// Removes a registration. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let removed = self.shared.registry().slots.remove(&id).is_some();
        if removed {
            info!(subscriber = id.0, "Subscriber removed");
        }
    }

    /// Delivers `event` to every currently registered subscriber.
    ///
    /// Returns how many subscribers accepted it.
    pub fn publish(&self, event: &StateChangeEvent) -> usize {
        let mut registry = self.shared.registry();
        let mut delivered = 0;
        let mut gone = Vec::new();

        for (id, slot) in &registry.slots {
            match slot.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    slot.overflowed.store(true, Ordering::Release);
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    error!(
                        subscriber = id.0,
                        buffer = self.shared.buffer,
                        bot = %event.bot,
                        "Subscriber buffer full; dropping slow consumer"
                    );
                    gone.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscriber = id.0, "Subscriber receiver gone");
                    gone.push(*id);
                }
            }
        }

        for id in gone {
            registry.slots.remove(&id);
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.registry().slots.len()
    }

    /// Subscribers dropped for overflowing their buffer since creation.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// One registration; unsubscribes itself when dropped.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<StateChangeEvent>,
    overflowed: Arc<AtomicBool>,
    broadcaster: EventBroadcaster,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once the registration has been removed and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<StateChangeEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StateChangeEvent> {
        self.rx.try_recv().ok()
    }

    /// Whether this subscriber was dropped for being too slow.
    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
    }
}
