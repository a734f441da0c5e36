//! Bot runtime.
//!
//! Two tasks share one bounded hand-off queue and one `Shutdown` signal:
//!
//! - The receiver waits on the event stream and pushes each event onto the
//!   queue. Both waits also watch the signal, so a stopped control loop can
//!   never leave it stuck. When it exits it drops its end, closing the queue.
//! - The control loop runs at a fixed cadence. Each cycle takes at most one
//!   queued event without waiting, applies it to the state, then calls the
//!   controller's `tick` exactly once. It stops when the queue is closed and
//!   drained, or when the signal is canceled. The signal is checked between
//!   cycles, never inside one.
//!
//! Queued events are applied one per cycle in arrival order; none is skipped
//! or coalesced. A full queue holds the receiver back, which in turn holds
//! back the stream, and never the control loop.
//!
//! The first task to fail records its error and cancels the signal; later
//! errors are discarded. `handle` returns that first error, `Canceled` when
//! the signal was canceled from outside, or `Ok` when the stream ended cleanly.

use std::{
    marker::PhantomData,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use battlebots_shared::{
    config::BattleConfig, event::StateChangeEvent, net::StateChangeSubscription,
    shutdown::Shutdown,
};
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TryRecvError},
    time::MissedTickBehavior,
};
use tracing::{debug, error, info};

use crate::{
    client::{BattleClient, Bot},
    mirror::State,
};

/// User control logic, called once per control cycle.
#[async_trait]
pub trait Controller<S: State>: Send + 'static {
    async fn tick(&mut self, state: &S) -> anyhow::Result<()>;
}

/// Where the receiver task reads events from.
#[async_trait]
pub trait EventSource: Send + 'static {
    /// Waits for the next event. `None` means the stream ended cleanly.
    async fn next_event(&mut self) -> anyhow::Result<Option<StateChangeEvent>>;
}

/// Terminal outcome of a bot runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("bot runtime canceled")]
    Canceled,
    #[error("event stream failed: {0:#}")]
    Stream(anyhow::Error),
    #[error("state init failed: {0:#}")]
    Init(anyhow::Error),
    #[error("applying event failed: {0:#}")]
    ApplyEvent(anyhow::Error),
    #[error("controller tick failed: {0:#}")]
    Controller(anyhow::Error),
    #[error("runtime task aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeSettings {
    /// Receiver → control hand-off capacity.
    pub queue_capacity: usize,
    /// Control loop period.
    pub tick_interval: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self::from_config(&BattleConfig::default())
    }
}

impl RuntimeSettings {
    pub fn from_config(cfg: &BattleConfig) -> Self {
        Self {
            queue_capacity: cfg.event_queue_capacity.max(1),
            tick_interval: Duration::from_secs_f64(1.0 / f64::from(cfg.control_hz.max(1))),
        }
    }
}

/// First error wins; the recorder also cancels the shared signal.
#[derive(Clone, Default)]
struct FirstError(Arc<Mutex<Option<RuntimeError>>>);

impl FirstError {
    fn record(&self, err: RuntimeError, shutdown: &Shutdown) {
        let mut slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        } else {
            debug!(error = %err, "Discarding later runtime error");
        }
        drop(slot);
        shutdown.cancel();
    }

    fn take(&self) -> Option<RuntimeError> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Receiver + control loop pair for one bot.
pub struct BotRuntime<S, C, E> {
    source: E,
    controller: C,
    settings: RuntimeSettings,
    _state: PhantomData<fn() -> S>,
}

impl<S, C, E> BotRuntime<S, C, E>
where
    S: State,
    C: Controller<S>,
    E: EventSource,
{
    pub fn new(source: E, controller: C, settings: RuntimeSettings) -> Self {
        Self {
            source,
            controller,
            settings,
            _state: PhantomData,
        }
    }

    /// Runs both tasks until they have both stopped.
    pub async fn handle(self, shutdown: Shutdown) -> Result<(), RuntimeError> {
        let (tx, rx) = mpsc::channel(self.settings.queue_capacity.max(1));
        let first = FirstError::default();

        let receiver = tokio::spawn({
            let shutdown = shutdown.clone();
            let first = first.clone();
            let source = self.source;
            async move {
                if let Err(e) = receive_loop(source, tx, &shutdown).await {
                    first.record(e, &shutdown);
                }
            }
        });

        let control = tokio::spawn({
            let shutdown = shutdown.clone();
            let first = first.clone();
            let controller = self.controller;
            let period = self.settings.tick_interval;
            async move {
                if let Err(e) = control_loop::<S, C>(controller, rx, period, &shutdown).await {
                    first.record(e, &shutdown);
                }
            }
        });

        let (r, c) = tokio::join!(receiver, control);
        for joined in [r, c] {
            if let Err(e) = joined {
                first.record(RuntimeError::Join(e), &shutdown);
            }
        }

        match first.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn receive_loop<E: EventSource>(
    mut source: E,
    tx: mpsc::Sender<StateChangeEvent>,
    shutdown: &Shutdown,
) -> Result<(), RuntimeError> {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.canceled() => return Err(RuntimeError::Canceled),
            next = source.next_event() => next,
        };

        let event = match next {
            Ok(Some(event)) => event,
            Ok(None) => {
                info!("Event stream ended");
                return Ok(());
            }
            Err(e) => {
                error!(error = %e, "Event stream failed");
                return Err(RuntimeError::Stream(e));
            }
        };

        tokio::select! {
            biased;
            _ = shutdown.canceled() => return Err(RuntimeError::Canceled),
            sent = tx.send(event) => {
                if sent.is_err() {
                    debug!("Control loop gone; receiver exiting");
                    return Ok(());
                }
            }
        }
    }
}

enum Cycle {
    Ticked { applied: bool },
    Closed,
}

async fn control_loop<S: State, C: Controller<S>>(
    mut controller: C,
    mut rx: mpsc::Receiver<StateChangeEvent>,
    period: Duration,
    shutdown: &Shutdown,
) -> Result<(), RuntimeError> {
    let mut state = S::init().map_err(RuntimeError::Init)?;
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.canceled() => break,
            _ = interval.tick() => {}
        }

        // A cycle always runs to completion; a tick cut short could leave a
        // `Move` half written on the shared connection.
        match cycle(&mut state, &mut controller, &mut rx).await? {
            Cycle::Ticked { applied } => {
                ticks += 1;
                if applied {
                    debug!(tick = ticks, "Event applied");
                }
            }
            Cycle::Closed => {
                info!(ticks, "Event queue closed and drained");
                return Ok(());
            }
        }
    }

    debug!(ticks, "Control loop canceled");
    Ok(())
}

/// One control cycle: take at most one queued event, never waiting for one,
/// then tick the controller.
async fn cycle<S: State, C: Controller<S>>(
    state: &mut S,
    controller: &mut C,
    rx: &mut mpsc::Receiver<StateChangeEvent>,
) -> Result<Cycle, RuntimeError> {
    let applied = match rx.try_recv() {
        Ok(event) => {
            state.apply_event(&event).map_err(|e| {
                error!(error = %e, bot = %event.bot, "Failed to apply event");
                RuntimeError::ApplyEvent(e)
            })?;
            true
        }
        Err(TryRecvError::Empty) => false,
        Err(TryRecvError::Disconnected) => return Ok(Cycle::Closed),
    };

    controller
        .tick(state)
        .await
        .map_err(RuntimeError::Controller)?;
    Ok(Cycle::Ticked { applied })
}

/// Connects as `cfg.bot_id`, subscribes, and runs the bot until it stops.
///
/// `init` builds the controller from a `Bot` handle bound to the connection.
pub async fn run<S, C, F>(cfg: &BattleConfig, init: F, shutdown: Shutdown) -> anyhow::Result<()>
where
    S: State,
    C: Controller<S>,
    F: FnOnce(Bot) -> anyhow::Result<C>,
{
    let client = Arc::new(BattleClient::from_config(cfg).await?);
    let stream = client.state(StateChangeSubscription::default()).await?;
    let controller = init(Bot::new(client.clone()))?;

    info!(bot = %client.bot(), control_hz = cfg.control_hz, "Bot runtime starting");
    BotRuntime::<S, C, _>::new(stream, controller, RuntimeSettings::from_config(cfg))
        .handle(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use battlebots_shared::{event::BotId, math::Vector};

    use super::*;

    /// Records how many events were applied.
    #[derive(Default)]
    struct Counting {
        applied: Vec<StateChangeEvent>,
    }

    impl State for Counting {
        fn init() -> anyhow::Result<Self> {
            Ok(Self::default())
        }

        fn apply_event(&mut self, event: &StateChangeEvent) -> anyhow::Result<()> {
            self.applied.push(event.clone());
            Ok(())
        }
    }

    /// Rejects every event.
    struct Corrupt;

    impl State for Corrupt {
        fn init() -> anyhow::Result<Self> {
            Ok(Corrupt)
        }

        fn apply_event(&mut self, _event: &StateChangeEvent) -> anyhow::Result<()> {
            anyhow::bail!("corrupt event")
        }
    }

    /// Counts ticks and mirrors the applied count; optionally cancels.
    struct Tally {
        ticks: Arc<AtomicUsize>,
        applied: Arc<AtomicUsize>,
        stop_after: Option<(usize, Shutdown)>,
    }

    impl Tally {
        fn new() -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let ticks = Arc::new(AtomicUsize::new(0));
            let applied = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    ticks: ticks.clone(),
                    applied: applied.clone(),
                    stop_after: None,
                },
                ticks,
                applied,
            )
        }
    }

    #[async_trait]
    impl Controller<Counting> for Tally {
        async fn tick(&mut self, state: &Counting) -> anyhow::Result<()> {
            let n = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            self.applied.store(state.applied.len(), Ordering::SeqCst);
            if let Some((limit, shutdown)) = &self.stop_after {
                if n >= *limit {
                    shutdown.cancel();
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Controller<Corrupt> for Tally {
        async fn tick(&mut self, _state: &Corrupt) -> anyhow::Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Controller<Counting> for Failing {
        async fn tick(&mut self, _state: &Counting) -> anyhow::Result<()> {
            anyhow::bail!("controller gave up")
        }
    }

    /// Yields the scripted results, then either ends or blocks forever.
    struct Scripted {
        events: std::collections::VecDeque<anyhow::Result<StateChangeEvent>>,
        then_block: bool,
    }

    impl Scripted {
        fn new(events: Vec<StateChangeEvent>, then_block: bool) -> Self {
            Self {
                events: events.into_iter().map(Ok).collect(),
                then_block,
            }
        }
    }

    #[async_trait]
    impl EventSource for Scripted {
        async fn next_event(&mut self) -> anyhow::Result<Option<StateChangeEvent>> {
            match self.events.pop_front() {
                Some(next) => next.map(Some),
                None if self.then_block => std::future::pending().await,
                None => Ok(None),
            }
        }
    }

    fn ev(x: f64) -> StateChangeEvent {
        StateChangeEvent::position(BotId::new("a"), Vector::planar(x, 0.0))
    }

    fn settings(capacity: usize) -> RuntimeSettings {
        RuntimeSettings {
            queue_capacity: capacity,
            tick_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn cycle_drains_at_most_one_event() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut state = Counting::default();
        let (mut tally, ticks, _) = Tally::new();

        for x in 0..3 {
            tx.send(ev(x as f64)).await.unwrap();
        }
        cycle(&mut state, &mut tally, &mut rx).await.unwrap();

        assert_eq!(state.applied.len(), 1);
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn scripted_events_before_ticks_one_three_five() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut state = Counting::default();
        let (mut tally, ticks, _) = Tally::new();

        for tick in 1..=5 {
            if tick % 2 == 1 {
                tx.send(ev(tick as f64)).await.unwrap();
            }
            match cycle(&mut state, &mut tally, &mut rx).await.unwrap() {
                Cycle::Ticked { applied } => assert_eq!(applied, tick % 2 == 1),
                Cycle::Closed => panic!("queue closed early"),
            }
        }

        assert_eq!(state.applied, vec![ev(1.0), ev(3.0), ev(5.0)]);
        assert_eq!(ticks.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn cycle_reports_closed_only_when_drained() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut state = Counting::default();
        let (mut tally, _, _) = Tally::new();

        tx.send(ev(0.0)).await.unwrap();
        drop(tx);

        assert!(matches!(
            cycle(&mut state, &mut tally, &mut rx).await.unwrap(),
            Cycle::Ticked { applied: true }
        ));
        assert!(matches!(
            cycle(&mut state, &mut tally, &mut rx).await.unwrap(),
            Cycle::Closed
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn five_ticks_apply_three_events_regardless_of_arrival() {
        let shutdown = Shutdown::new();
        let (mut tally, ticks, applied) = Tally::new();
        tally.stop_after = Some((5, shutdown.clone()));
        let source = Scripted::new(vec![ev(1.0), ev(3.0), ev(5.0)], true);

        let result = BotRuntime::<Counting, _, _>::new(source, tally, settings(1))
            .handle(shutdown)
            .await;

        assert!(matches!(result, Err(RuntimeError::Canceled)));
        assert_eq!(ticks.load(Ordering::SeqCst), 5);
        assert_eq!(applied.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_end_of_stream_applies_everything_then_returns_ok() {
        let (tally, ticks, applied) = Tally::new();
        let source = Scripted::new((0..5).map(|x| ev(x as f64)).collect(), false);

        let result = BotRuntime::<Counting, _, _>::new(source, tally, settings(1))
            .handle(Shutdown::new())
            .await;

        assert!(result.is_ok());
        assert_eq!(applied.load(Ordering::SeqCst), 5);
        assert!(ticks.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test]
    async fn cancel_interrupts_blocked_receive() {
        let shutdown = Shutdown::new();
        let (tally, _, _) = Tally::new();
        let source = Scripted::new(Vec::new(), true);

        let handle = tokio::spawn(
            BotRuntime::<Counting, _, _>::new(source, tally, settings(4)).handle(shutdown.clone()),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("runtime should stop promptly")
            .unwrap();
        assert!(matches!(result, Err(RuntimeError::Canceled)));
    }

    #[tokio::test(start_paused = true)]
    async fn apply_failure_is_terminal() {
        let (tally, _, _) = Tally::new();
        let shutdown = Shutdown::new();
        let source = Scripted::new(vec![ev(1.0)], true);

        let result = BotRuntime::<Corrupt, _, _>::new(source, tally, settings(4))
            .handle(shutdown.clone())
            .await;

        assert!(matches!(result, Err(RuntimeError::ApplyEvent(_))));
        assert!(shutdown.is_canceled());
    }

    #[tokio::test(start_paused = true)]
    async fn stream_error_is_surfaced() {
        let (tally, _, _) = Tally::new();
        let mut source = Scripted::new(vec![ev(1.0)], true);
        source.events.push_back(Err(anyhow::anyhow!("decode failed")));

        let result = BotRuntime::<Counting, _, _>::new(source, tally, settings(4))
            .handle(Shutdown::new())
            .await;

        match result {
            Err(RuntimeError::Stream(e)) => assert!(e.to_string().contains("decode failed")),
            other => panic!("expected stream error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn controller_failure_stops_the_receiver() {
        let source = Scripted::new(Vec::new(), true);

        let result = BotRuntime::<Counting, _, _>::new(source, Failing, settings(4))
            .handle(Shutdown::new())
            .await;

        assert!(matches!(result, Err(RuntimeError::Controller(_))));
    }

    /// Cancels mid-tick, then keeps working before returning.
    struct SlowFinish {
        shutdown: Shutdown,
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Controller<Counting> for SlowFinish {
        async fn tick(&mut self, _state: &Counting) -> anyhow::Result<()> {
            self.shutdown.cancel();
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_lets_the_running_tick_finish() {
        let shutdown = Shutdown::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let controller = SlowFinish {
            shutdown: shutdown.clone(),
            finished: finished.clone(),
        };
        let source = Scripted::new(Vec::new(), true);

        let result = BotRuntime::<Counting, _, _>::new(source, controller, settings(4))
            .handle(shutdown)
            .await;

        assert!(matches!(result, Err(RuntimeError::Canceled)));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
