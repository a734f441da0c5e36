//! Shared fixtures for the integration tests.

use std::{sync::Arc, time::Duration};

use battlebots_server::{server::bind_ephemeral, Battle};
use battlebots_shared::{config::BattleConfig, shutdown::Shutdown};
use tokio::task::JoinHandle;

/// Installs a test-friendly subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// A battle server accepting connections on an ephemeral port.
///
/// The tick loop is not started; tests drive `battle.tick` themselves unless
/// they spawn `Battle::run`.
pub struct TestBattle {
    pub battle: Arc<Battle>,
    pub cfg: BattleConfig,
    pub shutdown: Shutdown,
    pub serving: JoinHandle<anyhow::Result<()>>,
}

impl TestBattle {
    pub async fn start(cfg: BattleConfig) -> anyhow::Result<Self> {
        init_tracing();
        let (server, cfg) = bind_ephemeral(cfg).await?;
        let battle = server.service().clone();
        let shutdown = Shutdown::new();
        let serving = tokio::spawn(server.serve(shutdown.clone()));
        Ok(Self {
            battle,
            cfg,
            shutdown,
            serving,
        })
    }

    /// Config a bot with `bot_id` would use to reach this server.
    pub fn bot_config(&self, bot_id: &str) -> BattleConfig {
        BattleConfig {
            bot_id: bot_id.to_string(),
            ..self.cfg.clone()
        }
    }

    /// Waits until exactly `n` subscribers are registered.
    pub async fn wait_for_subscribers(&self, n: usize) -> anyhow::Result<()> {
        wait_until(|| self.battle.broadcaster().subscriber_count() == n).await
    }

    pub async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        self.serving.await?
    }
}

/// Polls `cond` every few milliseconds for up to two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}
