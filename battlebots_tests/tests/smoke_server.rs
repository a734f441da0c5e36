use std::time::Duration;

use battlebots_shared::config::BattleConfig;
use battlebots_tests::{wait_until, TestBattle};

/// Smoke test: the tick loop advances and stops with the server.
#[tokio::test]
async fn server_runs_few_ticks() -> anyhow::Result<()> {
    let t = TestBattle::start(BattleConfig::default()).await?;

    let ticker = tokio::spawn({
        let battle = t.battle.clone();
        let shutdown = t.shutdown.clone();
        let tick_hz = t.cfg.tick_hz;
        async move { battle.run(tick_hz, shutdown).await }
    });

    wait_until(|| t.battle.tick_count() >= 3).await?;
    t.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), ticker).await??;
    t.stop().await?;
    Ok(())
}
