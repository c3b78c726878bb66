use std::sync::Arc;

use chrono::Utc;
use tradeloop::controller::{load_state, AdaptiveController, ControllerSettings, CycleOutcome};
use tradeloop::domain::{ExitReason, Side, Trade};
use tradeloop::store::{MemoryTradeStore, TradeStore};
use tradeloop::strategy_config::StrategyConfig;

async fn winning_store() -> Arc<MemoryTradeStore> {
    let store = Arc::new(MemoryTradeStore::default());
    for i in 0..60 {
        let id = format!("t{i}");
        let t = Trade::open(id.clone(), "BTCUSDT", Side::Buy, 1.0, 100.0, "mr", Utc::now()).unwrap();
        store.log_trade(t).await.unwrap();
        let (exit, reason) = if i % 20 < 13 { (120.0, ExitReason::TakeProfit) } else { (90.0, ExitReason::Signal) };
        store.close_trade(&id, exit, Utc::now(), reason).await.unwrap();
    }
    store
}

fn settings(path: std::path::PathBuf) -> ControllerSettings {
    ControllerSettings { state_path: Some(path), ..Default::default() }
}

#[tokio::test]
async fn persist_then_restore_only_tunables() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("learning.json");

    let store = winning_store().await;
    let ctl = AdaptiveController::new(store.clone(), settings(path.clone()), StrategyConfig::default()).await;
    assert_eq!(ctl.force_cycle().await, CycleOutcome::Completed { adjustments: 2 });
    assert!(path.exists());
    ctl.shutdown().await;

    let (state, tunables) = load_state(&path).await.unwrap().unwrap();
    assert_eq!(state.total_cycles, 1);
    assert_eq!(tunables.rsi_oversold, Some(28.0));

    // Fresh process with different structural settings: tunables come back, structure stays.
    let base = StrategyConfig { daily_loss_limit: 777.0, rsi_overbought: 75.0, ..Default::default() };
    let restored = AdaptiveController::new(store, settings(path.clone()), base).await;
    let cfg = restored.config();
    assert_eq!(cfg.rsi_oversold, 28.0);
    assert_eq!(cfg.max_positions, 6);
    assert_eq!(cfg.daily_loss_limit, 777.0);
    assert_eq!(cfg.rsi_overbought, 75.0);
    assert_eq!(restored.state().total_cycles, 1);
    assert!(!dir.path().join("state").join("learning.json.tmp").exists());
}

#[tokio::test]
async fn tampered_state_is_clamped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("learning.json");
    let body = serde_json::json!({
        "learning_state": { "total_cycles": 9 },
        "strategy_config": {
            "rsi_oversold": 99.0,
            "max_positions": 1,
            "stop_loss_atr_mult": 7.5,
            "daily_loss_limit": 1.0,
            "position_size_pct": 0.9
        }
    });
    std::fs::write(&path, serde_json::to_vec(&body).unwrap()).unwrap();

    let store = Arc::new(MemoryTradeStore::default());
    let ctl = AdaptiveController::new(store, settings(path), StrategyConfig::default()).await;
    let cfg = ctl.config();
    assert_eq!(cfg.rsi_oversold, 40.0);
    assert_eq!(cfg.max_positions, 2);
    assert_eq!(cfg.stop_loss_atr_mult, 3.0);
    assert_eq!(cfg.daily_loss_limit, StrategyConfig::default().daily_loss_limit);
    assert_eq!(cfg.position_size_pct, StrategyConfig::default().position_size_pct);
    assert_eq!(ctl.state().total_cycles, 9);
}

#[tokio::test]
async fn corrupt_state_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("learning.json");
    std::fs::write(&path, b"{not json").unwrap();

    let store = Arc::new(MemoryTradeStore::default());
    let ctl = AdaptiveController::new(store, settings(path), StrategyConfig::default()).await;
    assert_eq!(ctl.config(), StrategyConfig::default());
    assert_eq!(ctl.state().total_cycles, 0);
}

#[tokio::test]
async fn loss_free_cycle_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("learning.json");

    let store = Arc::new(MemoryTradeStore::default());
    for i in 0..60 {
        let id = format!("w{i}");
        let t = Trade::open(id.clone(), "ETHUSDT", Side::Buy, 1.0, 100.0, "mr", Utc::now()).unwrap();
        store.log_trade(t).await.unwrap();
        store.close_trade(&id, 110.0, Utc::now(), ExitReason::TakeProfit).await.unwrap();
    }

    let ctl = AdaptiveController::new(store.clone(), settings(path.clone()), StrategyConfig::default()).await;
    assert_eq!(ctl.force_cycle().await, CycleOutcome::Completed { adjustments: 2 });
    assert_eq!(ctl.state().performance_trend[0].profit_factor, None);
    ctl.shutdown().await;

    let (state, tunables) = load_state(&path).await.unwrap().unwrap();
    assert_eq!(state.total_cycles, 1);
    assert_eq!(tunables.rsi_oversold, Some(28.0));

    let restored = AdaptiveController::new(store, settings(path), StrategyConfig::default()).await;
    assert_eq!(restored.config().rsi_oversold, 28.0);
    assert_eq!(restored.config().max_positions, 6);
    assert_eq!(restored.state().total_cycles, 1);
}

#[tokio::test]
async fn unreadable_history_keeps_tunables() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("learning.json");
    let body = serde_json::json!({
        "learning_state": { "total_cycles": "many", "performance_trend": [{ "win_rate": null }] },
        "strategy_config": { "rsi_oversold": 34.0, "cooldown_secs": 7 }
    });
    std::fs::write(&path, serde_json::to_vec(&body).unwrap()).unwrap();

    let (state, tunables) = load_state(&path).await.unwrap().unwrap();
    assert_eq!(state.total_cycles, 0);
    assert_eq!(tunables.rsi_oversold, Some(34.0));

    let store = Arc::new(MemoryTradeStore::default());
    let ctl = AdaptiveController::new(store, settings(path), StrategyConfig::default()).await;
    assert_eq!(ctl.config().rsi_oversold, 34.0);
    assert_eq!(ctl.config().cooldown_secs, 7);
    assert_eq!(ctl.state(), Default::default());
}
