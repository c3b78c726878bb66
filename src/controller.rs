// ===============================
// src/controller.rs
// ===============================
//
// Adaptive controller. Periodically reads closed trades, applies bounded
// heuristic adjustments to the live StrategyConfig and logs each change.
//
// - sole writer of StrategyConfig (owns the watch::Sender)
// - cycles are serialized; an overlapping request gets `CycleOutcome::Busy`
// - state is persisted after every completed cycle (temp file + rename);
//   on startup only the tunable fields are restored, clamped into bounds
//
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{ExitReason, Trade};
use crate::metrics::{ADJUSTMENTS, LEARNING_CYCLES};
use crate::performance::TradeStats;
use crate::store::{LearningEvent, TradeStore};
use crate::strategy_config::{StrategyConfig, TunableParams};

pub const MAX_TREND_POINTS: usize = 50;
pub const MAX_ADJUSTMENT_HISTORY: usize = 500;

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub interval: Duration,
    pub initial_delay: Duration,
    pub min_trades: usize,
    /// Closed trades considered per cycle; `None` = whole history.
    pub lookback_days: Option<u32>,
    pub state_path: Option<PathBuf>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            initial_delay: Duration::from_secs(30),
            min_trades: 20,
            lookback_days: Some(30),
            state_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub timestamp: DateTime<Utc>,
    pub metric: String,
    pub old_value: f64,
    pub new_value: f64,
    pub description: String,
    pub trigger_reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub timestamp: DateTime<Utc>,
    pub trades: usize,
    pub win_rate: f64,
    /// `None` when undefined (no losing trades).
    pub profit_factor: Option<f64>,
    pub total_pnl: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningState {
    pub total_cycles: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub adjustments: Vec<Adjustment>,
    pub performance_trend: Vec<TrendPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed { adjustments: usize },
    Skipped { closed_trades: usize },
    Busy,
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct PersistedRef<'a> {
    learning_state: &'a LearningState,
    strategy_config: &'a StrategyConfig,
}

#[derive(Deserialize)]
struct Persisted {
    /// Decoded separately so a bad history does not cost the tunables.
    #[serde(default)]
    learning_state: serde_json::Value,
    /// Only the tunable subset is read back; structural fields are ignored.
    #[serde(default)]
    strategy_config: TunableParams,
}

/// Atomic write: `<path>.tmp` then rename over `path`.
pub async fn persist_state(path: &Path, state: &LearningState, config: &StrategyConfig) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let body = serde_json::to_vec_pretty(&PersistedRef { learning_state: state, strategy_config: config })?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// `Ok(None)` when no state file exists yet.
pub async fn load_state(path: &Path) -> Result<Option<(LearningState, TunableParams)>, PersistError> {
    let raw = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let p: Persisted = serde_json::from_slice(&raw)?;
    let state = match p.learning_state {
        serde_json::Value::Null => LearningState::default(),
        v => serde_json::from_value(v).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "learning history unreadable, keeping tunables only");
            LearningState::default()
        }),
    };
    Ok(Some((state, p.strategy_config)))
}

/// Collects changes; a rule whose clamped value equals the old one emits nothing.
#[derive(Default)]
struct Changes(Vec<Adjustment>);

impl Changes {
    fn push(&mut self, metric: &str, old: f64, new: f64, description: String, reason: &str) -> bool {
        if (new - old).abs() <= 1e-12 {
            return false;
        }
        self.0.push(Adjustment {
            timestamp: Utc::now(),
            metric: metric.to_string(),
            old_value: old,
            new_value: new,
            description,
            trigger_reason: reason.to_string(),
        });
        true
    }
}

fn rate(trades: &[Trade], reason: ExitReason) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    let n = trades.iter().filter(|t| t.exit_reason == Some(reason)).count();
    n as f64 / trades.len() as f64 * 100.0
}

/// Realised loss (positive number) of trades that exited today, UTC.
fn todays_loss(trades: &[Trade], now: DateTime<Utc>) -> f64 {
    let today = now.date_naive();
    let pnl: f64 = trades
        .iter()
        .filter(|t| t.exit_time.map(|x| x.date_naive()) == Some(today))
        .map(Trade::pnl_or_zero)
        .sum();
    (-pnl).max(0.0)
}

/// Pure rule pass: returns the new config plus every emitted adjustment.
pub fn evaluate_rules(cfg: &StrategyConfig, trades: &[Trade], now: DateTime<Utc>) -> (StrategyConfig, Vec<Adjustment>) {
    let n = trades.len();
    let stats = TradeStats::from_trades(trades);
    let mut next = cfg.clone();
    let mut ch = Changes::default();

    let stop_rate = rate(trades, ExitReason::StopLoss);
    if n >= 20 && stop_rate > 60.0 {
        let reason = format!("stop-loss exit rate {stop_rate:.1}% over {n} trades");
        let new = (cfg.stop_loss_atr_mult * 1.075).min(3.0);
        if ch.push("stop_loss_atr_mult", cfg.stop_loss_atr_mult, new, "Widened stop-loss ATR multiplier".into(), &reason) {
            next.stop_loss_atr_mult = new;
        }
    }

    let timeout_rate = rate(trades, ExitReason::Timeout);
    if n >= 20 && timeout_rate > 40.0 {
        let reason = format!("timeout exit rate {timeout_rate:.1}% over {n} trades");
        let new = (cfg.min_confluence + 1).min(3);
        if ch.push("min_confluence", cfg.min_confluence as f64, new as f64, "Require more confluence signals".into(), &reason) {
            next.min_confluence = new;
        }
    }

    let wr = stats.win_rate;
    if n >= 50 && wr > 60.0 {
        let reason = format!("win rate {wr:.1}% over {n} trades");
        let new = (cfg.rsi_oversold - 2.0).max(25.0);
        if ch.push("rsi_oversold", cfg.rsi_oversold, new, "Loosened entry threshold".into(), &reason) {
            next.rsi_oversold = new;
        }
        let new = (cfg.max_positions + 1).min(8);
        if ch.push("max_positions", cfg.max_positions as f64, new as f64, "Allow one more concurrent position".into(), &reason) {
            next.max_positions = new;
        }
    } else if n >= 30 && wr < 40.0 {
        let reason = format!("win rate {wr:.1}% over {n} trades");
        let new = (cfg.rsi_oversold + 2.0).min(40.0);
        if ch.push("rsi_oversold", cfg.rsi_oversold, new, "Tightened entry threshold".into(), &reason) {
            next.rsi_oversold = new;
        }
        let new = cfg.max_positions.saturating_sub(1).max(2);
        if ch.push("max_positions", cfg.max_positions as f64, new as f64, "Reduced concurrent positions".into(), &reason) {
            next.max_positions = new;
        }
        let new = (cfg.cooldown_secs + 1).min(10);
        if ch.push("cooldown_secs", cfg.cooldown_secs as f64, new as f64, "Longer cooldown between trades".into(), &reason) {
            next.cooldown_secs = new;
        }
    }

    let ratio = stats.win_loss_ratio();
    if n >= 30 && stats.avg_loss > 0.0 && ratio < 1.0 {
        let reason = format!("avg win / avg loss {ratio:.2} over {n} trades");
        let new = (cfg.min_profit_target * 1.1).min(0.15);
        if ch.push("min_profit_target", cfg.min_profit_target, new, "Raised minimum profit target".into(), &reason) {
            next.min_profit_target = new;
        }
    }

    let loss = todays_loss(trades, now);
    if n >= 20 && cfg.daily_loss_limit > 0.0 && loss >= 0.8 * cfg.daily_loss_limit {
        let reason = format!("today's loss ${loss:.2} within 80% of ${:.2} limit", cfg.daily_loss_limit);
        let new = cfg.max_daily_trades.saturating_sub(25).max(50);
        if ch.push("max_daily_trades", cfg.max_daily_trades as f64, new as f64, "Reduced daily trade cap".into(), &reason) {
            next.max_daily_trades = new;
        }
    }

    (next, ch.0)
}

pub struct AdaptiveController {
    store: Arc<dyn TradeStore>,
    settings: ControllerSettings,
    config_tx: watch::Sender<StrategyConfig>,
    state: Mutex<LearningState>,
    cycle_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AdaptiveController {
    /// Restores persisted tunables (clamped) over `base`. A missing or
    /// unreadable state file falls back to `base` with a log line.
    pub async fn new(store: Arc<dyn TradeStore>, settings: ControllerSettings, base: StrategyConfig) -> Self {
        let mut config = base;
        let mut state = LearningState::default();

        if let Some(path) = &settings.state_path {
            match load_state(path).await {
                Ok(Some((restored, tunables))) => {
                    config.apply_tunables(&tunables);
                    info!(path = %path.display(), cycles = restored.total_cycles, "learning state restored");
                    state = restored;
                    state.performance_trend = trim_front(state.performance_trend, MAX_TREND_POINTS);
                    state.adjustments = trim_front(state.adjustments, MAX_ADJUSTMENT_HISTORY);
                }
                Ok(None) => info!(path = %path.display(), "no learning state yet, using defaults"),
                Err(e) => warn!(path = %path.display(), error = %e, "learning state unreadable, using defaults"),
            }
        }
        config.publish();

        let (config_tx, _) = watch::channel(config);
        Self {
            store,
            settings,
            config_tx,
            state: Mutex::new(state),
            cycle_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> StrategyConfig { self.config_tx.borrow().clone() }

    /// Read-only view for the strategy engine.
    pub fn subscribe(&self) -> watch::Receiver<StrategyConfig> { self.config_tx.subscribe() }

    pub fn state(&self) -> LearningState { self.state.lock().clone() }

    pub async fn force_cycle(&self) -> CycleOutcome { self.run_cycle("manual").await }

    async fn run_cycle(&self, trigger: &str) -> CycleOutcome {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            LEARNING_CYCLES.with_label_values(&["busy"]).inc();
            warn!(trigger, "learning cycle already running, request rejected");
            return CycleOutcome::Busy;
        };

        let trades = match self.store.closed_trades(self.settings.lookback_days).await {
            Ok(t) => t,
            Err(e) => {
                error!(trigger, error = %e, "learning cycle: trade history unavailable");
                LEARNING_CYCLES.with_label_values(&["skipped"]).inc();
                return CycleOutcome::Skipped { closed_trades: 0 };
            }
        };
        if trades.len() < self.settings.min_trades {
            LEARNING_CYCLES.with_label_values(&["skipped"]).inc();
            info!(trigger, closed_trades = trades.len(), min = self.settings.min_trades, "learning cycle skipped, not enough trades");
            return CycleOutcome::Skipped { closed_trades: trades.len() };
        }

        let now = Utc::now();
        let current = self.config();
        let (next, adjustments) = evaluate_rules(&current, &trades, now);
        if next != current {
            next.publish();
            self.config_tx.send_replace(next);
        }

        for a in &adjustments {
            ADJUSTMENTS.with_label_values(&[a.metric.as_str()]).inc();
            info!(metric = %a.metric, old = a.old_value, new = a.new_value, reason = %a.trigger_reason, "{}", a.description);
            let ev = LearningEvent::new("parameter_adjustment", a.description.clone())
                .with_change(a.metric.clone(), a.old_value, a.new_value)
                .with_reason(a.trigger_reason.clone());
            if let Err(e) = self.store.log_learning_event(ev).await {
                warn!(metric = %a.metric, error = %e, "learning event not logged");
            }
        }

        let stats = TradeStats::from_trades(&trades);
        let snapshot = {
            let mut st = self.state.lock();
            st.total_cycles += 1;
            st.last_cycle_at = Some(now);
            st.adjustments.extend(adjustments.iter().cloned());
            let excess = st.adjustments.len().saturating_sub(MAX_ADJUSTMENT_HISTORY);
            st.adjustments.drain(..excess);
            st.performance_trend.push(TrendPoint {
                timestamp: now,
                trades: stats.total_trades,
                win_rate: stats.win_rate,
                profit_factor: Some(stats.profit_factor).filter(|pf| pf.is_finite()),
                total_pnl: stats.total_pnl,
            });
            let excess = st.performance_trend.len().saturating_sub(MAX_TREND_POINTS);
            st.performance_trend.drain(..excess);
            st.clone()
        };

        if let Some(path) = &self.settings.state_path {
            if let Err(e) = persist_state(path, &snapshot, &self.config()).await {
                error!(path = %path.display(), error = %e, "learning state not persisted, continuing in memory");
            }
        }

        LEARNING_CYCLES.with_label_values(&["completed"]).inc();
        info!(
            trigger,
            cycle = snapshot.total_cycles,
            trades = stats.total_trades,
            win_rate = stats.win_rate,
            adjustments = adjustments.len(),
            "learning cycle completed"
        );
        CycleOutcome::Completed { adjustments: adjustments.len() }
    }

    /// Timer loop: once after `initial_delay`, then every `interval`.
    pub fn spawn(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() || self.shutdown.is_cancelled() {
            debug!("controller timer already started");
            return;
        }
        let me = self.clone();
        *task = Some(tokio::spawn(async move {
            let token = me.shutdown.clone();
            tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep(me.settings.initial_delay) => {}
            }
            me.run_cycle("startup").await;

            let mut tick = interval_at(Instant::now() + me.settings.interval, me.settings.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => { me.run_cycle("timer").await; }
                }
            }
        }));
    }

    /// Idempotent; waits for an in-flight cycle to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.task.lock().take();
        if let Some(h) = handle {
            let _ = h.await;
            info!("controller stopped");
        }
    }
}

fn trim_front<T>(mut v: Vec<T>, max: usize) -> Vec<T> {
    let excess = v.len().saturating_sub(max);
    v.drain(..excess);
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use crate::store::MemoryTradeStore;

    async fn seed(store: &MemoryTradeStore, batches: &[(usize, f64, ExitReason)]) {
        let mut i = 0;
        for &(count, exit, reason) in batches {
            for _ in 0..count {
                let id = format!("t{i}");
                let t = Trade::open(id.clone(), "AAPL", Side::Buy, 1.0, 100.0, "mr", Utc::now()).unwrap();
                store.log_trade(t).await.unwrap();
                store.close_trade(&id, exit, Utc::now(), reason).await.unwrap();
                i += 1;
            }
        }
    }

    async fn controller(store: Arc<MemoryTradeStore>, cfg: StrategyConfig) -> AdaptiveController {
        AdaptiveController::new(store, ControllerSettings::default(), cfg).await
    }

    #[tokio::test]
    async fn strong_win_rate_loosens_entry() {
        let store = Arc::new(MemoryTradeStore::default());
        // 39/60 = 65% wins, +20 vs -10
        seed(&store, &[(39, 120.0, ExitReason::TakeProfit), (21, 90.0, ExitReason::StopLoss)]).await;
        let ctl = controller(store.clone(), StrategyConfig::default()).await;
        let rx = ctl.subscribe();

        assert_eq!(ctl.force_cycle().await, CycleOutcome::Completed { adjustments: 2 });
        let cfg = ctl.config();
        assert_eq!(cfg.rsi_oversold, 28.0);
        assert_eq!(cfg.max_positions, 6);
        assert_eq!(*rx.borrow(), cfg);

        let st = ctl.state();
        assert_eq!(st.total_cycles, 1);
        assert_eq!(st.performance_trend.len(), 1);
        let metrics: Vec<&str> = st.adjustments.iter().map(|a| a.metric.as_str()).collect();
        assert_eq!(metrics, vec!["rsi_oversold", "max_positions"]);

        let events = store.learning_events(2).await.unwrap();
        assert!(events.iter().all(|e| e.event_type == "parameter_adjustment"));
    }

    #[tokio::test]
    async fn bounds_suppress_no_op_adjustments() {
        let store = Arc::new(MemoryTradeStore::default());
        seed(&store, &[(39, 120.0, ExitReason::TakeProfit), (21, 90.0, ExitReason::Signal)]).await;
        let cfg = StrategyConfig { rsi_oversold: 25.0, max_positions: 8, ..Default::default() };
        let ctl = controller(store, cfg.clone()).await;
        assert_eq!(ctl.force_cycle().await, CycleOutcome::Completed { adjustments: 0 });
        assert_eq!(ctl.config(), cfg);
        assert!(ctl.state().adjustments.is_empty());
    }

    #[tokio::test]
    async fn losing_regime_tightens_everything() {
        let store = Arc::new(MemoryTradeStore::default());
        // 12 wins of +5, 28 stop-outs of -10: pnl -220 today
        seed(&store, &[(12, 105.0, ExitReason::TakeProfit), (28, 90.0, ExitReason::StopLoss)]).await;
        let cfg = StrategyConfig { daily_loss_limit: 250.0, ..Default::default() };
        let ctl = controller(store, cfg).await;

        assert_eq!(ctl.force_cycle().await, CycleOutcome::Completed { adjustments: 7 });
        let c = ctl.config();
        assert!((c.stop_loss_atr_mult - 2.15).abs() < 1e-9);
        assert_eq!(c.rsi_oversold, 32.0);
        assert_eq!(c.max_positions, 4);
        assert_eq!(c.cooldown_secs, 6);
        assert!((c.min_profit_target - 0.022).abs() < 1e-12);
        assert_eq!(c.max_daily_trades, 175);
        assert_eq!(c.min_confluence, 2);
        assert_eq!(c.daily_loss_limit, 250.0);
    }

    #[tokio::test]
    async fn timeout_heavy_history_raises_confluence() {
        let store = Arc::new(MemoryTradeStore::default());
        seed(&store, &[(8, 101.0, ExitReason::Timeout), (12, 101.0, ExitReason::Signal)]).await;
        let trades = store.closed_trades(None).await.unwrap();
        let (_, adj) = evaluate_rules(&StrategyConfig::default(), &trades, Utc::now());
        assert!(adj.is_empty(), "exactly 40% must not trigger: {adj:?}");

        let mut more = trades.clone();
        more.push(Trade { exit_reason: Some(ExitReason::Timeout), order_id: "extra".into(), ..trades[0].clone() });
        let (next, adj) = evaluate_rules(&StrategyConfig::default(), &more, Utc::now());
        assert_eq!(adj.len(), 1);
        assert_eq!(next.min_confluence, 3);
    }

    #[tokio::test]
    async fn too_few_trades_skips() {
        let store = Arc::new(MemoryTradeStore::default());
        seed(&store, &[(10, 120.0, ExitReason::TakeProfit)]).await;
        let ctl = controller(store, StrategyConfig::default()).await;
        assert_eq!(ctl.force_cycle().await, CycleOutcome::Skipped { closed_trades: 10 });
        assert_eq!(ctl.state().total_cycles, 0);
    }

    #[tokio::test]
    async fn overlapping_cycle_is_rejected() {
        let store = Arc::new(MemoryTradeStore::default());
        let ctl = controller(store, StrategyConfig::default()).await;
        let _held = ctl.cycle_lock.try_lock().unwrap();
        assert_eq!(ctl.force_cycle().await, CycleOutcome::Busy);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_runs_after_delay_then_every_interval() {
        let store = Arc::new(MemoryTradeStore::default());
        seed(&store, &[(25, 101.0, ExitReason::Signal)]).await;
        let ctl = Arc::new(controller(store, StrategyConfig::default()).await);
        ctl.spawn();
        ctl.spawn();

        sleep(Duration::from_secs(29)).await;
        assert_eq!(ctl.state().total_cycles, 0);
        sleep(Duration::from_secs(2)).await;
        assert_eq!(ctl.state().total_cycles, 1);
        sleep(Duration::from_secs(300)).await;
        assert_eq!(ctl.state().total_cycles, 2);

        ctl.shutdown().await;
        ctl.shutdown().await;
        sleep(Duration::from_secs(600)).await;
        assert_eq!(ctl.state().total_cycles, 2);
    }

    #[test]
    fn trend_is_bounded() {
        let v: Vec<u32> = (0..60).collect();
        let t = trim_front(v, MAX_TREND_POINTS);
        assert_eq!(t.len(), 50);
        assert_eq!(t[0], 10);
    }
}
