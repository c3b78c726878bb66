// ===============================
// src/store.rs
// ===============================
//
// Logical trade-log contract. The SQL-backed store lives outside this crate;
// `MemoryTradeStore` is the in-process implementation used by the binary
// (journaled to JSONL through the recorder) and by tests.
//
use std::collections::BTreeMap;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use crate::domain::{Event, EquitySnapshot, ExitReason, Trade, TradeError};
use crate::performance::{StrategyStats, DEFAULT_STARTING_EQUITY};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("trade {0} not found")]
    NotFound(String),
    #[error("duplicate order id {0}")]
    Duplicate(String),
    #[error(transparent)]
    Trade(#[from] TradeError),
}

/// Append-only learning log entry (adjustments, trade closes, notes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub metric: Option<String>,
    pub old_value: Option<f64>,
    pub new_value: Option<f64>,
    pub description: String,
    pub trigger_reason: Option<String>,
}

impl LearningEvent {
    pub fn new(event_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.into(),
            metric: None,
            old_value: None,
            new_value: None,
            description: description.into(),
            trigger_reason: None,
        }
    }

    pub fn with_change(mut self, metric: impl Into<String>, old: f64, new: f64) -> Self {
        self.metric = Some(metric.into());
        self.old_value = Some(old);
        self.new_value = Some(new);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.trigger_reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub initial_balance: f64,
    pub current_balance: f64,
    pub total_pnl: f64,
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub avg_pnl: f64,
    pub open_positions_value: f64,
}

#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn log_trade(&self, trade: Trade) -> Result<(), StoreError>;
    /// Open -> closed exactly once; a second close is an error.
    async fn close_trade(
        &self,
        order_id: &str,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        reason: ExitReason,
    ) -> Result<Trade, StoreError>;
    /// Closed trades, optionally only those that exited in the last `days`.
    async fn closed_trades(&self, days: Option<u32>) -> Result<Vec<Trade>, StoreError>;
    async fn open_trades(&self) -> Result<Vec<Trade>, StoreError>;
    async fn log_equity(&self, snapshot: EquitySnapshot) -> Result<(), StoreError>;
    async fn equity_curve(&self, days: Option<u32>) -> Result<Vec<EquitySnapshot>, StoreError>;
    async fn stats_by_strategy(&self) -> Result<Vec<StrategyStats>, StoreError>;
    async fn log_learning_event(&self, event: LearningEvent) -> Result<(), StoreError>;
    /// Newest first.
    async fn learning_events(&self, limit: usize) -> Result<Vec<LearningEvent>, StoreError>;
    async fn portfolio_summary(&self) -> Result<PortfolioSummary, StoreError>;
}

/// Oldest snapshots are dropped past this; about 70 days at 5 min.
pub const MAX_EQUITY_POINTS: usize = 20_000;

#[derive(Default)]
struct Inner {
    trades: Vec<Trade>,
    by_id: HashMap<String, usize>,
    equity: Vec<EquitySnapshot>,
    events: Vec<LearningEvent>,
}

pub struct MemoryTradeStore {
    inner: Mutex<Inner>,
    initial_balance: f64,
    journal: Option<mpsc::Sender<Event>>,
}

impl Default for MemoryTradeStore {
    fn default() -> Self { Self::new(DEFAULT_STARTING_EQUITY) }
}

impl MemoryTradeStore {
    pub fn new(initial_balance: f64) -> Self {
        Self { inner: Mutex::new(Inner::default()), initial_balance, journal: None }
    }

    /// Mirror trades and learning events to the JSONL recorder.
    pub fn with_journal(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.journal = Some(tx);
        self
    }

    fn journal(&self, ev: Event) {
        if let Some(tx) = &self.journal {
            let _ = tx.try_send(ev);
        }
    }
}

fn cutoff(days: Option<u32>) -> Option<DateTime<Utc>> {
    days.map(|d| Utc::now() - Duration::days(d as i64))
}

#[async_trait]
impl TradeStore for MemoryTradeStore {
    async fn log_trade(&self, trade: Trade) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            if inner.by_id.contains_key(&trade.order_id) {
                return Err(StoreError::Duplicate(trade.order_id));
            }
            let idx = inner.trades.len();
            inner.by_id.insert(trade.order_id.clone(), idx);
            inner.trades.push(trade.clone());
        }
        self.journal(Event::Trade(trade));
        Ok(())
    }

    async fn close_trade(
        &self,
        order_id: &str,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        reason: ExitReason,
    ) -> Result<Trade, StoreError> {
        let closed = {
            let mut inner = self.inner.lock();
            let idx = *inner
                .by_id
                .get(order_id)
                .ok_or_else(|| StoreError::NotFound(order_id.to_string()))?;
            let trade = &mut inner.trades[idx];
            trade.close(exit_price, exit_time, reason)?;
            trade.clone()
        };

        let pnl = closed.pnl_or_zero();
        info!(order_id, symbol = %closed.symbol, pnl, pnl_pct = closed.pnl_pct.unwrap_or(0.0), "trade closed");
        let outcome = if pnl > 0.0 { "Win" } else { "Loss" };
        self.log_learning_event(
            LearningEvent::new("trade_closed", format!("{outcome}: {} P&L ${pnl:.2}", closed.symbol))
                .with_reason(closed.strategy.clone()),
        )
        .await?;
        self.journal(Event::Trade(closed.clone()));
        Ok(closed)
    }

    async fn closed_trades(&self, days: Option<u32>) -> Result<Vec<Trade>, StoreError> {
        let since = cutoff(days);
        let inner = self.inner.lock();
        Ok(inner
            .trades
            .iter()
            .filter(|t| t.is_closed())
            .filter(|t| match (since, t.exit_time) {
                (Some(s), Some(x)) => x >= s,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .cloned()
            .collect())
    }

    async fn open_trades(&self) -> Result<Vec<Trade>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.trades.iter().filter(|t| !t.is_closed()).cloned().collect())
    }

    async fn log_equity(&self, snapshot: EquitySnapshot) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.equity.push(snapshot);
        let excess = inner.equity.len().saturating_sub(MAX_EQUITY_POINTS);
        inner.equity.drain(..excess);
        Ok(())
    }

    async fn equity_curve(&self, days: Option<u32>) -> Result<Vec<EquitySnapshot>, StoreError> {
        let since = cutoff(days);
        let inner = self.inner.lock();
        Ok(inner
            .equity
            .iter()
            .filter(|s| since.map_or(true, |c| s.timestamp >= c))
            .copied()
            .collect())
    }

    async fn stats_by_strategy(&self) -> Result<Vec<StrategyStats>, StoreError> {
        let inner = self.inner.lock();
        let mut groups: BTreeMap<&str, Vec<&Trade>> = BTreeMap::new();
        for t in inner.trades.iter().filter(|t| t.is_closed()) {
            groups.entry(t.strategy.as_str()).or_default().push(t);
        }
        let mut out: Vec<StrategyStats> = groups
            .into_iter()
            .map(|(name, trades)| StrategyStats::from_trades(name, &trades))
            .collect();
        out.sort_by(|a, b| {
            b.win_rate
                .total_cmp(&a.win_rate)
                .then_with(|| b.sharpe.total_cmp(&a.sharpe))
        });
        Ok(out)
    }

    async fn log_learning_event(&self, event: LearningEvent) -> Result<(), StoreError> {
        self.inner.lock().events.push(event.clone());
        self.journal(Event::Learning(event));
        Ok(())
    }

    async fn learning_events(&self, limit: usize) -> Result<Vec<LearningEvent>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.events.iter().rev().take(limit).cloned().collect())
    }

    async fn portfolio_summary(&self) -> Result<PortfolioSummary, StoreError> {
        let inner = self.inner.lock();
        let closed: Vec<&Trade> = inner.trades.iter().filter(|t| t.is_closed()).collect();
        let total_pnl: f64 = closed.iter().map(|t| t.pnl_or_zero()).sum();
        let wins = closed.iter().filter(|t| t.is_winner()).count();
        let open_value: f64 = inner
            .trades
            .iter()
            .filter(|t| !t.is_closed())
            .map(|t| t.entry_price * t.qty)
            .sum();
        let n = closed.len();
        Ok(PortfolioSummary {
            initial_balance: self.initial_balance,
            current_balance: self.initial_balance + total_pnl,
            total_pnl,
            total_trades: n,
            wins,
            losses: n - wins,
            win_rate: if n == 0 { 0.0 } else { wins as f64 / n as f64 * 100.0 },
            avg_pnl: if n == 0 { 0.0 } else { total_pnl / n as f64 },
            open_positions_value: open_value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;

    fn open(id: &str, strategy: &str) -> Trade {
        Trade::open(id, "AAPL", Side::Buy, 10.0, 100.0, strategy, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn close_once_and_summarize() {
        let store = MemoryTradeStore::default();
        store.log_trade(open("a", "mr")).await.unwrap();
        store.log_trade(open("b", "mr")).await.unwrap();
        store.log_trade(open("c", "trend")).await.unwrap();

        let t = store.close_trade("a", 102.0, Utc::now(), ExitReason::TakeProfit).await.unwrap();
        assert_eq!(t.pnl, Some(20.0));
        store.close_trade("b", 99.0, Utc::now(), ExitReason::StopLoss).await.unwrap();

        let again = store.close_trade("a", 105.0, Utc::now(), ExitReason::Manual).await;
        assert!(matches!(again, Err(StoreError::Trade(TradeError::AlreadyClosed(_)))));
        assert!(matches!(
            store.close_trade("zzz", 1.0, Utc::now(), ExitReason::Manual).await,
            Err(StoreError::NotFound(_))
        ));

        assert_eq!(store.closed_trades(None).await.unwrap().len(), 2);
        assert_eq!(store.open_trades().await.unwrap().len(), 1);

        let summary = store.portfolio_summary().await.unwrap();
        assert_eq!(summary.total_pnl, 10.0);
        assert_eq!(summary.current_balance, DEFAULT_STARTING_EQUITY + 10.0);
        assert_eq!((summary.wins, summary.losses), (1, 1));
        assert_eq!(summary.open_positions_value, 1_000.0);

        let events = store.learning_events(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].description.starts_with("Loss"));
    }

    #[tokio::test]
    async fn rejects_duplicate_ids() {
        let store = MemoryTradeStore::default();
        store.log_trade(open("a", "mr")).await.unwrap();
        assert!(matches!(store.log_trade(open("a", "mr")).await, Err(StoreError::Duplicate(_))));
    }

    #[tokio::test]
    async fn day_window_filters_old_exits() {
        let store = MemoryTradeStore::default();
        let mut old = open("old", "mr");
        old.entry_time = Utc::now() - Duration::days(10);
        store.log_trade(old).await.unwrap();
        store
            .close_trade("old", 101.0, Utc::now() - Duration::days(9), ExitReason::Signal)
            .await
            .unwrap();
        store.log_trade(open("new", "mr")).await.unwrap();
        store.close_trade("new", 101.0, Utc::now(), ExitReason::Signal).await.unwrap();

        assert_eq!(store.closed_trades(Some(7)).await.unwrap().len(), 1);
        assert_eq!(store.closed_trades(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn strategy_leaderboard_orders_by_win_rate() {
        let store = MemoryTradeStore::default();
        for (id, strat, exit) in [("a", "mr", 101.0), ("b", "mr", 99.0), ("c", "trend", 101.0)] {
            store.log_trade(open(id, strat)).await.unwrap();
            store.close_trade(id, exit, Utc::now(), ExitReason::Signal).await.unwrap();
        }
        let stats = store.stats_by_strategy().await.unwrap();
        assert_eq!(stats[0].strategy, "trend");
        assert_eq!(stats[1].win_rate, 50.0);
    }

    #[tokio::test]
    async fn equity_curve_is_bounded() {
        let store = MemoryTradeStore::default();
        let t0 = Utc::now() - Duration::days(1);
        for i in 0..MAX_EQUITY_POINTS + 5 {
            let snap = EquitySnapshot { timestamp: t0 + Duration::seconds(i as i64), equity: i as f64 };
            store.log_equity(snap).await.unwrap();
        }
        let curve = store.equity_curve(None).await.unwrap();
        assert_eq!(curve.len(), MAX_EQUITY_POINTS);
        assert_eq!(curve[0].equity, 5.0);
    }
}
