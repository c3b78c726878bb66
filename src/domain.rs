// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::posttrade::SlippageRecord;
use crate::store::LearningEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side { Buy, Sell }
impl Side {
    pub fn sign(&self) -> i64 { match self { Side::Buy => 1, Side::Sell => -1 } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType { Market, Limit }
impl OrderType {
    pub fn as_str(&self) -> &'static str { match self { OrderType::Market => "market", OrderType::Limit => "limit" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce { Ioc, Gtc }

/// One trade print from a feed. Timestamps are unix millis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    pub source_ts_ms: i64,
    pub receive_ts_ms: i64,
    pub exchange: String,
}
impl Tick {
    pub fn network_latency_ms(&self) -> i64 { self.receive_ts_ms - self.source_ts_ms }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub ts_ms: i64,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub limit_price: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus { Open, Closed }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason { StopLoss, TakeProfit, Timeout, Signal, Manual }

#[derive(Debug, Error, PartialEq)]
pub enum TradeError {
    #[error("trade {0} already closed")]
    AlreadyClosed(String),
    #[error("invalid price {0}")]
    InvalidPrice(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub pnl: Option<f64>,
    pub pnl_pct: Option<f64>,
    pub exit_reason: Option<ExitReason>,
    pub strategy: String,
    pub status: TradeStatus,
}

impl Trade {
    pub fn open(
        order_id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        qty: f64,
        entry_price: f64,
        strategy: impl Into<String>,
        entry_time: DateTime<Utc>,
    ) -> Result<Self, TradeError> {
        if !(entry_price.is_finite() && entry_price > 0.0) {
            return Err(TradeError::InvalidPrice(entry_price));
        }
        Ok(Self {
            order_id: order_id.into(),
            symbol: symbol.into(),
            side,
            qty,
            entry_price,
            exit_price: None,
            entry_time,
            exit_time: None,
            pnl: None,
            pnl_pct: None,
            exit_reason: None,
            strategy: strategy.into(),
            status: TradeStatus::Open,
        })
    }

    /// Open -> Closed, sekali saja. P&L dihitung dalam Decimal lalu dibulatkan ke sen.
    pub fn close(
        &mut self,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        reason: ExitReason,
    ) -> Result<(), TradeError> {
        if self.status == TradeStatus::Closed {
            return Err(TradeError::AlreadyClosed(self.order_id.clone()));
        }
        if !(exit_price.is_finite() && exit_price > 0.0) {
            return Err(TradeError::InvalidPrice(exit_price));
        }

        let entry = to_decimal(self.entry_price);
        let exit = to_decimal(exit_price);
        let qty = to_decimal(self.qty);
        let pnl = match self.side {
            Side::Buy => (exit - entry) * qty,
            Side::Sell => (entry - exit) * qty,
        };
        let notional = entry * qty;
        let pnl_pct = if notional.is_zero() {
            Decimal::ZERO
        } else {
            pnl / notional * Decimal::ONE_HUNDRED
        };

        self.exit_price = Some(exit_price);
        self.exit_time = Some(exit_time);
        self.pnl = Some(cents(pnl));
        self.pnl_pct = Some(cents(pnl_pct));
        self.exit_reason = Some(reason);
        self.status = TradeStatus::Closed;
        Ok(())
    }

    pub fn is_closed(&self) -> bool { self.status == TradeStatus::Closed }
    pub fn pnl_or_zero(&self) -> f64 { self.pnl.unwrap_or(0.0) }
    pub fn is_winner(&self) -> bool { self.pnl_or_zero() > 0.0 }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquitySnapshot { pub timestamp: DateTime<Utc>, pub equity: f64 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Tick(Tick),
    Trade(Trade),
    Slippage(SlippageRecord),
    Learning(LearningEvent),
    Note(String),
}

pub fn now_ms() -> i64 { Utc::now().timestamp_millis() }

pub(crate) fn to_decimal(x: f64) -> Decimal {
    Decimal::from_f64(x).unwrap_or(Decimal::ZERO)
}

pub(crate) fn cents(d: Decimal) -> f64 {
    d.round_dp(2).to_f64().unwrap_or(0.0)
}
