// ===============================
// src/posttrade.rs
// ===============================
//
// Execution quality: expected vs filled price per fill.
// - slippage      = |filled - expected| / expected
// - slippage_bps  = slippage * 10_000
// - dollars       = |filled - expected| * qty (Decimal, rounded to cents)
// Records live in a ring buffer (oldest dropped first).
//
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::{cents, now_ms, to_decimal, Event, Side};
use crate::metrics::{ADVERSE_FILLS, HIGH_SLIPPAGE, SLIPPAGE_BPS};

pub const MAX_RECORDS: usize = 1000;
/// 50 bps.
pub const HIGH_SLIPPAGE_THRESHOLD: f64 = 0.005;
const RECENT: usize = 10;

/// Fill as reported by the caller. Both prices are required for a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub expected_price: Option<f64>,
    pub filled_price: Option<f64>,
    pub strategy: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlippageRecord {
    pub ts_ms: i64,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub expected_price: f64,
    pub filled_price: f64,
    pub slippage: f64,
    pub slippage_bps: f64,
    pub slippage_dollars: f64,
    pub is_adverse: bool,
    pub strategy: String,
}

impl Fill {
    /// `(expected, filled)` when both are present and usable.
    pub fn validate(&self) -> Option<(f64, f64)> {
        let expected = self.expected_price?;
        let filled = self.filled_price?;
        (expected.is_finite() && expected > 0.0 && filled.is_finite() && self.qty.is_finite())
            .then_some((expected, filled))
    }
}

impl SlippageRecord {
    /// `None` when a price is missing or the expected price is not positive.
    pub fn from_fill(fill: &Fill) -> Option<Self> {
        let (expected, filled) = fill.validate()?;
        let diff = (filled - expected).abs();
        let slippage = diff / expected;
        let dollars = (to_decimal(filled) - to_decimal(expected)).abs() * to_decimal(fill.qty);
        let is_adverse = match fill.side {
            Side::Buy => filled > expected,
            Side::Sell => filled < expected,
        };
        Some(Self {
            ts_ms: now_ms(),
            symbol: fill.symbol.clone(),
            side: fill.side,
            qty: fill.qty,
            expected_price: expected,
            filled_price: filled,
            slippage,
            slippage_bps: slippage * 10_000.0,
            slippage_dollars: cents(dollars),
            is_adverse,
            strategy: fill.strategy.clone(),
        })
    }

    pub fn is_high(&self) -> bool { self.slippage > HIGH_SLIPPAGE_THRESHOLD }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlippageStats {
    pub count: usize,
    pub avg_bps: f64,
    pub max_bps: f64,
    pub total_dollars: f64,
    pub adverse_count: usize,
    /// Percent of fills that were adverse.
    pub adverse_rate: f64,
    pub recent: Vec<SlippageRecord>,
}

impl SlippageStats {
    fn from_records<'a>(records: impl Iterator<Item = &'a SlippageRecord>) -> Self {
        let rs: Vec<&SlippageRecord> = records.collect();
        if rs.is_empty() {
            return Self::default();
        }
        let count = rs.len();
        let sum_bps: f64 = rs.iter().map(|r| r.slippage_bps).sum();
        let max_bps = rs.iter().map(|r| r.slippage_bps).fold(0.0, f64::max);
        let total = rs
            .iter()
            .map(|r| to_decimal(r.slippage_dollars))
            .fold(rust_decimal::Decimal::ZERO, |acc, d| acc + d);
        let adverse_count = rs.iter().filter(|r| r.is_adverse).count();
        let recent = rs.iter().rev().take(RECENT).rev().map(|r| (*r).clone()).collect();
        Self {
            count,
            avg_bps: sum_bps / count as f64,
            max_bps,
            total_dollars: cents(total),
            adverse_count,
            adverse_rate: adverse_count as f64 / count as f64 * 100.0,
            recent,
        }
    }
}

pub struct ExecutionQualityTracker {
    records: Mutex<VecDeque<SlippageRecord>>,
    capacity: usize,
}

impl Default for ExecutionQualityTracker {
    fn default() -> Self { Self::with_capacity(MAX_RECORDS) }
}

impl ExecutionQualityTracker {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { records: Mutex::new(VecDeque::with_capacity(capacity)), capacity }
    }

    /// No-op (returns `None`) unless both prices are present.
    pub fn record(&self, fill: &Fill) -> Option<SlippageRecord> {
        let Some(rec) = SlippageRecord::from_fill(fill) else {
            debug!(symbol = %fill.symbol, "fill without expected/filled price, skip");
            return None;
        };

        SLIPPAGE_BPS.observe(rec.slippage_bps);
        if rec.is_adverse {
            ADVERSE_FILLS.inc();
        }
        if rec.is_high() {
            HIGH_SLIPPAGE.inc();
            warn!(
                symbol = %rec.symbol,
                side = rec.side.as_str(),
                bps = rec.slippage_bps,
                dollars = rec.slippage_dollars,
                adverse = rec.is_adverse,
                strategy = %rec.strategy,
                "high slippage"
            );
        }

        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(rec.clone());
        Some(rec)
    }

    pub fn len(&self) -> usize { self.records.lock().len() }
    pub fn is_empty(&self) -> bool { self.records.lock().is_empty() }

    pub fn stats(&self) -> SlippageStats {
        let records = self.records.lock();
        SlippageStats::from_records(records.iter())
    }

    pub fn stats_by_symbol(&self) -> BTreeMap<String, SlippageStats> {
        self.grouped(|r| r.symbol.clone())
    }

    pub fn stats_by_strategy(&self) -> BTreeMap<String, SlippageStats> {
        self.grouped(|r| r.strategy.clone())
    }

    fn grouped(&self, key: impl Fn(&SlippageRecord) -> String) -> BTreeMap<String, SlippageStats> {
        let records = self.records.lock();
        let mut groups: BTreeMap<String, Vec<&SlippageRecord>> = BTreeMap::new();
        for r in records.iter() {
            groups.entry(key(r)).or_default().push(r);
        }
        groups
            .into_iter()
            .map(|(k, rs)| (k, SlippageStats::from_records(rs.into_iter())))
            .collect()
    }
}

/// Task: konsumsi Fill dari channel, catat, teruskan ke recorder.
pub async fn run(
    tracker: Arc<ExecutionQualityTracker>,
    mut fill_rx: mpsc::Receiver<Fill>,
    rec_tx: mpsc::Sender<Event>,
) {
    while let Some(fill) = fill_rx.recv().await {
        if let Some(rec) = tracker.record(&fill) {
            let _ = rec_tx.try_send(Event::Slippage(rec));
        }
    }
}
