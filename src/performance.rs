// ===============================
// src/performance.rs
// ===============================
//
// Risk-adjusted performance statistics and the paper -> live promotion
// verdict. Everything here is a pure function of a trade log and an equity
// curve; `PerformanceEvaluator::evaluate` is the only piece that touches the
// store.
//
// Division by zero never yields NaN: ratios fall back to 0 or +inf as
// documented per function.
//

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::{EquitySnapshot, Trade};
use crate::store::{StoreError, TradeStore};

pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;
pub const RISK_FREE_ANNUAL: f64 = 0.05;
pub const DEFAULT_STARTING_EQUITY: f64 = 100_000.0;
const ZERO_EPS: f64 = 1e-12;

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

fn population_std(xs: &[f64]) -> f64 {
    let m = mean(xs);
    (xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64).sqrt()
}

fn excess_returns(returns: &[f64]) -> Vec<f64> {
    let rf = RISK_FREE_ANNUAL / TRADING_DAYS_PER_YEAR;
    returns.iter().map(|r| r - rf).collect()
}

fn ratio_or_limit(mean: f64, denom: f64) -> f64 {
    if denom < ZERO_EPS {
        return if mean > 0.0 { f64::INFINITY } else { 0.0 };
    }
    mean / denom * TRADING_DAYS_PER_YEAR.sqrt()
}

/// Annualized Sharpe over per-period returns.
///
/// 0 with fewer than two samples. Zero volatility gives +inf for a positive
/// mean excess return and 0 otherwise.
pub fn calculate_sharpe(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let excess = excess_returns(returns);
    ratio_or_limit(mean(&excess), population_std(&excess))
}

/// Annualized Sortino. Downside deviation is the root of the summed squared
/// negative excess returns divided by the *total* sample count.
pub fn calculate_sortino(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let excess = excess_returns(returns);
    let downside_sq: f64 = excess.iter().filter(|&&r| r < 0.0).map(|r| r * r).sum();
    let downside_dev = (downside_sq / excess.len() as f64).sqrt();
    ratio_or_limit(mean(&excess), downside_dev)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Drawdown {
    /// Percent, 0..=100.
    pub max_drawdown_pct: f64,
    pub peak_index: usize,
    pub trough_index: usize,
    pub peak_value: f64,
    pub trough_value: f64,
}

/// Single forward pass against the running peak. Keeps the worst window,
/// not the latest one.
pub fn calculate_max_drawdown(curve: &[f64]) -> Drawdown {
    let Some(&first) = curve.first() else { return Drawdown::default() };
    let mut worst = Drawdown { peak_value: first, trough_value: first, ..Drawdown::default() };
    let mut peak = first;
    let mut peak_index = 0;

    for (i, &v) in curve.iter().enumerate() {
        if v > peak {
            peak = v;
            peak_index = i;
        }
        if peak <= 0.0 {
            continue;
        }
        let dd = (peak - v) / peak * 100.0;
        if dd > worst.max_drawdown_pct {
            worst = Drawdown {
                max_drawdown_pct: dd,
                peak_index,
                trough_index: i,
                peak_value: peak,
                trough_value: v,
            };
        }
    }
    worst
}

/// Simple returns between consecutive points; non-positive bases are skipped.
pub fn returns_from_equity(curve: &[f64]) -> Vec<f64> {
    curve
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

/// Last equity of each UTC day, led by the curve's opening value when the
/// first day has more than one point. Period returns for the annualized ratios.
pub fn daily_closes(curve: &[EquitySnapshot]) -> Vec<f64> {
    let mut points: Vec<&EquitySnapshot> = curve.iter().collect();
    points.sort_by_key(|s| s.timestamp);

    let mut closes = Vec::new();
    for (i, s) in points.iter().enumerate() {
        let next_day = points.get(i + 1).map(|n| n.timestamp.date_naive());
        if next_day != Some(s.timestamp.date_naive()) {
            closes.push(s.equity);
        }
    }
    if let [first, second, ..] = points.as_slice() {
        if first.timestamp.date_naive() == second.timestamp.date_naive() {
            closes.insert(0, first.equity);
        }
    }
    closes
}

/// Equity curve rebuilt from closed trades in exit order, starting at
/// `starting_equity`.
pub fn synthesize_equity(trades: &[Trade], starting_equity: f64) -> Vec<EquitySnapshot> {
    let mut closed: Vec<&Trade> = trades.iter().filter(|t| t.is_closed()).collect();
    closed.sort_by_key(|t| t.exit_time.unwrap_or(t.entry_time));

    let mut out = Vec::with_capacity(closed.len() + 1);
    let start_ts = closed.first().map(|t| t.entry_time).unwrap_or_else(Utc::now);
    out.push(EquitySnapshot { timestamp: start_ts, equity: starting_equity });
    let mut equity = starting_equity;
    for t in closed {
        equity += t.pnl_or_zero();
        out.push(EquitySnapshot { timestamp: t.exit_time.unwrap_or(t.entry_time), equity });
    }
    out
}

/// Trade-level aggregates shared by the report and the adaptive controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeStats {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Percent, 0..=100.
    pub win_rate: f64,
    pub total_pnl: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub profit_factor: f64,
    pub expectancy: f64,
    pub avg_win: f64,
    /// Magnitude (positive).
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
}

impl TradeStats {
    /// Closed trades only; open ones are ignored.
    pub fn from_trades(trades: &[Trade]) -> Self {
        let pnls: Vec<f64> = trades.iter().filter(|t| t.is_closed()).map(|t| t.pnl_or_zero()).collect();
        if pnls.is_empty() {
            return Self::default();
        }
        let total_trades = pnls.len();
        let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).collect();
        let gross_profit: f64 = wins.iter().sum();
        let gross_loss: f64 = losses.iter().map(|p| p.abs()).sum();
        let total_pnl: f64 = pnls.iter().sum();

        let profit_factor = if gross_loss < ZERO_EPS {
            if gross_profit > 0.0 { f64::INFINITY } else { 0.0 }
        } else {
            gross_profit / gross_loss
        };

        Self {
            total_trades,
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate: wins.len() as f64 / total_trades as f64 * 100.0,
            total_pnl,
            gross_profit,
            gross_loss,
            profit_factor,
            expectancy: total_pnl / total_trades as f64,
            avg_win: if wins.is_empty() { 0.0 } else { gross_profit / wins.len() as f64 },
            avg_loss: if losses.is_empty() { 0.0 } else { gross_loss / losses.len() as f64 },
            largest_win: wins.iter().copied().fold(0.0, f64::max),
            largest_loss: losses.iter().copied().fold(0.0, f64::min),
        }
    }

    /// avg win / avg loss; +inf without losses (0 without wins either).
    pub fn win_loss_ratio(&self) -> f64 {
        if self.avg_loss < ZERO_EPS {
            return if self.avg_win > 0.0 { f64::INFINITY } else { 0.0 };
        }
        self.avg_win / self.avg_loss
    }
}

/// Per-strategy leaderboard row. Sharpe here is the simple, non-annualized
/// mean/std of per-trade pnl_pct; drawdown is on cumulative dollar P&L.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyStats {
    pub strategy: String,
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
    pub sharpe: f64,
    pub max_drawdown: f64,
}

impl StrategyStats {
    pub fn from_trades(strategy: &str, trades: &[&Trade]) -> Self {
        let closed: Vec<&&Trade> = trades.iter().filter(|t| t.is_closed()).collect();
        let pnls: Vec<f64> = closed.iter().map(|t| t.pnl_or_zero()).collect();
        let pcts: Vec<f64> = closed.iter().map(|t| t.pnl_pct.unwrap_or(0.0)).collect();
        let wins = pnls.iter().filter(|p| **p > 0.0).count();
        let total_pnl: f64 = pnls.iter().sum();

        let sharpe = if pcts.len() > 1 {
            let sd = population_std(&pcts);
            if sd > ZERO_EPS { mean(&pcts) / sd } else { 0.0 }
        } else {
            0.0
        };

        let mut cumulative = 0.0;
        let mut peak = 0.0_f64;
        let mut max_dd = 0.0_f64;
        for p in &pnls {
            cumulative += p;
            peak = peak.max(cumulative);
            max_dd = max_dd.max(peak - cumulative);
        }

        Self {
            strategy: strategy.to_string(),
            trades: pnls.len(),
            wins,
            losses: pnls.len() - wins,
            win_rate: if pnls.is_empty() { 0.0 } else { wins as f64 / pnls.len() as f64 * 100.0 },
            total_pnl,
            avg_pnl: mean(&pnls),
            sharpe,
            max_drawdown: max_dd,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub min_days: f64,
    pub min_trades: usize,
    pub min_sharpe: f64,
    pub max_drawdown_pct: f64,
    pub min_win_rate: f64,
    pub min_profit_factor: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_days: 30.0,
            min_trades: 50,
            min_sharpe: 0.5,
            max_drawdown_pct: 15.0,
            min_win_rate: 45.0,
            min_profit_factor: 1.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation { GoLive, Caution, DoNotGoLive }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub ready: bool,
    pub recommendation: Recommendation,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub trades: TradeStats,
    pub sharpe: f64,
    pub sortino: f64,
    pub drawdown: Drawdown,
    pub trading_days: f64,
    pub equity_points: usize,
    pub verdict: Verdict,
}

#[derive(Debug, Clone)]
pub struct PerformanceEvaluator {
    pub thresholds: Thresholds,
    pub starting_equity: f64,
}

impl Default for PerformanceEvaluator {
    fn default() -> Self {
        Self { thresholds: Thresholds::default(), starting_equity: DEFAULT_STARTING_EQUITY }
    }
}

impl PerformanceEvaluator {
    pub fn new(thresholds: Thresholds, starting_equity: f64) -> Self {
        Self { thresholds, starting_equity }
    }

    /// Uses the supplied equity curve when it has at least two points,
    /// otherwise rebuilds one from the trades. Drawdown reads every point;
    /// Sharpe and Sortino read daily closes.
    pub fn calculate_report(&self, trades: &[Trade], equity_curve: &[EquitySnapshot]) -> PerformanceReport {
        let stats = TradeStats::from_trades(trades);

        let mut snapshots = if equity_curve.len() >= 2 {
            equity_curve.to_vec()
        } else {
            debug!("equity curve too short, synthesizing from trade log");
            synthesize_equity(trades, self.starting_equity)
        };
        snapshots.sort_by_key(|s| s.timestamp);
        let curve: Vec<f64> = snapshots.iter().map(|s| s.equity).collect();
        let returns = returns_from_equity(&daily_closes(&snapshots));
        let sharpe = calculate_sharpe(&returns);
        let sortino = calculate_sortino(&returns);
        let drawdown = calculate_max_drawdown(&curve);
        let trading_days = trading_period_days(trades);

        let verdict = self.verdict(&stats, sharpe, &drawdown, trading_days);
        PerformanceReport {
            generated_at: Utc::now(),
            trades: stats,
            sharpe,
            sortino,
            drawdown,
            trading_days,
            equity_points: curve.len(),
            verdict,
        }
    }

    fn verdict(&self, stats: &TradeStats, sharpe: f64, dd: &Drawdown, days: f64) -> Verdict {
        let th = &self.thresholds;
        let mut issues = Vec::new();
        if days < th.min_days {
            issues.push(format!("Trading period {days:.1} days is below the {:.0} day minimum", th.min_days));
        }
        if stats.total_trades < th.min_trades {
            issues.push(format!("Only {} closed trades, need at least {}", stats.total_trades, th.min_trades));
        }
        if sharpe < th.min_sharpe {
            issues.push(format!("Sharpe ratio {sharpe:.2} is below {:.2}", th.min_sharpe));
        }
        if dd.max_drawdown_pct > th.max_drawdown_pct {
            issues.push(format!(
                "Max drawdown {:.2}% exceeds {:.1}%",
                dd.max_drawdown_pct, th.max_drawdown_pct
            ));
        }
        if stats.win_rate < th.min_win_rate {
            issues.push(format!("Win rate {:.1}% is below {:.1}%", stats.win_rate, th.min_win_rate));
        }
        if stats.profit_factor < th.min_profit_factor {
            issues.push(format!("Profit factor {:.2} is below {:.2}", stats.profit_factor, th.min_profit_factor));
        }
        if stats.total_pnl <= 0.0 {
            issues.push(format!("Net P&L {:.2} is not positive", stats.total_pnl));
        }

        let ready = issues.is_empty();
        let recommendation = if ready {
            Recommendation::GoLive
        } else if issues.len() <= 2 && stats.total_pnl > 0.0 {
            Recommendation::Caution
        } else {
            Recommendation::DoNotGoLive
        };
        Verdict { ready, recommendation, issues }
    }

    /// Report over the store's closed trades (optionally the last `days`).
    pub async fn evaluate(&self, store: &dyn TradeStore, days: Option<u32>) -> Result<PerformanceReport, StoreError> {
        let trades = store.closed_trades(days).await?;
        let curve = store.equity_curve(days).await?;
        let report = self.calculate_report(&trades, &curve);
        info!(
            trades = report.trades.total_trades,
            win_rate = report.trades.win_rate,
            sharpe = report.sharpe,
            max_dd = report.drawdown.max_drawdown_pct,
            recommendation = ?report.verdict.recommendation,
            "performance report"
        );
        Ok(report)
    }
}

/// Days from the first entry to the last exit among closed trades.
pub fn trading_period_days(trades: &[Trade]) -> f64 {
    let closed = trades.iter().filter(|t| t.is_closed());
    let first = closed.clone().map(|t| t.entry_time).min();
    let last = closed.map(|t| t.exit_time.unwrap_or(t.entry_time)).max();
    match (first, last) {
        (Some(a), Some(b)) if b > a => (b - a).num_seconds() as f64 / 86_400.0,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExitReason, Side};
    use chrono::Duration;

    fn closed_qty(i: i64, price_move: f64, qty: f64, start: DateTime<Utc>, spacing_hours: i64) -> Trade {
        let entry = start + Duration::hours(i * spacing_hours);
        let mut t = Trade::open(format!("o{i}"), "AAPL", Side::Buy, qty, 100.0, "mr", entry).unwrap();
        t.close(100.0 + price_move, entry + Duration::minutes(30), ExitReason::Signal).unwrap();
        t
    }

    fn closed(i: i64, price_move: f64, start: DateTime<Utc>, spacing_hours: i64) -> Trade {
        closed_qty(i, price_move, 10.0, start, spacing_hours)
    }

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-05T14:30:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn sharpe_degenerate_inputs() {
        assert_eq!(calculate_sharpe(&[]), 0.0);
        assert_eq!(calculate_sharpe(&[0.01]), 0.0);
        assert_eq!(calculate_sharpe(&[0.01, 0.01, 0.01]), f64::INFINITY);
        assert_eq!(calculate_sharpe(&[0.0, 0.0, 0.0]), 0.0);
        assert_eq!(calculate_sharpe(&[-0.01, -0.01]), 0.0);
    }

    #[test]
    fn sharpe_matches_formula() {
        let r = [0.01, -0.005, 0.02, 0.0];
        let rf = 0.05 / 252.0;
        let ex: Vec<f64> = r.iter().map(|x| x - rf).collect();
        let m = ex.iter().sum::<f64>() / 4.0;
        let sd = (ex.iter().map(|x| (x - m).powi(2)).sum::<f64>() / 4.0).sqrt();
        assert!((calculate_sharpe(&r) - m / sd * 252f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn sortino_divides_by_total_count() {
        let r = [0.02, -0.01, 0.03, -0.02];
        let rf = 0.05 / 252.0;
        let ex: Vec<f64> = r.iter().map(|x| x - rf).collect();
        let m = ex.iter().sum::<f64>() / 4.0;
        let down = (ex.iter().filter(|x| **x < 0.0).map(|x| x * x).sum::<f64>() / 4.0).sqrt();
        assert!((calculate_sortino(&r) - m / down * 252f64.sqrt()).abs() < 1e-9);
        assert_eq!(calculate_sortino(&[0.01, 0.02]), f64::INFINITY);
    }

    #[test]
    fn drawdown_keeps_worst_window() {
        let dd = calculate_max_drawdown(&[100.0, 120.0, 90.0, 130.0, 80.0]);
        assert!((dd.max_drawdown_pct - 50.0 / 130.0 * 100.0).abs() < 1e-9);
        assert_eq!((dd.peak_index, dd.trough_index), (3, 4));
        assert_eq!((dd.peak_value, dd.trough_value), (130.0, 80.0));

        let dd = calculate_max_drawdown(&[100.0, 50.0, 100.0, 90.0]);
        assert!((dd.max_drawdown_pct - 50.0).abs() < 1e-9);
        assert_eq!((dd.peak_index, dd.trough_index), (0, 1));
    }

    #[test]
    fn drawdown_monotonic_curve_is_zero() {
        let dd = calculate_max_drawdown(&[1.0, 2.0, 3.0]);
        assert_eq!(dd.max_drawdown_pct, 0.0);
        assert_eq!(calculate_max_drawdown(&[]), Drawdown::default());
    }

    #[test]
    fn trade_stats_profit_factor() {
        let s = start();
        let trades = vec![closed(0, 2.0, s, 1), closed(1, 1.0, s, 1), closed(2, -1.5, s, 1)];
        let st = TradeStats::from_trades(&trades);
        assert_eq!(st.total_trades, 3);
        assert_eq!(st.winning_trades, 2);
        assert!((st.profit_factor - 30.0 / 15.0).abs() < 1e-9);
        assert!((st.expectancy - 5.0).abs() < 1e-9);
        assert_eq!(st.largest_win, 20.0);
        assert_eq!(st.largest_loss, -15.0);
        assert!((st.win_loss_ratio() - 1.0).abs() < 1e-9);

        let only_wins = vec![closed(0, 1.0, s, 1)];
        assert_eq!(TradeStats::from_trades(&only_wins).profit_factor, f64::INFINITY);
    }

    #[test]
    fn short_history_is_not_ready() {
        let s = start();
        let trades: Vec<Trade> = (0..10).map(|i| closed(i, 1.0, s, 1)).collect();
        let report = PerformanceEvaluator::default().calculate_report(&trades, &[]);
        assert!(!report.verdict.ready);
        assert!(report.verdict.issues.iter().any(|i| i.contains("closed trades")));
        assert!(report.verdict.issues.iter().any(|i| i.contains("Trading period")));
        assert_ne!(report.verdict.recommendation, Recommendation::GoLive);
    }

    #[test]
    fn solid_history_goes_live() {
        let s = start();
        // 60 trades over ~60 days, 2 wins per loss, wins twice the size
        let trades: Vec<Trade> = (0..60)
            .map(|i| closed_qty(i, if i % 3 == 2 { -1.0 } else { 2.0 }, 1_000.0, s, 24))
            .collect();
        let report = PerformanceEvaluator::default().calculate_report(&trades, &[]);
        assert!(report.trading_days >= 30.0);
        assert!(report.drawdown.max_drawdown_pct < 15.0);
        assert!(report.sharpe > 0.5, "sharpe {}", report.sharpe);
        assert!(report.verdict.ready, "{:?}", report.verdict.issues);
        assert_eq!(report.verdict.recommendation, Recommendation::GoLive);
    }

    #[test]
    fn losing_history_is_rejected() {
        let s = start();
        let trades: Vec<Trade> = (0..60).map(|i| closed(i, -1.0, s, 24)).collect();
        let report = PerformanceEvaluator::default().calculate_report(&trades, &[]);
        assert_eq!(report.verdict.recommendation, Recommendation::DoNotGoLive);
        assert_eq!(report.trades.profit_factor, 0.0);
        assert!(!report.sharpe.is_nan());
    }

    #[test]
    fn strategy_stats_drawdown_on_cumulative_pnl() {
        let s = start();
        let trades = [closed(0, 1.0, s, 1), closed(1, -3.0, s, 1), closed(2, 1.0, s, 1)];
        let refs: Vec<&Trade> = trades.iter().collect();
        let st = StrategyStats::from_trades("mr", &refs);
        assert_eq!(st.trades, 3);
        assert_eq!(st.wins, 2);
        assert!((st.max_drawdown - 30.0).abs() < 1e-9);
    }

    #[test]
    fn daily_closes_keep_open_and_last_of_day() {
        let s = start();
        let at = |h: i64, e: f64| EquitySnapshot { timestamp: s + Duration::hours(h), equity: e };
        // 14:30 and 15:30 share day 0; 38:30 is day 1
        assert_eq!(daily_closes(&[at(1, 101.0), at(0, 100.0), at(24, 103.0)]), vec![100.0, 101.0, 103.0]);
        assert_eq!(daily_closes(&[at(0, 100.0), at(24, 102.0)]), vec![100.0, 102.0]);
        assert!(daily_closes(&[]).is_empty());
    }

    #[test]
    fn sharpe_ignores_sampling_density() {
        let day0 = DateTime::parse_from_rfc3339("2026-01-05T00:00:00Z").unwrap().with_timezone(&Utc);
        let mut closes = vec![100_000.0];
        for d in 1..60 {
            let prev: f64 = closes[d - 1];
            closes.push(prev + if d % 3 == 0 { -1_000.0 } else { 2_000.0 });
        }

        let eod = |d: usize| day0 + Duration::days(d as i64) + Duration::minutes(23 * 60 + 50);
        let daily: Vec<EquitySnapshot> =
            closes.iter().enumerate().map(|(d, &e)| EquitySnapshot { timestamp: eod(d), equity: e }).collect();

        // every 10 minutes, flat at the previous close until the day's last print
        let mut dense = vec![daily[0]];
        for d in 1..closes.len() {
            let midnight = day0 + Duration::days(d as i64);
            for m in 0..143 {
                dense.push(EquitySnapshot { timestamp: midnight + Duration::minutes(m * 10), equity: closes[d - 1] });
            }
            dense.push(daily[d]);
        }
        assert_eq!(dense.len(), 1 + 59 * 144);

        let eval = PerformanceEvaluator::default();
        let a = eval.calculate_report(&[], &daily);
        let b = eval.calculate_report(&[], &dense);
        assert!(a.sharpe > 0.5, "sharpe {}", a.sharpe);
        assert!((a.sharpe - b.sharpe).abs() < 1e-9, "{} vs {}", a.sharpe, b.sharpe);
        assert!((a.sortino - b.sortino).abs() < 1e-9);
        assert_eq!(a.drawdown.max_drawdown_pct, b.drawdown.max_drawdown_pct);
        assert_eq!(b.equity_points, dense.len());
    }
}
