// ===============================
// src/indicators.rs
// ===============================
//
// Pure technical indicators over series ordered oldest-first.
// No state, no I/O. Insufficient input degrades to a documented default
// instead of panicking or producing NaN.
//

use serde::{Deserialize, Serialize};

/// OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Mean of the last `period` values. With fewer values than `period` the last
/// value is returned as-is (not an average of what is there).
pub fn sma(values: &[f64], period: usize) -> f64 {
    let Some(&last) = values.last() else { return 0.0 };
    if period == 0 || values.len() < period {
        return last;
    }
    mean(&values[values.len() - period..])
}

/// Full EMA series, same length as the input.
///
/// Seeded with the SMA of the first `period` values; every index up to and
/// including the seed index carries the seed (flat backfill).
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    if n == 0 {
        return Vec::new();
    }
    let period = period.max(1);
    if n < period {
        return vec![values[n - 1]; n];
    }

    let seed = mean(&values[..period]);
    let k = 2.0 / (period as f64 + 1.0);
    let mut out = vec![seed; n];
    for i in period..n {
        out[i] = (values[i] - out[i - 1]) * k + out[i - 1];
    }
    out
}

/// Last EMA value, 0 for empty input.
pub fn ema_last(values: &[f64], period: usize) -> f64 {
    ema(values, period).last().copied().unwrap_or(0.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Macd {
    pub line: Vec<f64>,
    pub signal: Vec<f64>,
    pub histogram: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacdValue {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

impl Macd {
    pub fn latest(&self) -> MacdValue {
        MacdValue {
            macd: self.line.last().copied().unwrap_or(0.0),
            signal: self.signal.last().copied().unwrap_or(0.0),
            histogram: self.histogram.last().copied().unwrap_or(0.0),
        }
    }
}

/// MACD with the usual (12, 26, 9) or custom periods.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Macd {
    let fast_ema = ema(closes, fast);
    let slow_ema = ema(closes, slow);
    let line: Vec<f64> = fast_ema.iter().zip(&slow_ema).map(|(f, s)| f - s).collect();
    let signal_line = ema(&line, signal);
    let histogram = line.iter().zip(&signal_line).map(|(m, s)| m - s).collect();
    Macd { line, signal: signal_line, histogram }
}

pub fn macd_default(closes: &[f64]) -> Macd {
    macd(closes, 12, 26, 9)
}

/// Wilder RSI.
///
/// 50 with fewer than `period + 1` closes. The `avg_loss == 0` check runs
/// first, so a flat series long enough to seed yields 100.
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period + 1 {
        return 50.0;
    }
    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for &d in &deltas[..period] {
        if d > 0.0 {
            avg_gain += d;
        } else {
            avg_loss -= d;
        }
    }
    let p = period as f64;
    avg_gain /= p;
    avg_loss /= p;

    for &d in &deltas[period..] {
        let gain = if d > 0.0 { d } else { 0.0 };
        let loss = if d < 0.0 { -d } else { 0.0 };
        avg_gain = (avg_gain * (p - 1.0) + gain) / p;
        avg_loss = (avg_loss * (p - 1.0) + loss) / p;
    }

    if avg_loss == 0.0 {
        return 100.0;
    }
    if avg_gain == 0.0 {
        return 0.0;
    }
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// (price - lower) / (upper - lower); 0.5 on zero width.
    pub percent_b: f64,
    /// (upper - lower) / middle.
    pub bandwidth: f64,
}

/// Bollinger bands on population stddev of the last `period` closes.
pub fn bollinger(closes: &[f64], period: usize, k: f64) -> BollingerBands {
    let price = closes.last().copied().unwrap_or(0.0);
    if period == 0 || closes.len() < period {
        return BollingerBands { upper: price, middle: price, lower: price, percent_b: 0.5, bandwidth: 0.0 };
    }
    let window = &closes[closes.len() - period..];
    let middle = mean(window);
    let var = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let sd = var.sqrt();
    let upper = middle + k * sd;
    let lower = middle - k * sd;
    let width = upper - lower;
    let percent_b = if width == 0.0 { 0.5 } else { (price - lower) / width };
    let bandwidth = if middle == 0.0 { 0.0 } else { width / middle };
    BollingerBands { upper, middle, lower, percent_b, bandwidth }
}

/// Wilder ATR. True ranges start at the second bar (they need a previous
/// close); a single bar yields its high-low range.
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> f64 {
    let n = highs.len().min(lows.len()).min(closes.len());
    if n == 0 {
        return 0.0;
    }
    if n == 1 {
        return highs[0] - lows[0];
    }
    let trs: Vec<f64> = (1..n)
        .map(|i| {
            let prev = closes[i - 1];
            (highs[i] - lows[i])
                .max((highs[i] - prev).abs())
                .max((lows[i] - prev).abs())
        })
        .collect();

    let period = period.max(1);
    if trs.len() < period {
        return mean(&trs);
    }
    let p = period as f64;
    let mut value = mean(&trs[..period]);
    for &tr in &trs[period..] {
        value = (value * (p - 1.0) + tr) / p;
    }
    value
}

pub fn atr_bars(bars: &[Bar], period: usize) -> f64 {
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    atr(&highs, &lows, &closes, period)
}

/// Volume-weighted average price; last close when no volume traded.
pub fn vwap(closes: &[f64], volumes: &[f64]) -> f64 {
    let mut pv = 0.0;
    let mut vol = 0.0;
    for (c, v) in closes.iter().zip(volumes) {
        pv += c * v;
        vol += v;
    }
    if vol == 0.0 {
        return closes.last().copied().unwrap_or(0.0);
    }
    pv / vol
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PivotPoints {
    pub pivot: f64,
    pub r1: f64,
    pub r2: f64,
    pub r3: f64,
    pub s1: f64,
    pub s2: f64,
    pub s3: f64,
}

/// Classic floor-trader pivots.
pub fn pivot_points(high: f64, low: f64, close: f64) -> PivotPoints {
    let pivot = (high + low + close) / 3.0;
    let range = high - low;
    PivotPoints {
        pivot,
        r1: 2.0 * pivot - low,
        s1: 2.0 * pivot - high,
        r2: pivot + range,
        s2: pivot - range,
        r3: high + 2.0 * (pivot - low),
        s3: low - 2.0 * (high - pivot),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stochastic {
    pub k: f64,
    pub d: f64,
}

/// Stochastic oscillator: %K over `period` bars, %D = SMA(%K, smooth).
/// A flat range reads as 50.
pub fn stochastic(bars: &[Bar], period: usize, smooth: usize) -> Stochastic {
    let period = period.max(1);
    if bars.is_empty() {
        return Stochastic { k: 50.0, d: 50.0 };
    }
    let k_at = |end: usize| -> f64 {
        let start = (end + 1).saturating_sub(period);
        let window = &bars[start..=end];
        let hh = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let ll = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        if hh == ll {
            50.0
        } else {
            (bars[end].close - ll) / (hh - ll) * 100.0
        }
    };
    let last = bars.len() - 1;
    let first = (last + 1).saturating_sub(smooth.max(1));
    let ks: Vec<f64> = (first..=last).map(k_at).collect();
    Stochastic { k: k_at(last), d: sma(&ks, smooth.max(1)) }
}

/// On-balance volume.
pub fn obv(closes: &[f64], volumes: &[f64]) -> f64 {
    let n = closes.len().min(volumes.len());
    let mut total = 0.0;
    for i in 1..n {
        if closes[i] > closes[i - 1] {
            total += volumes[i];
        } else if closes[i] < closes[i - 1] {
            total -= volumes[i];
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64, eps: f64) {
        assert!((a - b).abs() < eps, "expected {b}, got {a}");
    }

    #[test]
    fn sma_short_input_returns_last_value() {
        assert_eq!(sma(&[1.0, 2.0, 9.0], 5), 9.0);
        assert_eq!(sma(&[], 5), 0.0);
    }

    #[test]
    fn sma_uses_trailing_window() {
        approx(sma(&[1.0, 2.0, 3.0, 4.0, 5.0], 3), 4.0, 1e-12);
    }

    #[test]
    fn ema_backfills_seed() {
        let out = ema(&[1.0, 2.0, 3.0, 4.0, 5.0], 3);
        assert_eq!(out, vec![2.0, 2.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn ema_short_input_is_flat() {
        assert_eq!(ema(&[3.0, 7.0], 5), vec![7.0, 7.0]);
        assert!(ema(&[], 5).is_empty());
    }

    #[test]
    fn macd_histogram_is_line_minus_signal() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.1).collect();
        let m = macd_default(&closes);
        assert_eq!(m.line.len(), closes.len());
        for i in 0..closes.len() {
            approx(m.histogram[i], m.line[i] - m.signal[i], 1e-12);
        }
        let v = m.latest();
        approx(v.histogram, v.macd - v.signal, 1e-12);
    }

    #[test]
    fn rsi_insufficient_data_is_neutral() {
        assert_eq!(rsi(&[100.0; 10], 14), 50.0);
    }

    #[test]
    fn rsi_flat_series_hits_loss_rule_first() {
        assert_eq!(rsi(&[100.0; 20], 14), 100.0);
    }

    #[test]
    fn rsi_extremes() {
        let up: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let down: Vec<f64> = up.iter().rev().copied().collect();
        assert_eq!(rsi(&up, 14), 100.0);
        assert_eq!(rsi(&down, 14), 0.0);
    }

    #[test]
    fn rsi_wilder_smoothing() {
        // deltas +0.34 -0.25 -0.48 | +0.72
        // seed gain 0.34/3, loss 0.73/3; after smoothing gain 2.84/9, loss 1.46/9
        let r = rsi(&[44.0, 44.34, 44.09, 43.61, 44.33], 3);
        approx(r, 100.0 - 100.0 / (1.0 + 2.84 / 1.46), 1e-9);
        approx(r, 66.0465, 1e-3);
    }

    #[test]
    fn bollinger_population_stddev() {
        let bb = bollinger(&[1.0, 2.0, 3.0, 4.0, 5.0], 5, 2.0);
        approx(bb.middle, 3.0, 1e-12);
        approx(bb.upper, 3.0 + 2.0 * 2f64.sqrt(), 1e-12);
        approx(bb.lower, 3.0 - 2.0 * 2f64.sqrt(), 1e-12);
        approx(bb.percent_b, (5.0 - bb.lower) / (bb.upper - bb.lower), 1e-12);
    }

    #[test]
    fn bollinger_zero_width() {
        let bb = bollinger(&[10.0; 25], 20, 2.0);
        assert_eq!(bb.percent_b, 0.5);
        assert_eq!(bb.upper, bb.lower);
    }

    #[test]
    fn atr_wilder() {
        let highs = [10.0, 11.0, 12.0, 11.0];
        let lows = [9.0, 10.0, 10.0, 9.0];
        let closes = [9.5, 10.5, 11.0, 10.0];
        // TR: 1.5, 2.0, 2.0 -> seed 1.75 -> 1.875
        approx(atr(&highs, &lows, &closes, 2), 1.875, 1e-12);
        approx(atr(&highs, &lows, &closes, 14), (1.5 + 2.0 + 2.0) / 3.0, 1e-12);
        assert_eq!(atr(&[], &[], &[], 14), 0.0);
    }

    #[test]
    fn vwap_falls_back_to_last_close() {
        approx(vwap(&[10.0, 20.0], &[1.0, 3.0]), 17.5, 1e-12);
        assert_eq!(vwap(&[10.0, 20.0], &[0.0, 0.0]), 20.0);
    }

    #[test]
    fn pivots() {
        let p = pivot_points(110.0, 90.0, 100.0);
        assert_eq!((p.pivot, p.r1, p.s1), (100.0, 110.0, 90.0));
        assert_eq!((p.r2, p.s2), (120.0, 80.0));
        assert_eq!((p.r3, p.s3), (130.0, 70.0));
    }

    #[test]
    fn stochastic_and_obv() {
        let bars: Vec<Bar> = [(10.0, 8.0, 9.0), (11.0, 9.0, 10.0), (12.0, 10.0, 12.0)]
            .iter()
            .map(|&(h, l, c)| Bar { open: c, high: h, low: l, close: c, volume: 100.0 })
            .collect();
        let s = stochastic(&bars, 3, 1);
        approx(s.k, 100.0, 1e-12);
        approx(s.d, 100.0, 1e-12);
        assert_eq!(obv(&[1.0, 2.0, 1.5, 1.5], &[10.0, 20.0, 5.0, 7.0]), 15.0);
    }
}
