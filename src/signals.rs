// ===============================
// src/signals.rs
// ===============================
//
// Full indicator snapshot over a bar series plus a coarse bullish/bearish
// read of it. Input to an external strategy engine; nothing here trades.
//

use serde::Serialize;

use crate::indicators::{self, Bar, BollingerBands, MacdValue, Stochastic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RsiZone { Overbought, Oversold, Bullish, Bearish }

impl RsiZone {
    pub fn classify(rsi: f64) -> Self {
        if rsi > 70.0 {
            RsiZone::Overbought
        } else if rsi < 30.0 {
            RsiZone::Oversold
        } else if rsi > 50.0 {
            RsiZone::Bullish
        } else {
            RsiZone::Bearish
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StochZone { Overbought, Oversold, BullishCross, BearishCross }

impl StochZone {
    pub fn classify(s: &Stochastic) -> Self {
        if s.k > 80.0 && s.d > 80.0 {
            StochZone::Overbought
        } else if s.k < 20.0 && s.d < 20.0 {
            StochZone::Oversold
        } else if s.k > s.d {
            StochZone::BullishCross
        } else {
            StochZone::BearishCross
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction { Buy, Sell, Neutral }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strength { Strong, Medium }

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorSignal {
    pub direction: Direction,
    pub indicator: &'static str,
    pub strength: Strength,
    pub message: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment { Bullish, Bearish, Neutral }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence { High, Medium, Low }

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentimentScore {
    pub sentiment: Sentiment,
    /// Share of weighted buy votes, 0..=100.
    pub score: f64,
    pub confidence: Confidence,
    pub buy_signals: usize,
    pub sell_signals: usize,
}

impl SentimentScore {
    /// Strong votes weigh 2, medium 1. Neutral signals do not vote.
    pub fn from_signals(signals: &[IndicatorSignal]) -> Self {
        let weight = |s: &IndicatorSignal| if s.strength == Strength::Strong { 2.0 } else { 1.0 };
        let buy: f64 = signals.iter().filter(|s| s.direction == Direction::Buy).map(weight).sum();
        let sell: f64 = signals.iter().filter(|s| s.direction == Direction::Sell).map(weight).sum();
        let buy_signals = signals.iter().filter(|s| s.direction == Direction::Buy).count();
        let sell_signals = signals.iter().filter(|s| s.direction == Direction::Sell).count();

        let total = buy + sell;
        if total == 0.0 {
            return Self { sentiment: Sentiment::Neutral, score: 50.0, confidence: Confidence::Low, buy_signals, sell_signals };
        }
        let buy_pct = buy / total * 100.0;
        let (sentiment, confidence) = if buy_pct > 65.0 {
            (Sentiment::Bullish, if buy_pct > 80.0 { Confidence::High } else { Confidence::Medium })
        } else if buy_pct < 35.0 {
            (Sentiment::Bearish, if buy_pct < 20.0 { Confidence::High } else { Confidence::Medium })
        } else {
            (Sentiment::Neutral, Confidence::Low)
        };
        Self { sentiment, score: buy_pct, confidence, buy_signals, sell_signals }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorSnapshot {
    pub price: f64,
    pub change: f64,
    pub change_pct: f64,
    pub rsi: f64,
    pub rsi_zone: RsiZone,
    pub stochastic: Stochastic,
    pub stoch_zone: StochZone,
    pub macd: MacdValue,
    pub sma_20: f64,
    pub sma_50: f64,
    pub ema_12: f64,
    pub ema_26: f64,
    pub trend: Sentiment,
    pub bollinger: BollingerBands,
    pub atr: f64,
    pub vwap: f64,
    pub obv: f64,
    pub volume_ratio: f64,
    pub signals: Vec<IndicatorSignal>,
    pub score: SentimentScore,
}

impl IndicatorSnapshot {
    /// `None` for an empty series.
    pub fn compute(bars: &[Bar]) -> Option<Self> {
        let last = bars.last()?;
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

        let price = last.close;
        let prev = if bars.len() > 1 { bars[bars.len() - 2].close } else { price };
        let change = price - prev;
        let change_pct = if prev > 0.0 { change / prev * 100.0 } else { 0.0 };

        let rsi = indicators::rsi(&closes, 14);
        let stochastic = indicators::stochastic(bars, 14, 3);
        let macd = indicators::macd_default(&closes).latest();
        let sma_20 = indicators::sma(&closes, 20);
        let sma_50 = if closes.len() >= 50 { indicators::sma(&closes, 50) } else { sma_20 };
        let bollinger = indicators::bollinger(&closes, 20, 2.0);

        let tail = &volumes[volumes.len().saturating_sub(20)..];
        let avg_volume = tail.iter().sum::<f64>() / tail.len() as f64;
        let volume_ratio = if avg_volume > 0.0 { last.volume / avg_volume } else { 1.0 };

        let trend = if price > sma_20 && sma_20 > sma_50 {
            Sentiment::Bullish
        } else if price < sma_20 && sma_20 < sma_50 {
            Sentiment::Bearish
        } else {
            Sentiment::Neutral
        };

        let signals = collect_signals(rsi, macd.histogram, bollinger.percent_b, trend, volume_ratio);
        let score = SentimentScore::from_signals(&signals);

        Some(Self {
            price,
            change,
            change_pct,
            rsi,
            rsi_zone: RsiZone::classify(rsi),
            stochastic,
            stoch_zone: StochZone::classify(&stochastic),
            macd,
            sma_20,
            sma_50,
            ema_12: indicators::ema_last(&closes, 12),
            ema_26: indicators::ema_last(&closes, 26),
            trend,
            bollinger,
            atr: indicators::atr_bars(bars, 14),
            vwap: indicators::vwap(&closes, &volumes),
            obv: indicators::obv(&closes, &volumes),
            volume_ratio,
            signals,
            score,
        })
    }
}

fn collect_signals(rsi: f64, macd_hist: f64, percent_b: f64, trend: Sentiment, volume_ratio: f64) -> Vec<IndicatorSignal> {
    let mut out = Vec::with_capacity(5);
    let sig = |direction: Direction, indicator: &'static str, strength: Strength, message: &'static str| {
        IndicatorSignal { direction, indicator, strength, message }
    };

    if rsi < 30.0 {
        out.push(sig(Direction::Buy, "RSI", Strength::Strong, "Oversold condition"));
    } else if rsi > 70.0 {
        out.push(sig(Direction::Sell, "RSI", Strength::Strong, "Overbought condition"));
    }

    if macd_hist > 0.0 {
        out.push(sig(Direction::Buy, "MACD", Strength::Medium, "Bullish momentum"));
    } else {
        out.push(sig(Direction::Sell, "MACD", Strength::Medium, "Bearish momentum"));
    }

    if percent_b < 0.2 {
        out.push(sig(Direction::Buy, "BB", Strength::Medium, "Near lower band"));
    } else if percent_b > 0.8 {
        out.push(sig(Direction::Sell, "BB", Strength::Medium, "Near upper band"));
    }

    match trend {
        Sentiment::Bullish => out.push(sig(Direction::Buy, "MA", Strength::Strong, "Uptrend confirmed")),
        Sentiment::Bearish => out.push(sig(Direction::Sell, "MA", Strength::Strong, "Downtrend confirmed")),
        Sentiment::Neutral => {}
    }

    if volume_ratio > 1.5 {
        out.push(sig(Direction::Neutral, "Volume", Strength::Medium, "High volume - confirmation"));
    }
    out
}
