// ===============================
// src/strategy_config.rs
// ===============================
//
// Shared strategy parameters. Written only by the adaptive controller
// (through a watch channel), read by everyone else as whole snapshots.
//
use serde::{Deserialize, Serialize};

use crate::metrics::CONFIG_PARAM;

pub const RSI_OVERSOLD_MIN: f64 = 25.0;
pub const RSI_OVERSOLD_MAX: f64 = 40.0;
pub const STOP_MULT_MIN: f64 = 0.5;
pub const STOP_MULT_MAX: f64 = 3.0;
pub const MAX_POSITIONS_MIN: u32 = 2;
pub const MAX_POSITIONS_MAX: u32 = 8;
pub const COOLDOWN_MAX_SECS: u64 = 10;
pub const DAILY_TRADES_MIN: u32 = 50;
pub const DAILY_TRADES_MAX: u32 = 1_000;
pub const PROFIT_TARGET_MIN: f64 = 0.001;
pub const PROFIT_TARGET_MAX: f64 = 0.15;
pub const CONFLUENCE_MIN: u32 = 1;
pub const CONFLUENCE_MAX: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    // ---- tunable (adjusted by the controller, persisted) ----
    pub rsi_oversold: f64,
    pub stop_loss_atr_mult: f64,
    pub max_positions: u32,
    pub cooldown_secs: u64,
    pub max_daily_trades: u32,
    /// Fraction of entry price (0.02 = 2%).
    pub min_profit_target: f64,
    pub min_confluence: u32,

    // ---- structural (never adjusted) ----
    pub rsi_overbought: f64,
    pub take_profit_atr_mult: f64,
    /// Dollars.
    pub daily_loss_limit: f64,
    pub position_size_pct: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            rsi_oversold: 30.0,
            stop_loss_atr_mult: 2.0,
            max_positions: 5,
            cooldown_secs: 5,
            max_daily_trades: 200,
            min_profit_target: 0.02,
            min_confluence: 2,
            rsi_overbought: 70.0,
            take_profit_atr_mult: 3.0,
            daily_loss_limit: 1_000.0,
            position_size_pct: 0.02,
        }
    }
}

/// Persisted subset. Anything else in a state file is ignored on restore.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunableParams {
    pub rsi_oversold: Option<f64>,
    pub stop_loss_atr_mult: Option<f64>,
    pub max_positions: Option<u32>,
    pub cooldown_secs: Option<u64>,
    pub max_daily_trades: Option<u32>,
    pub min_profit_target: Option<f64>,
    pub min_confluence: Option<u32>,
}

fn clamp_f(v: f64, lo: f64, hi: f64, fallback: f64) -> f64 {
    if v.is_finite() { v.clamp(lo, hi) } else { fallback }
}

impl StrategyConfig {
    pub fn tunables(&self) -> TunableParams {
        TunableParams {
            rsi_oversold: Some(self.rsi_oversold),
            stop_loss_atr_mult: Some(self.stop_loss_atr_mult),
            max_positions: Some(self.max_positions),
            cooldown_secs: Some(self.cooldown_secs),
            max_daily_trades: Some(self.max_daily_trades),
            min_profit_target: Some(self.min_profit_target),
            min_confluence: Some(self.min_confluence),
        }
    }

    /// Overlay restored tunables, clamped into bounds. Structural fields untouched.
    pub fn apply_tunables(&mut self, p: &TunableParams) {
        if let Some(v) = p.rsi_oversold {
            self.rsi_oversold = clamp_f(v, RSI_OVERSOLD_MIN, RSI_OVERSOLD_MAX, self.rsi_oversold);
        }
        if let Some(v) = p.stop_loss_atr_mult {
            self.stop_loss_atr_mult = clamp_f(v, STOP_MULT_MIN, STOP_MULT_MAX, self.stop_loss_atr_mult);
        }
        if let Some(v) = p.max_positions {
            self.max_positions = v.clamp(MAX_POSITIONS_MIN, MAX_POSITIONS_MAX);
        }
        if let Some(v) = p.cooldown_secs {
            self.cooldown_secs = v.min(COOLDOWN_MAX_SECS);
        }
        if let Some(v) = p.max_daily_trades {
            self.max_daily_trades = v.clamp(DAILY_TRADES_MIN, DAILY_TRADES_MAX);
        }
        if let Some(v) = p.min_profit_target {
            self.min_profit_target = clamp_f(v, PROFIT_TARGET_MIN, PROFIT_TARGET_MAX, self.min_profit_target);
        }
        if let Some(v) = p.min_confluence {
            self.min_confluence = v.clamp(CONFLUENCE_MIN, CONFLUENCE_MAX);
        }
    }

    /// Push current tunables to the config gauges.
    pub fn publish(&self) {
        for (name, v) in [
            ("rsi_oversold", self.rsi_oversold),
            ("stop_loss_atr_mult", self.stop_loss_atr_mult),
            ("max_positions", self.max_positions as f64),
            ("cooldown_secs", self.cooldown_secs as f64),
            ("max_daily_trades", self.max_daily_trades as f64),
            ("min_profit_target", self.min_profit_target),
            ("min_confluence", self.min_confluence as f64),
        ] {
            CONFIG_PARAM.with_label_values(&[name]).set(v);
        }
    }
}
