// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : tradeloop, trading telemetry & adaptive-control core in Rust
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Ingests Binance/Alpaca trade streams, times order execution with
          pre-positioned orders, tracks slippage, scores strategy
          performance, and re-tunes strategy parameters from closed trades.
          Exposes Prometheus metrics and records JSONL events.
=============================================================================
*/
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;
use thiserror::Error;

use crate::controller::ControllerSettings;
use crate::feed::FeedSettings;
use crate::performance::DEFAULT_STARTING_EQUITY;
use crate::strategy_config::StrategyConfig;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("no symbols configured")]
    NoSymbols,
}

/// Flags override the environment.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "tradeloop", version, about = "Trading telemetry & adaptive-control core")]
pub struct Cli {
    /// Comma separated, e.g. BTCUSDT,ETHUSDT,AAPL
    #[arg(long)]
    pub symbols: Option<String>,
    #[arg(long)]
    pub metrics_port: Option<u16>,
    /// Learning state JSON
    #[arg(long)]
    pub state_file: Option<PathBuf>,
    /// JSONL event journal
    #[arg(long)]
    pub record_file: Option<PathBuf>,
    /// Do not connect to market data
    #[arg(long)]
    pub no_feed: bool,
}

#[derive(Clone, Debug)]
pub struct Args {
    pub symbols: Vec<String>,
    pub metrics_port: u16,
    pub record_file: Option<PathBuf>,
    pub feed_enabled: bool,
    pub feed: FeedSettings,
    pub controller: ControllerSettings,
    pub strategy: StrategyConfig,
    pub broker_timeout: Duration,
    pub mock_fill: Duration,
    pub starting_equity: f64,
    pub heartbeat: Duration,
    pub equity_interval: Duration,
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid { key, value: v }),
    }
}

fn split_symbols(s: &str) -> Vec<String> {
    let mut out: Vec<String> = s
        .split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| x.to_ascii_uppercase())
        .collect();
    out.dedup();
    out
}

/// `.env` + process environment, then `cli` on top.
pub fn load(cli: &Cli) -> Result<Args, ConfigError> {
    let _ = dotenv();
    from_lookup(|k| env::var(k).ok(), cli)
}

pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>, cli: &Cli) -> Result<Args, ConfigError> {
    let symbols_raw = cli
        .symbols
        .clone()
        .or_else(|| lookup("SYMBOLS"))
        .unwrap_or_else(|| "BTCUSDT,ETHUSDT".to_string());
    let symbols = split_symbols(&symbols_raw);
    if symbols.is_empty() {
        return Err(ConfigError::NoSymbols);
    }

    let metrics_port = match cli.metrics_port {
        Some(p) => p,
        None => parse_var(&lookup, "METRICS_PORT", 9898u16)?,
    };
    let record_file = cli.record_file.clone().or_else(|| lookup("RECORD_FILE").map(PathBuf::from));
    let state_path = cli
        .state_file
        .clone()
        .or_else(|| lookup("LEARNING_STATE_FILE").map(PathBuf::from))
        .or_else(|| Some(PathBuf::from("data/learning_state.json")));

    let feed_defaults = FeedSettings::default();
    let feed = FeedSettings {
        binance_ws_url: lookup("BINANCE_WS_URL").unwrap_or(feed_defaults.binance_ws_url),
        alpaca_ws_url: lookup("ALPACA_WS_URL").unwrap_or(feed_defaults.alpaca_ws_url),
        alpaca_key_id: lookup("ALPACA_KEY_ID").filter(|s| !s.is_empty()),
        alpaca_secret_key: lookup("ALPACA_SECRET_KEY").filter(|s| !s.is_empty()),
        reconnect_delay: Duration::from_millis(parse_var(&lookup, "FEED_RECONNECT_MS", 5_000u64)?),
        connect_timeout: Duration::from_millis(parse_var(&lookup, "FEED_CONNECT_TIMEOUT_MS", 10_000u64)?),
    };

    let ctl_defaults = ControllerSettings::default();
    let controller = ControllerSettings {
        interval: Duration::from_secs(parse_var(&lookup, "LEARNING_INTERVAL_SECS", ctl_defaults.interval.as_secs())?),
        initial_delay: Duration::from_secs(parse_var(
            &lookup,
            "LEARNING_INITIAL_DELAY_SECS",
            ctl_defaults.initial_delay.as_secs(),
        )?),
        min_trades: parse_var(&lookup, "MIN_TRADES_FOR_LEARNING", ctl_defaults.min_trades)?,
        lookback_days: ctl_defaults.lookback_days,
        state_path,
    };

    Ok(Args {
        symbols,
        metrics_port,
        record_file,
        feed_enabled: !cli.no_feed,
        feed,
        controller,
        strategy: StrategyConfig::default(),
        broker_timeout: Duration::from_millis(parse_var(&lookup, "BROKER_TIMEOUT_MS", 5_000u64)?),
        mock_fill: Duration::from_millis(parse_var(&lookup, "MOCK_FILL_MS", 5u64)?),
        starting_equity: parse_var(&lookup, "STARTING_EQUITY", DEFAULT_STARTING_EQUITY)?,
        heartbeat: Duration::from_secs(parse_var(&lookup, "HEARTBEAT_SECS", 10u64)?.max(1)),
        equity_interval: Duration::from_secs(parse_var(&lookup, "EQUITY_SNAPSHOT_SECS", 300u64)?.max(1)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let a = from_lookup(env_of(&[]), &Cli::default()).unwrap();
        assert_eq!(a.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(a.metrics_port, 9898);
        assert_eq!(a.controller.interval, Duration::from_secs(300));
        assert_eq!(a.controller.initial_delay, Duration::from_secs(30));
        assert_eq!(a.broker_timeout, Duration::from_secs(5));
        assert_eq!(a.equity_interval, Duration::from_secs(300));
        assert!(a.feed_enabled);
        assert!(a.record_file.is_none());
    }

    #[test]
    fn cli_overrides_env() {
        let env = env_of(&[("SYMBOLS", "aapl, msft"), ("METRICS_PORT", "9000"), ("RECORD_FILE", "/tmp/a.jsonl")]);
        let cli = Cli {
            symbols: Some("btcusdt".into()),
            metrics_port: Some(9100),
            no_feed: true,
            ..Default::default()
        };
        let a = from_lookup(env, &cli).unwrap();
        assert_eq!(a.symbols, vec!["BTCUSDT"]);
        assert_eq!(a.metrics_port, 9100);
        assert_eq!(a.record_file, Some(PathBuf::from("/tmp/a.jsonl")));
        assert!(!a.feed_enabled);
    }

    #[test]
    fn bad_numbers_are_errors() {
        let err = from_lookup(env_of(&[("LEARNING_INTERVAL_SECS", "soon")]), &Cli::default()).unwrap_err();
        assert_eq!(err, ConfigError::Invalid { key: "LEARNING_INTERVAL_SECS", value: "soon".into() });
        let err = from_lookup(env_of(&[("SYMBOLS", " , ")]), &Cli::default()).unwrap_err();
        assert_eq!(err, ConfigError::NoSymbols);
    }
}
