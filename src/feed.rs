// ===============================
// src/feed.rs
// ===============================
//
// Market data ingestor:
// - one WS task per venue (Binance combined trade stream, Alpaca trades)
// - normalises every trade into a `Tick`, measures receive - source latency
// - keeps last-value-wins order book per symbol
// - publishes `FeedEvent`s on a broadcast channel (never waits on subscribers)
//
// Reconnect uses a fixed delay. HTTP 451 (or an in-band 451 error) disables the
// venue for the rest of the process lifetime.
//
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::domain::{now_ms, Tick};
use crate::metrics::{
    FEED_CONNECTED, FEED_DISABLED, FEED_LATENCY_MS, FEED_PARSE_ERRORS, FEED_RECONNECTS, TICKS,
    TICKS_BY_SYMBOL,
};

const GEO_BLOCK_STATUS: u16 = 451;
const BINANCE_QUOTES: [&str; 7] = ["USDT", "USDC", "BUSD", "FDUSD", "BTC", "ETH", "BNB"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue { Binance, Alpaca }

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self { Venue::Binance => "binance", Venue::Alpaca => "alpaca" }
    }

    /// Crypto pairs quoted without a slash (BTCUSDT, ETHBTC) go to Binance; the rest to Alpaca.
    pub fn for_symbol(symbol: &str) -> Self {
        if symbol.contains('/') {
            return Venue::Alpaca;
        }
        let s = symbol.to_ascii_uppercase();
        if BINANCE_QUOTES.iter().any(|q| s.len() > q.len() && s.ends_with(q)) {
            Venue::Binance
        } else {
            Venue::Alpaca
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedState { Disconnected, Connecting, Connected, Disabled }

#[derive(Debug, Clone)]
pub enum FeedEvent {
    Tick(Tick),
    Connected(Venue),
    Disconnected(Venue),
    Error { venue: Venue, message: String },
    Disabled(Venue),
    Stopped,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("bad ws url {0}")]
    Url(#[from] url::ParseError),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("websocket: {0}")]
    Ws(#[from] tungstenite::Error),
    #[error("geo-restricted (451)")]
    GeoBlocked,
    #[error("stream closed by peer")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub binance_ws_url: String,
    pub alpaca_ws_url: String,
    pub alpaca_key_id: Option<String>,
    pub alpaca_secret_key: Option<String>,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            binance_ws_url: "wss://stream.binance.com:9443".into(),
            alpaca_ws_url: "wss://stream.data.alpaca.markets/v2/iex".into(),
            alpaca_key_id: None,
            alpaca_secret_key: None,
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyAgg {
    pub count: u64,
    pub min_ms: i64,
    pub max_ms: i64,
    pub avg_ms: f64,
    pub last_ms: i64,
}

impl LatencyAgg {
    fn observe(&mut self, ms: i64) {
        if self.count == 0 {
            self.min_ms = ms;
            self.max_ms = ms;
        } else {
            self.min_ms = self.min_ms.min(ms);
            self.max_ms = self.max_ms.max(ms);
        }
        self.count += 1;
        self.avg_ms += (ms as f64 - self.avg_ms) / self.count as f64;
        self.last_ms = ms;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub global: LatencyAgg,
    pub by_exchange: BTreeMap<String, LatencyAgg>,
}

/// Result of decoding one text frame.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    Ticks(Vec<Tick>),
    GeoBlocked,
    Ignore,
}

fn num_field(v: &Value) -> Option<f64> {
    match v {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Millis from RFC3339 or a numeric epoch (ms / us / ns by magnitude).
fn ts_field(v: &Value) -> Option<i64> {
    match v {
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|d| d.timestamp_millis()),
        Value::Number(n) => {
            let x = n.as_i64()?;
            Some(if x > 100_000_000_000_000_000 {
                x / 1_000_000
            } else if x > 100_000_000_000_000 {
                x / 1_000
            } else {
                x
            })
        }
        _ => None,
    }
}

fn in_band_451(v: &Value) -> bool {
    v.get("code").and_then(Value::as_i64) == Some(GEO_BLOCK_STATUS as i64)
}

/// `{"stream":"btcusdt@trade","data":{"e":"trade","s":"BTCUSDT","p":"..","q":"..","T":..}}`
/// (the raw single-stream form without the `data` wrapper is accepted too).
pub fn parse_binance(txt: &str, receive_ts_ms: i64) -> Option<Inbound> {
    let v: Value = serde_json::from_str(txt).ok()?;
    if in_band_451(&v) {
        return Some(Inbound::GeoBlocked);
    }
    let d = v.get("data").unwrap_or(&v);
    if d.get("e").and_then(Value::as_str) != Some("trade") {
        return Some(Inbound::Ignore);
    }
    let tick = Tick {
        symbol: d.get("s")?.as_str()?.to_string(),
        price: num_field(d.get("p")?)?,
        size: num_field(d.get("q")?)?,
        source_ts_ms: d.get("T").and_then(Value::as_i64)?,
        receive_ts_ms,
        exchange: Venue::Binance.as_str().into(),
    };
    Some(Inbound::Ticks(vec![tick]))
}

/// Flat `{"Symbol","Price","Size","Timestamp"}` or the v2 array
/// `[{"T":"t","S":"AAPL","p":..,"s":..,"t":"2024-..Z"}, ...]`.
pub fn parse_alpaca(txt: &str, receive_ts_ms: i64) -> Option<Inbound> {
    let v: Value = serde_json::from_str(txt).ok()?;
    match &v {
        Value::Array(items) => {
            let mut ticks = Vec::with_capacity(items.len());
            for it in items {
                match it.get("T").and_then(Value::as_str) {
                    Some("t") => {
                        let tick = (|| {
                            Some(Tick {
                                symbol: it.get("S")?.as_str()?.to_string(),
                                price: num_field(it.get("p")?)?,
                                size: num_field(it.get("s")?)?,
                                source_ts_ms: ts_field(it.get("t")?)?,
                                receive_ts_ms,
                                exchange: Venue::Alpaca.as_str().into(),
                            })
                        })();
                        if let Some(t) = tick {
                            ticks.push(t);
                        }
                    }
                    Some("error") if in_band_451(it) => return Some(Inbound::GeoBlocked),
                    _ => {}
                }
            }
            Some(if ticks.is_empty() { Inbound::Ignore } else { Inbound::Ticks(ticks) })
        }
        Value::Object(_) => {
            if in_band_451(&v) {
                return Some(Inbound::GeoBlocked);
            }
            let Some(sym) = v.get("Symbol").and_then(Value::as_str) else {
                return Some(Inbound::Ignore);
            };
            Some(Inbound::Ticks(vec![Tick {
                symbol: sym.to_string(),
                price: num_field(v.get("Price")?)?,
                size: num_field(v.get("Size")?)?,
                source_ts_ms: ts_field(v.get("Timestamp")?)?,
                receive_ts_ms,
                exchange: Venue::Alpaca.as_str().into(),
            }]))
        }
        _ => None,
    }
}

struct Shared {
    book: Mutex<HashMap<String, Tick>>,
    latency: Mutex<LatencyStats>,
    states: Mutex<BTreeMap<Venue, FeedState>>,
    reconnects: AtomicU64,
    events: broadcast::Sender<FeedEvent>,
}

impl Shared {
    fn set_state(&self, venue: Venue, state: FeedState) {
        self.states.lock().insert(venue, state);
        FEED_CONNECTED
            .with_label_values(&[venue.as_str()])
            .set((state == FeedState::Connected) as i64);
        FEED_DISABLED
            .with_label_values(&[venue.as_str()])
            .set((state == FeedState::Disabled) as i64);
    }

    fn state(&self, venue: Venue) -> Option<FeedState> {
        self.states.lock().get(&venue).copied()
    }

    fn publish(&self, ev: FeedEvent) {
        // Err only means no subscribers right now.
        let _ = self.events.send(ev);
    }

    fn ingest(&self, tick: Tick) {
        let latency = tick.network_latency_ms();
        {
            let mut l = self.latency.lock();
            l.global.observe(latency);
            l.by_exchange.entry(tick.exchange.clone()).or_default().observe(latency);
        }
        FEED_LATENCY_MS
            .with_label_values(&[tick.exchange.as_str()])
            .observe(latency.max(0) as f64);
        TICKS.inc();
        TICKS_BY_SYMBOL.with_label_values(&[tick.symbol.as_str()]).inc();

        self.book.lock().insert(tick.symbol.clone(), tick.clone());
        self.publish(FeedEvent::Tick(tick));
    }
}

struct Running {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct MarketDataIngestor {
    shared: Arc<Shared>,
    settings: FeedSettings,
    running: Mutex<Option<Running>>,
}

impl MarketDataIngestor {
    pub fn new(settings: FeedSettings) -> Self {
        let (events, _) = broadcast::channel(4096);
        Self {
            shared: Arc::new(Shared {
                book: Mutex::new(HashMap::new()),
                latency: Mutex::new(LatencyStats::default()),
                states: Mutex::new(BTreeMap::new()),
                reconnects: AtomicU64::new(0),
                events,
            }),
            settings,
            running: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_running(&self) -> bool { self.running.lock().is_some() }

    /// Spawns one connection task per venue and returns immediately.
    /// Must be called from inside a Tokio runtime.
    pub fn start(&self, symbols: &[String]) {
        let mut running = self.running.lock();
        if running.is_some() {
            info!("feed already running, start ignored");
            return;
        }

        let mut by_venue: BTreeMap<Venue, Vec<String>> = BTreeMap::new();
        for s in symbols {
            by_venue.entry(Venue::for_symbol(s)).or_default().push(s.clone());
        }

        let token = CancellationToken::new();
        let mut tasks = Vec::with_capacity(by_venue.len());
        for (venue, syms) in by_venue {
            if self.shared.state(venue) == Some(FeedState::Disabled) {
                warn!(venue = venue.as_str(), "venue disabled, not starting");
                continue;
            }
            info!(venue = venue.as_str(), symbols = ?syms, "starting feed");
            self.shared.set_state(venue, FeedState::Disconnected);
            tasks.push(tokio::spawn(run_venue(
                venue,
                syms,
                self.shared.clone(),
                self.settings.clone(),
                token.child_token(),
            )));
        }
        *running = Some(Running { token, tasks });
    }

    /// Idempotent. Cancels the run token first so no reconnect fires afterwards.
    pub async fn stop(&self) {
        let Some(Running { token, tasks }) = self.running.lock().take() else {
            debug!("feed not running, stop ignored");
            return;
        };
        token.cancel();
        for t in tasks {
            let abort = t.abort_handle();
            if timeout(Duration::from_secs(2), t).await.is_err() {
                abort.abort();
            }
        }
        let venues: Vec<Venue> = self.shared.states.lock().keys().copied().collect();
        for v in venues {
            if self.shared.state(v) != Some(FeedState::Disabled) {
                self.shared.set_state(v, FeedState::Disconnected);
            }
        }
        self.shared.publish(FeedEvent::Stopped);
        info!("feed stopped");
    }

    /// Normalised tick entry point (also used for replay / paper mode).
    pub fn ingest(&self, tick: Tick) { self.shared.ingest(tick) }

    /// Copy of the book; callers never see the live map.
    pub fn order_book(&self) -> HashMap<String, Tick> { self.shared.book.lock().clone() }

    pub fn latest(&self, symbol: &str) -> Option<Tick> { self.shared.book.lock().get(symbol).cloned() }

    pub fn latency_stats(&self) -> LatencyStats { self.shared.latency.lock().clone() }

    pub fn feed_states(&self) -> BTreeMap<Venue, FeedState> { self.shared.states.lock().clone() }

    pub fn reconnect_count(&self) -> u64 { self.shared.reconnects.load(Ordering::Relaxed) }
}

async fn run_venue(
    venue: Venue,
    symbols: Vec<String>,
    shared: Arc<Shared>,
    settings: FeedSettings,
    token: CancellationToken,
) {
    loop {
        if token.is_cancelled() {
            break;
        }
        shared.set_state(venue, FeedState::Connecting);

        let res = tokio::select! {
            _ = token.cancelled() => break,
            r = session(venue, &symbols, &shared, &settings, &token) => r,
        };
        match res {
            Ok(()) => {}
            Err(FeedError::GeoBlocked) => {
                error!(venue = venue.as_str(), "feed geo-restricted (451), disabling permanently");
                shared.set_state(venue, FeedState::Disabled);
                shared.publish(FeedEvent::Disabled(venue));
                return;
            }
            Err(e) => {
                warn!(venue = venue.as_str(), error = %e, "feed error");
                shared.publish(FeedEvent::Error { venue, message: e.to_string() });
            }
        }

        shared.set_state(venue, FeedState::Disconnected);
        shared.publish(FeedEvent::Disconnected(venue));
        if token.is_cancelled() {
            break;
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep(settings.reconnect_delay) => {}
        }
        shared.reconnects.fetch_add(1, Ordering::Relaxed);
        FEED_RECONNECTS.with_label_values(&[venue.as_str()]).inc();
        info!(venue = venue.as_str(), delay_ms = settings.reconnect_delay.as_millis() as u64, "reconnecting");
    }
    debug!(venue = venue.as_str(), "feed task exit");
}

fn stream_url(venue: Venue, symbols: &[String], settings: &FeedSettings) -> Result<Url, FeedError> {
    let url = match venue {
        Venue::Binance => {
            let streams: Vec<String> =
                symbols.iter().map(|s| format!("{}@trade", s.to_lowercase())).collect();
            format!(
                "{}/stream?streams={}",
                settings.binance_ws_url.trim_end_matches('/'),
                streams.join("/")
            )
        }
        Venue::Alpaca => settings.alpaca_ws_url.clone(),
    };
    Ok(Url::parse(&url)?)
}

/// One connection lifetime. `Ok(())` on a clean close or cancellation.
async fn session(
    venue: Venue,
    symbols: &[String],
    shared: &Shared,
    settings: &FeedSettings,
    token: &CancellationToken,
) -> Result<(), FeedError> {
    let url = stream_url(venue, symbols, settings)?;
    info!(venue = venue.as_str(), %url, "connecting");

    let (mut ws, _resp) = match timeout(settings.connect_timeout, connect_async(url.as_str())).await {
        Err(_) => return Err(FeedError::ConnectTimeout(settings.connect_timeout)),
        Ok(Err(tungstenite::Error::Http(resp))) if resp.status().as_u16() == GEO_BLOCK_STATUS => {
            return Err(FeedError::GeoBlocked)
        }
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(pair)) => pair,
    };

    if venue == Venue::Alpaca {
        if let (Some(key), Some(secret)) = (&settings.alpaca_key_id, &settings.alpaca_secret_key) {
            let auth = serde_json::json!({"action": "auth", "key": key, "secret": secret});
            ws.send(Message::Text(auth.to_string())).await?;
        }
        let sub = serde_json::json!({"action": "subscribe", "trades": symbols});
        ws.send(Message::Text(sub.to_string())).await?;
    }

    shared.set_state(venue, FeedState::Connected);
    shared.publish(FeedEvent::Connected(venue));
    info!(venue = venue.as_str(), n = symbols.len(), "feed connected");

    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => {
                let _ = ws.close(None).await;
                return Ok(());
            }
            f = ws.next() => f,
        };
        let msg = match frame {
            None => return Err(FeedError::Closed),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(m)) => m,
        };
        match msg {
            Message::Text(txt) => {
                let parsed = match venue {
                    Venue::Binance => parse_binance(&txt, now_ms()),
                    Venue::Alpaca => parse_alpaca(&txt, now_ms()),
                };
                match parsed {
                    Some(Inbound::Ticks(ticks)) => ticks.into_iter().for_each(|t| shared.ingest(t)),
                    Some(Inbound::GeoBlocked) => {
                        let _ = ws.close(None).await;
                        return Err(FeedError::GeoBlocked);
                    }
                    Some(Inbound::Ignore) => {}
                    None => {
                        FEED_PARSE_ERRORS.with_label_values(&[venue.as_str()]).inc();
                        debug!(venue = venue.as_str(), len = txt.len(), "unparseable frame dropped");
                    }
                }
            }
            Message::Close(_) => return Err(FeedError::Closed),
            // ping/pong are answered by tungstenite on the next read
            _ => {}
        }
    }
}
