// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market data --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "market data ticks").unwrap());

pub static TICKS_BY_SYMBOL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_total_by_symbol", "market data ticks per symbol"),
        &["symbol"],
    )
    .unwrap()
});

// Source timestamp -> local receive (milliseconds)
pub static FEED_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("feed_network_latency_ms", "tick network latency (ms)")
            .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
        &["exchange"],
    )
    .unwrap()
});

pub static FEED_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("feed_connected", "1 if venue stream connected, 0 otherwise"),
        &["venue"],
    )
    .unwrap()
});

pub static FEED_DISABLED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("feed_disabled", "1 if venue disabled (geo-restricted)"),
        &["venue"],
    )
    .unwrap()
});

pub static FEED_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("feed_reconnects_total", "reconnect attempts per venue"),
        &["venue"],
    )
    .unwrap()
});

pub static FEED_PARSE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("feed_parse_errors_total", "malformed stream messages dropped"),
        &["venue"],
    )
    .unwrap()
});

// -------- Execution --------
pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_total", "orders submitted (labels: method, outcome)"),
        &["method", "outcome"],
    )
    .unwrap()
});

// Submission -> broker ack (microseconds)
pub static EXEC_LATENCY_US: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("exec_latency_us", "order submission latency (us)").buckets(vec![
            50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 50_000.0, 250_000.0,
        ]),
        &["method"],
    )
    .unwrap()
});

pub static PRE_POSITIONED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("pre_positioned_orders", "staged orders waiting").unwrap());

// -------- Execution quality --------
pub static SLIPPAGE_BPS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("slippage_bps", "fill slippage (bps)")
            .buckets(vec![1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0]),
    )
    .unwrap()
});

pub static ADVERSE_FILLS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("adverse_fills_total", "fills worse than expected").unwrap());

pub static HIGH_SLIPPAGE: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("high_slippage_total", "fills above 50 bps").unwrap());

// -------- Learning --------
pub static LEARNING_CYCLES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("learning_cycles_total", "learning cycles (label: outcome)"),
        &["outcome"],
    )
    .unwrap()
});

pub static ADJUSTMENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("learning_adjustments_total", "parameter adjustments (label: metric)"),
        &["metric"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_PARAM: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(
        Opts::new("config_param", "live strategy parameter (label: param)"),
        &["param"],
    )
    .unwrap()
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_symbol", "configured symbols (label: symbol)"),
        &["symbol"],
    )
    .unwrap()
});

pub fn init() {
    // Already-registered errors are fine (tests call init more than once)
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(TICKS_BY_SYMBOL.clone())),
        REGISTRY.register(Box::new(FEED_LATENCY_MS.clone())),
        REGISTRY.register(Box::new(FEED_CONNECTED.clone())),
        REGISTRY.register(Box::new(FEED_DISABLED.clone())),
        REGISTRY.register(Box::new(FEED_RECONNECTS.clone())),
        REGISTRY.register(Box::new(FEED_PARSE_ERRORS.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(EXEC_LATENCY_US.clone())),
        REGISTRY.register(Box::new(PRE_POSITIONED.clone())),
        REGISTRY.register(Box::new(SLIPPAGE_BPS.clone())),
        REGISTRY.register(Box::new(ADVERSE_FILLS.clone())),
        REGISTRY.register(Box::new(HIGH_SLIPPAGE.clone())),
        REGISTRY.register(Box::new(LEARNING_CYCLES.clone())),
        REGISTRY.register(Box::new(ADJUSTMENTS.clone())),
        REGISTRY.register(Box::new(CONFIG_PARAM.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let resp = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") | (&Method::GET, "/metrics") => Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Body::from(encode_metrics())),
        _ => Response::builder().status(StatusCode::NOT_FOUND).body(Body::empty()),
    };
    Ok(resp.unwrap_or_else(|_| Response::new(Body::empty())))
}

/// GET / and /metrics until `shutdown` fires. Bind failure is logged, not fatal.
pub async fn serve_metrics(port: u16, shutdown: CancellationToken) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let builder = match Server::try_bind(&addr) {
        Ok(b) => b,
        Err(e) => {
            error!(%addr, error = %e, "metrics bind failed");
            return;
        }
    };
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
    info!("metrics listening on http://{addr}/ (and /metrics)");

    let server = builder
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
    if let Err(e) = server.await {
        error!(error = %e, "metrics server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_families() {
        init();
        init();
        ADVERSE_FILLS.inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("adverse_fills_total"));
    }
}
