// ===============================
// src/main.rs
// ===============================
/*
 # live tunables and feed health
 curl -s localhost:9898/metrics | egrep '^config_param|^feed_(connected|disabled)'

 # execution quality
 curl -s localhost:9898/metrics | egrep '^(slippage_bps|adverse_fills_total|exec_latency_us)'
*/
/*
=============================================================================
Project : tradeloop, trading telemetry & adaptive-control core in Rust
Version : 0.5.0
License : MIT (see LICENSE)
=============================================================================
*/
use clap::Parser;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tradeloop::app::Services;
use tradeloop::config::{self, Cli};

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config ----
    let cli = Cli::parse();
    let args = match config::load(&cli) {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };
    let heartbeat = args.heartbeat;
    let equity_interval = args.equity_interval;

    let services = Services::init(args).await;
    services.note("startup");

    // ---- Heartbeat until ctrl-c ----
    let mut tick = interval(heartbeat);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut snap = interval(equity_interval);
    snap.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_count: u64 = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tick.tick() => {
                let lat = services.feed.latency_stats();
                let slip = services.quality.stats();
                let learning = services.controller.state();
                info!(
                    ticks = lat.global.count - last_count,
                    latency_avg_ms = lat.global.avg_ms,
                    latency_max_ms = lat.global.max_ms,
                    feeds = ?services.feed.feed_states(),
                    fills = slip.count,
                    slippage_avg_bps = slip.avg_bps,
                    staged_orders = services.gateway.pre_positioned_count(),
                    learning_cycles = learning.total_cycles,
                    "heartbeat"
                );
                last_count = lat.global.count;
            }
            _ = snap.tick() => {
                if let Err(e) = services.snapshot_equity().await {
                    warn!(error = %e, "equity snapshot failed");
                }
            }
        }
    }

    services.note("shutdown");
    services.shutdown().await;
}
