// ===============================
// src/app.rs
// ===============================
//
// Service graph. Everything is built here and torn down in `shutdown`;
// nothing starts at import time.
//
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Args;
use crate::controller::AdaptiveController;
use crate::domain::{EquitySnapshot, Event};
use crate::feed::{FeedEvent, MarketDataIngestor};
use crate::gateway::{ExecutionGateway, MockBroker};
use crate::metrics::{self, CONFIG_SYMBOL};
use crate::performance::{PerformanceEvaluator, PerformanceReport, Thresholds};
use crate::posttrade::{self, ExecutionQualityTracker, Fill};
use crate::recorder;
use crate::store::{MemoryTradeStore, StoreError, TradeStore};

/// One tick in N goes to the journal.
const TICK_SAMPLE_EVERY: u64 = 100;

pub struct Services {
    pub args: Args,
    pub store: Arc<MemoryTradeStore>,
    pub feed: Arc<MarketDataIngestor>,
    pub gateway: Arc<ExecutionGateway>,
    pub quality: Arc<ExecutionQualityTracker>,
    pub evaluator: PerformanceEvaluator,
    pub controller: Arc<AdaptiveController>,
    fills: mpsc::Sender<Fill>,
    rec_tx: mpsc::Sender<Event>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    recorder: Option<JoinHandle<()>>,
}

impl Services {
    pub async fn init(args: Args) -> Self {
        metrics::init();
        for s in &args.symbols {
            CONFIG_SYMBOL.with_label_values(&[s.as_str()]).set(1);
        }
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        // ---- Recorder (optional) ----
        let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
        let recorder = args
            .record_file
            .clone()
            .map(|path| tokio::spawn(recorder::run(rec_rx, path)));

        // ---- Store / quality / gateway ----
        let store = Arc::new(MemoryTradeStore::new(args.starting_equity).with_journal(rec_tx.clone()));
        let quality = Arc::new(ExecutionQualityTracker::default());
        let (fills, fill_rx) = mpsc::channel::<Fill>(4096);
        tasks.push(tokio::spawn(posttrade::run(quality.clone(), fill_rx, rec_tx.clone())));

        let broker = Arc::new(MockBroker::new(args.mock_fill));
        let gateway = Arc::new(ExecutionGateway::new(broker, args.broker_timeout));

        // ---- Feed ----
        let feed = Arc::new(MarketDataIngestor::new(args.feed.clone()));
        tasks.push(tokio::spawn(sample_ticks(feed.subscribe(), rec_tx.clone(), shutdown.clone())));
        if args.feed_enabled {
            feed.start(&args.symbols);
        } else {
            info!("feed disabled (--no-feed)");
        }

        // ---- Controller ----
        let controller = Arc::new(
            AdaptiveController::new(store.clone(), args.controller.clone(), args.strategy.clone()).await,
        );
        controller.spawn();

        // ---- Metrics ----
        tasks.push(tokio::spawn(metrics::serve_metrics(args.metrics_port, shutdown.clone())));

        info!(
            symbols = ?args.symbols,
            metrics_port = args.metrics_port,
            feed = args.feed_enabled,
            record_file = ?args.record_file,
            state_file = ?args.controller.state_path,
            "services up"
        );

        Self {
            evaluator: PerformanceEvaluator::new(Thresholds::default(), args.starting_equity),
            args,
            store,
            feed,
            gateway,
            quality,
            controller,
            fills,
            rec_tx,
            shutdown,
            tasks,
            recorder,
        }
    }

    /// Hand a fill to the execution-quality task.
    pub fn report_fill(&self, fill: Fill) {
        if self.fills.try_send(fill).is_err() {
            warn!("fill channel full, fill dropped");
        }
    }

    pub async fn performance_report(&self, days: Option<u32>) -> Result<PerformanceReport, StoreError> {
        self.evaluator.evaluate(self.store.as_ref(), days).await
    }

    /// Append the current balance to the equity curve.
    pub async fn snapshot_equity(&self) -> Result<(), StoreError> {
        let summary = self.store.portfolio_summary().await?;
        self.store
            .log_equity(EquitySnapshot { timestamp: Utc::now(), equity: summary.current_balance })
            .await
    }

    pub fn note(&self, msg: impl Into<String>) {
        let _ = self.rec_tx.try_send(Event::Note(msg.into()));
    }

    pub async fn shutdown(self) {
        info!("shutting down");
        self.feed.stop().await;
        self.controller.shutdown().await;
        let drained = self.gateway.drain_pre_positioned().await;
        self.shutdown.cancel();

        let Services { fills, rec_tx, tasks, recorder, store, controller, .. } = self;
        drop(fills);
        drop(rec_tx);
        for t in tasks {
            let _ = timeout(Duration::from_secs(2), t).await;
        }
        // the store and controller hold the last journal senders
        drop(controller);
        drop(store);
        if let Some(r) = recorder {
            if timeout(Duration::from_secs(2), r).await.is_err() {
                warn!("recorder did not finish in time");
            }
        }
        info!(drained_orders = drained, "shutdown complete");
    }
}

async fn sample_ticks(
    mut rx: broadcast::Receiver<FeedEvent>,
    rec_tx: mpsc::Sender<Event>,
    shutdown: CancellationToken,
) {
    let mut n: u64 = 0;
    loop {
        let ev = tokio::select! {
            _ = shutdown.cancelled() => break,
            ev = rx.recv() => ev,
        };
        match ev {
            Ok(FeedEvent::Tick(t)) => {
                n += 1;
                if n % TICK_SAMPLE_EVERY == 1 {
                    let _ = rec_tx.try_send(Event::Tick(t));
                }
            }
            Ok(FeedEvent::Disabled(v)) => {
                let _ = rec_tx.try_send(Event::Note(format!("feed {} disabled", v.as_str())));
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(k)) => warn!(skipped = k, "tick sampler lagged"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
