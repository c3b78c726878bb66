use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tradeloop::domain::{ExitReason, OrderType, Side, Trade};
use tradeloop::gateway::{ExecMethod, ExecutionGateway, MockBroker};
use tradeloop::performance::{PerformanceEvaluator, Recommendation};
use tradeloop::posttrade::{ExecutionQualityTracker, Fill};
use tradeloop::store::{MemoryTradeStore, TradeStore};

#[tokio::test]
async fn execution_feeds_quality_and_performance() {
    let broker = Arc::new(MockBroker::new(Duration::ZERO));
    let gateway = ExecutionGateway::new(broker.clone(), Duration::from_secs(1));
    let quality = ExecutionQualityTracker::default();
    let store = MemoryTradeStore::default();

    // Signal expects 100.00, order was staged at 100.60.
    gateway.pre_position_order("AAPL", Side::Buy, 10.0, Some(100.6)).await.unwrap();
    let exec = gateway.execute_order_fast("AAPL", Side::Buy, 10.0, OrderType::Limit).await.unwrap();
    assert_eq!(exec.method, ExecMethod::PrePositioned);

    let filled = exec.ack.filled_price.unwrap();
    let rec = quality
        .record(&Fill {
            symbol: "AAPL".into(),
            side: Side::Buy,
            qty: exec.order.qty,
            expected_price: Some(100.0),
            filled_price: Some(filled),
            strategy: "mr".into(),
        })
        .unwrap();
    assert!((rec.slippage_bps - 60.0).abs() < 1e-6);
    assert_eq!(rec.slippage_dollars, 6.0);
    assert!(rec.is_adverse);
    assert_eq!(quality.stats_by_strategy()["mr"].adverse_count, 1);

    let entry_time = Utc::now() - ChronoDuration::hours(1);
    let trade = Trade::open(exec.order.id.clone(), "AAPL", Side::Buy, 10.0, filled, "mr", entry_time).unwrap();
    store.log_trade(trade).await.unwrap();
    let closed = store.close_trade(&exec.order.id, 102.6, Utc::now(), ExitReason::TakeProfit).await.unwrap();
    assert_eq!(closed.pnl, Some(20.0));

    let report = PerformanceEvaluator::default().evaluate(&store, None).await.unwrap();
    assert_eq!(report.trades.total_trades, 1);
    assert_eq!(report.trades.win_rate, 100.0);
    assert!(!report.verdict.ready);
    assert_ne!(report.verdict.recommendation, Recommendation::GoLive);
    assert!(report.verdict.issues.iter().any(|i| i.contains("closed trades")));
}

#[tokio::test]
async fn direct_orders_still_measure_latency() {
    let broker = Arc::new(MockBroker::new(Duration::from_millis(5)));
    let gateway = ExecutionGateway::new(broker.clone(), Duration::from_secs(1));
    let exec = gateway.execute_order_fast("BTCUSDT", Side::Sell, 0.5, OrderType::Market).await.unwrap();
    assert_eq!(exec.method, ExecMethod::Direct);
    assert!(exec.elapsed_us >= 5_000);
    assert_eq!(broker.submitted(), 1);
}
