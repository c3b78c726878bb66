// ===============================
// src/gateway.rs
// ===============================
//
// Execution gateway in front of a broker collaborator.
// - pre_position_order : stage a GTC order ahead of the signal
// - execute_order_fast : fire the staged order if one exists (single remove
//                        under the lock), else submit IOC directly
// Latency is measured in microseconds with a monotonic clock. No retries here.
//
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::domain::{now_ms, Order, OrderType, Side, TimeInForce};
use crate::metrics::{EXEC_LATENCY_US, ORDERS, PRE_POSITIONED};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerAck {
    pub broker_order_id: String,
    pub client_order_id: String,
    pub accepted_ts_ms: i64,
    /// Present when the broker reports an immediate fill.
    pub filled_price: Option<f64>,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn execute_order(&self, order: &Order) -> Result<BrokerAck, BrokerError>;
    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError>;
}

/// Paper venue: acks after `fill_delay`, fills at the limit price when given.
pub struct MockBroker {
    fill_delay: Duration,
    reject: AtomicBool,
    submitted: AtomicU64,
    cancelled: AtomicU64,
}

impl MockBroker {
    pub fn new(fill_delay: Duration) -> Self {
        Self {
            fill_delay,
            reject: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    pub fn set_reject(&self, on: bool) { self.reject.store(on, Ordering::Relaxed) }
    pub fn submitted(&self) -> u64 { self.submitted.load(Ordering::Relaxed) }
    pub fn cancelled(&self) -> u64 { self.cancelled.load(Ordering::Relaxed) }
}

#[async_trait]
impl Broker for MockBroker {
    async fn execute_order(&self, order: &Order) -> Result<BrokerAck, BrokerError> {
        if !self.fill_delay.is_zero() {
            sleep(self.fill_delay).await;
        }
        if self.reject.load(Ordering::Relaxed) {
            return Err(BrokerError::Rejected(format!("mock reject {}", order.id)));
        }
        let n = self.submitted.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(BrokerAck {
            broker_order_id: format!("MOCK-{n}"),
            client_order_id: order.id.clone(),
            accepted_ts_ms: now_ms(),
            filled_price: order.limit_price,
        })
    }

    async fn cancel_order(&self, _broker_order_id: &str) -> Result<(), BrokerError> {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMethod {
    #[serde(rename = "pre-positioned")]
    PrePositioned,
    Direct,
}

impl ExecMethod {
    pub fn as_str(&self) -> &'static str {
        match self { ExecMethod::PrePositioned => "pre-positioned", ExecMethod::Direct => "direct" }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub method: ExecMethod,
    pub order: Order,
    pub ack: BrokerAck,
    pub elapsed_us: u64,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("broker error after {elapsed_us}us: {source}")]
    Broker { source: BrokerError, elapsed_us: u64 },
    #[error("broker timed out after {elapsed_us}us")]
    Timeout { elapsed_us: u64 },
}

impl GatewayError {
    pub fn elapsed_us(&self) -> u64 {
        match self {
            GatewayError::Broker { elapsed_us, .. } | GatewayError::Timeout { elapsed_us } => *elapsed_us,
        }
    }
}

type StageKey = (String, Side, OrderType);

#[derive(Debug, Clone)]
struct Staged {
    order: Order,
    ack: BrokerAck,
}

pub struct ExecutionGateway {
    broker: Arc<dyn Broker>,
    staged: Mutex<HashMap<StageKey, Staged>>,
    broker_timeout: Duration,
}

fn new_client_id() -> String {
    format!("CL-{}-{}", now_ms(), rand::thread_rng().gen::<u32>())
}

fn elapsed_us(start: Instant) -> u64 { start.elapsed().as_micros() as u64 }

impl ExecutionGateway {
    pub fn new(broker: Arc<dyn Broker>, broker_timeout: Duration) -> Self {
        Self { broker, staged: Mutex::new(HashMap::new()), broker_timeout }
    }

    async fn submit(&self, order: &Order, method: ExecMethod, start: Instant) -> Result<BrokerAck, GatewayError> {
        let res = timeout(self.broker_timeout, self.broker.execute_order(order)).await;
        let us = elapsed_us(start);
        match res {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(source)) => {
                ORDERS.with_label_values(&[method.as_str(), "rejected"]).inc();
                warn!(order_id = %order.id, symbol = %order.symbol, error = %source, elapsed_us = us, "order rejected");
                Err(GatewayError::Broker { source, elapsed_us: us })
            }
            Err(_) => {
                ORDERS.with_label_values(&[method.as_str(), "timeout"]).inc();
                warn!(order_id = %order.id, symbol = %order.symbol, elapsed_us = us, "broker timeout");
                Err(GatewayError::Timeout { elapsed_us: us })
            }
        }
    }

    /// Stage a GTC order (limit if a price is given, else market). Replaces any
    /// standing order for the same (symbol, side, type).
    pub async fn pre_position_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        limit_price: Option<f64>,
    ) -> Result<BrokerAck, GatewayError> {
        let order_type = if limit_price.is_some() { OrderType::Limit } else { OrderType::Market };
        let order = Order {
            id: new_client_id(),
            ts_ms: now_ms(),
            symbol: symbol.to_string(),
            side,
            qty,
            order_type,
            time_in_force: TimeInForce::Gtc,
            limit_price,
        };

        let start = Instant::now();
        let ack = self.submit(&order, ExecMethod::PrePositioned, start).await?;

        let key = (symbol.to_string(), side, order_type);
        let (replaced, n) = {
            let mut staged = self.staged.lock();
            let old = staged.insert(key, Staged { order: order.clone(), ack: ack.clone() });
            (old, staged.len())
        };
        PRE_POSITIONED.set(n as i64);
        info!(symbol, side = side.as_str(), order_type = order_type.as_str(), qty, order_id = %order.id, "order pre-positioned");

        if let Some(old) = replaced {
            warn!(symbol, side = side.as_str(), old_order = %old.order.id, new_order = %order.id, "standing order replaced");
            self.cancel_quietly(&old.ack.broker_order_id).await;
        }
        Ok(ack)
    }

    /// Fire the staged order for the key if present, else submit IOC now.
    pub async fn execute_order_fast(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        order_type: OrderType,
    ) -> Result<ExecutionResult, GatewayError> {
        let start = Instant::now();

        let hit = {
            let mut staged = self.staged.lock();
            let hit = staged.remove(&(symbol.to_string(), side, order_type));
            PRE_POSITIONED.set(staged.len() as i64);
            hit
        };
        if let Some(Staged { order, ack }) = hit {
            let us = elapsed_us(start);
            if (order.qty - qty).abs() > f64::EPSILON {
                debug!(symbol, staged_qty = order.qty, requested_qty = qty, "staged qty differs from request");
            }
            ORDERS.with_label_values(&[ExecMethod::PrePositioned.as_str(), "ok"]).inc();
            EXEC_LATENCY_US.with_label_values(&[ExecMethod::PrePositioned.as_str()]).observe(us as f64);
            info!(symbol, side = side.as_str(), order_id = %order.id, elapsed_us = us, "pre-positioned order fired");
            return Ok(ExecutionResult { method: ExecMethod::PrePositioned, order, ack, elapsed_us: us });
        }

        let order = Order {
            id: new_client_id(),
            ts_ms: now_ms(),
            symbol: symbol.to_string(),
            side,
            qty,
            order_type,
            time_in_force: TimeInForce::Ioc,
            limit_price: None,
        };
        let ack = self.submit(&order, ExecMethod::Direct, start).await?;
        let us = elapsed_us(start);
        ORDERS.with_label_values(&[ExecMethod::Direct.as_str(), "ok"]).inc();
        EXEC_LATENCY_US.with_label_values(&[ExecMethod::Direct.as_str()]).observe(us as f64);
        info!(symbol, side = side.as_str(), order_id = %order.id, elapsed_us = us, "direct order executed");
        Ok(ExecutionResult { method: ExecMethod::Direct, order, ack, elapsed_us: us })
    }

    pub fn pre_positioned_count(&self) -> usize { self.staged.lock().len() }

    /// Cancel every standing order (shutdown path). Returns how many were drained.
    pub async fn drain_pre_positioned(&self) -> usize {
        let drained: Vec<Staged> = {
            let mut staged = self.staged.lock();
            staged.drain().map(|(_, s)| s).collect()
        };
        PRE_POSITIONED.set(0);
        for s in &drained {
            self.cancel_quietly(&s.ack.broker_order_id).await;
        }
        if !drained.is_empty() {
            info!(n = drained.len(), "pre-positioned orders drained");
        }
        drained.len()
    }

    async fn cancel_quietly(&self, broker_order_id: &str) {
        match timeout(self.broker_timeout, self.broker.cancel_order(broker_order_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(broker_order_id, error = %e, "cancel failed"),
            Err(_) => warn!(broker_order_id, "cancel timed out"),
        }
    }
}
