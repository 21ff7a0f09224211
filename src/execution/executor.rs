// =============================================================================
// Executor -- applies triggered signals to the broker and the position book
// =============================================================================
//
// Order translation: a signal with an entry price becomes a limit order,
// otherwise a market order. Retryable broker errors back off exponentially on
// the engine clock (max 3 attempts); fatal errors surface immediately and the
// monitor decides whether the signal reverts to PENDING or expires.
//
// Every outcome is published on `trading:executed:{instrument}`, including
// rejections (status = "rejected").
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bus::{channels, MessageBus};
use crate::clock::Clock;
use crate::engine::decision::PositionAction;
use crate::execution::broker::{BrokerAdapter, BrokerError, OrderResult, OrderSide, OrderType};
use crate::execution::positions::{Position, PositionBook};
use crate::signal::model::Signal;
use crate::types::{PositionSide, TradeAction};

/// Attempts per order, including the first.
const MAX_ATTEMPTS: u32 = 3;
/// Backoff before retry n is `BASE << (n - 1)`.
const BACKOFF_BASE_MS: u64 = 100;

/// What a successful execution did.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReceipt {
    pub order_id: String,
    pub fill_price: f64,
    /// The position opened, increased, or closed.
    pub position_id: Option<String>,
    /// True when the receipt closed a position.
    pub closed_position: bool,
}

/// Event published on `trading:executed:{instrument}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub signal_id: Option<String>,
    pub instrument: String,
    /// "open" | "add" | "close" | "rejected"
    pub kind: String,
    /// "filled" | "rejected"
    pub status: String,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub fill_price: Option<f64>,
    pub quantity: f64,
    #[serde(default)]
    pub position_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    pub ts: i64,
}

pub struct Executor {
    broker: Arc<dyn BrokerAdapter>,
    book: Arc<PositionBook>,
    bus: Arc<MessageBus>,
    clock: Arc<dyn Clock>,
}

impl Executor {
    pub fn new(
        broker: Arc<dyn BrokerAdapter>,
        book: Arc<PositionBook>,
        bus: Arc<MessageBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            broker,
            book,
            bus,
            clock,
        }
    }

    pub fn book(&self) -> &Arc<PositionBook> {
        &self.book
    }

    /// Execute a triggered signal. On success the position set reflects the
    /// signal's `position_action`; on failure an event with
    /// `status = "rejected"` is published and the error returns to the caller.
    pub async fn execute(&self, signal: &Signal) -> Result<ExecutionReceipt, BrokerError> {
        let side = match order_side(signal) {
            Ok(side) => side,
            Err(e) => {
                self.publish_rejected(signal, &e);
                return Err(e);
            }
        };

        let order_type = if signal.entry_price.is_some() {
            OrderType::Limit
        } else {
            OrderType::Market
        };

        let order = match self
            .place_with_retries(&signal.instrument, side, signal.quantity, order_type, signal.entry_price)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                self.publish_rejected(signal, &e);
                return Err(e);
            }
        };

        self.apply_position_action(signal, side, order)
    }

    /// Close a position directly (manual close, stop handling). Idempotent:
    /// an already-closed position returns its final state without touching
    /// the broker.
    pub async fn close_position(
        &self,
        position_id: &str,
        reason: &str,
    ) -> Result<Option<Position>, BrokerError> {
        let Some(open) = self
            .book
            .all_open()
            .into_iter()
            .find(|p| p.position_id == position_id)
        else {
            // Either unknown or already closed; the book's close is
            // idempotent and resolves which.
            return Ok(self
                .book
                .close(position_id, 0.0, reason, None, self.clock.now_ms()));
        };

        let side = match open.side {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        };
        let order = self
            .place_with_retries(&open.instrument, side, open.quantity, OrderType::Market, None)
            .await?;

        let closed = self.book.close(
            position_id,
            order.avg_price,
            reason,
            None,
            self.clock.now_ms(),
        );
        if let Some(pos) = &closed {
            self.publish_close(None, pos, &order);
        }
        Ok(closed)
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn apply_position_action(
        &self,
        signal: &Signal,
        side: OrderSide,
        order: OrderResult,
    ) -> Result<ExecutionReceipt, BrokerError> {
        let now = self.clock.now_ms();
        match signal.position_action {
            PositionAction::OpenNew => {
                let pos_side = match side {
                    OrderSide::Buy => PositionSide::Long,
                    OrderSide::Sell => PositionSide::Short,
                };
                let Some(pos) = self.book.open_position(
                    &signal.instrument,
                    pos_side,
                    signal.quantity,
                    order.avg_price,
                    signal.stop_loss,
                    signal.take_profit,
                    Some(signal.signal_id.clone()),
                    now,
                ) else {
                    let e = BrokerError::Fatal(format!(
                        "position already open for {}",
                        signal.instrument
                    ));
                    self.publish_rejected(signal, &e);
                    return Err(e);
                };
                self.publish_fill(signal, "open", &order, Some(&pos.position_id));
                Ok(ExecutionReceipt {
                    order_id: order.order_id,
                    fill_price: order.avg_price,
                    position_id: Some(pos.position_id),
                    closed_position: false,
                })
            }

            PositionAction::AddToLong | PositionAction::AddToShort => {
                let pos_side = if signal.position_action == PositionAction::AddToLong {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                };
                // The position may have closed between decision and trigger;
                // fall back to opening fresh.
                let pos = self
                    .book
                    .add_to(&signal.instrument, pos_side, signal.quantity, order.avg_price)
                    .or_else(|| {
                        self.book.open_position(
                            &signal.instrument,
                            pos_side,
                            signal.quantity,
                            order.avg_price,
                            signal.stop_loss,
                            signal.take_profit,
                            Some(signal.signal_id.clone()),
                            now,
                        )
                    });
                let Some(pos) = pos else {
                    let e = BrokerError::Fatal(format!(
                        "could not add to {} position for {}",
                        pos_side, signal.instrument
                    ));
                    self.publish_rejected(signal, &e);
                    return Err(e);
                };
                self.publish_fill(signal, "add", &order, Some(&pos.position_id));
                Ok(ExecutionReceipt {
                    order_id: order.order_id,
                    fill_price: order.avg_price,
                    position_id: Some(pos.position_id),
                    closed_position: false,
                })
            }

            PositionAction::CloseLong | PositionAction::CloseShort => {
                let pos_side = if signal.position_action == PositionAction::CloseLong {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                };
                let Some(open) = self.book.find_open(&signal.instrument, pos_side) else {
                    let e = BrokerError::Fatal(format!(
                        "no open {} position for {}",
                        pos_side, signal.instrument
                    ));
                    self.publish_rejected(signal, &e);
                    return Err(e);
                };
                let closed = self.book.close(
                    &open.position_id,
                    order.avg_price,
                    "signal_exit",
                    Some(signal.signal_id.clone()),
                    now,
                );
                let Some(pos) = closed else {
                    let e = BrokerError::Fatal(format!(
                        "position {} vanished during close",
                        open.position_id
                    ));
                    self.publish_rejected(signal, &e);
                    return Err(e);
                };
                self.publish_close(Some(&signal.signal_id), &pos, &order);
                Ok(ExecutionReceipt {
                    order_id: order.order_id,
                    fill_price: order.avg_price,
                    position_id: Some(pos.position_id),
                    closed_position: true,
                })
            }

            PositionAction::None => {
                let e = BrokerError::Fatal("signal carries no position action".to_string());
                self.publish_rejected(signal, &e);
                Err(e)
            }
        }
    }

    async fn place_with_retries(
        &self,
        instrument: &str,
        side: OrderSide,
        quantity: f64,
        order_type: OrderType,
        price: Option<f64>,
    ) -> Result<OrderResult, BrokerError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .broker
                .place_order(instrument, side, quantity, order_type, price)
                .await
            {
                Ok(order) => {
                    info!(
                        instrument,
                        side = %side,
                        quantity,
                        attempt,
                        order_id = %order.order_id,
                        fill_price = order.avg_price,
                        "order placed"
                    );
                    return Ok(order);
                }
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    let delay = Duration::from_millis(BACKOFF_BASE_MS << (attempt - 1));
                    warn!(
                        instrument,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retryable broker error -- backing off"
                    );
                    self.clock.sleep(delay).await;
                }
                Err(e) => {
                    warn!(instrument, attempt, error = %e, "order failed");
                    return Err(e);
                }
            }
        }
    }

    fn publish_fill(
        &self,
        signal: &Signal,
        kind: &str,
        order: &OrderResult,
        position_id: Option<&str>,
    ) {
        self.publish_event(ExecutionEvent {
            signal_id: Some(signal.signal_id.clone()),
            instrument: signal.instrument.clone(),
            kind: kind.to_string(),
            status: "filled".to_string(),
            order_id: Some(order.order_id.clone()),
            fill_price: Some(order.avg_price),
            quantity: signal.quantity,
            position_id: position_id.map(str::to_string),
            reason: None,
            ts: self.clock.now_ms(),
        });
    }

    fn publish_close(&self, signal_id: Option<&str>, position: &Position, order: &OrderResult) {
        self.publish_event(ExecutionEvent {
            signal_id: signal_id.map(str::to_string),
            instrument: position.instrument.clone(),
            kind: "close".to_string(),
            status: "filled".to_string(),
            order_id: Some(order.order_id.clone()),
            fill_price: Some(order.avg_price),
            quantity: position.quantity,
            position_id: Some(position.position_id.clone()),
            reason: position.close_reason.clone(),
            ts: self.clock.now_ms(),
        });
    }

    fn publish_rejected(&self, signal: &Signal, error: &BrokerError) {
        self.publish_event(ExecutionEvent {
            signal_id: Some(signal.signal_id.clone()),
            instrument: signal.instrument.clone(),
            kind: "rejected".to_string(),
            status: "rejected".to_string(),
            order_id: None,
            fill_price: None,
            quantity: signal.quantity,
            position_id: None,
            reason: Some(error.to_string()),
            ts: self.clock.now_ms(),
        });
    }

    fn publish_event(&self, event: ExecutionEvent) {
        if let Ok(json) = serde_json::to_value(&event) {
            self.bus.publish(&channels::executed(&event.instrument), json);
        }
    }
}

/// Broker order side implied by the signal's action and position action.
fn order_side(signal: &Signal) -> Result<OrderSide, BrokerError> {
    match signal.position_action {
        PositionAction::OpenNew => match signal.action {
            TradeAction::Buy => Ok(OrderSide::Buy),
            TradeAction::Sell => Ok(OrderSide::Sell),
            other => Err(BrokerError::Fatal(format!(
                "cannot open a position from action {other}"
            ))),
        },
        PositionAction::AddToLong => Ok(OrderSide::Buy),
        PositionAction::AddToShort => Ok(OrderSide::Sell),
        PositionAction::CloseLong => Ok(OrderSide::Sell),
        PositionAction::CloseShort => Ok(OrderSide::Buy),
        PositionAction::None => Err(BrokerError::Fatal(
            "signal carries no position action".to_string(),
        )),
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("book", &self.book)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::IdSource;
    use crate::execution::broker::PaperBroker;
    use crate::market_data::Tick;
    use crate::signal::condition::{CmpOp, Condition};
    use crate::signal::model::SignalStatus;
    use crate::store::{keys, TickStore};
    use crate::types::Timeframe;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Wall clock whose sleeps return immediately, so retry tests are fast.
    struct InstantClock;

    #[async_trait]
    impl Clock for InstantClock {
        fn now_ms(&self) -> i64 {
            1_700_000_000_000
        }
        async fn sleep(&self, _duration: Duration) {}
    }

    struct FlakyBroker {
        inner: PaperBroker,
        failures_left: AtomicU32,
        attempts: AtomicU32,
        fatal: bool,
    }

    #[async_trait]
    impl BrokerAdapter for FlakyBroker {
        async fn place_order(
            &self,
            instrument: &str,
            side: OrderSide,
            quantity: f64,
            order_type: OrderType,
            price: Option<f64>,
        ) -> Result<OrderResult, BrokerError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return if self.fatal {
                    Err(BrokerError::Fatal("margin exhausted".into()))
                } else {
                    Err(BrokerError::Retryable("gateway timeout".into()))
                };
            }
            self.inner
                .place_order(instrument, side, quantity, order_type, price)
                .await
        }

        async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
            self.inner.cancel_order(order_id).await
        }

        async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
            self.inner.positions().await
        }
    }

    fn store_with_price(instrument: &str, price: f64) -> Arc<TickStore> {
        let store = Arc::new(TickStore::new());
        let tick = Tick {
            instrument: instrument.to_string(),
            ts: 1_000,
            last_price: price,
            volume: 1.0,
            bid: None,
            ask: None,
            oi: None,
        };
        store.put(&keys::tick_latest(instrument), &tick).unwrap();
        store
    }

    fn executor_with(
        store: Arc<TickStore>,
        broker: Arc<dyn BrokerAdapter>,
    ) -> (Executor, Arc<MessageBus>, Arc<PositionBook>) {
        let bus = Arc::new(MessageBus::default());
        let book = Arc::new(PositionBook::new(store, IdSource::replay(5)));
        let exec = Executor::new(broker, book.clone(), bus.clone(), Arc::new(InstantClock));
        (exec, bus, book)
    }

    fn market_signal(action: TradeAction, position_action: PositionAction) -> Signal {
        Signal {
            signal_id: "sig-1".into(),
            instrument: "NIFTY".into(),
            action,
            status: SignalStatus::Triggered,
            confidence: 0.8,
            condition: Condition::price(CmpOp::Ge, 105.0),
            timeframe: Timeframe::M5,
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            quantity: 2.0,
            position_action,
            created_at: 0,
            expires_at: i64::MAX,
            triggered_at: None,
            trigger_snapshot: None,
            position_id: None,
            reason: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn open_new_creates_position_at_market_fill() {
        let store = store_with_price("NIFTY", 106.0);
        let ids = IdSource::replay(9);
        let broker = Arc::new(PaperBroker::new(store.clone(), ids));
        let (exec, bus, book) = executor_with(store, broker);
        let mut events = bus.subscribe("trading:executed:*");

        let receipt = exec
            .execute(&market_signal(TradeAction::Buy, PositionAction::OpenNew))
            .await
            .unwrap();

        assert_eq!(receipt.fill_price, 106.0);
        let pos = book.find_open("NIFTY", PositionSide::Long).unwrap();
        assert_eq!(pos.entry_price, 106.0);
        assert_eq!(pos.opening_signal_id.as_deref(), Some("sig-1"));

        let env = events.try_recv().unwrap();
        let event: ExecutionEvent = serde_json::from_value((*env.payload).clone()).unwrap();
        assert_eq!(event.kind, "open");
        assert_eq!(event.status, "filled");
    }

    #[tokio::test]
    async fn add_to_long_reuses_open_position() {
        let store = store_with_price("NIFTY", 110.0);
        let broker = Arc::new(PaperBroker::new(store.clone(), IdSource::replay(9)));
        let (exec, _bus, book) = executor_with(store, broker);

        book.open_position("NIFTY", PositionSide::Long, 2.0, 100.0, None, None, None, 0)
            .unwrap();

        let mut sig = market_signal(TradeAction::Buy, PositionAction::AddToLong);
        sig.quantity = 2.0;
        let receipt = exec.execute(&sig).await.unwrap();
        assert!(!receipt.closed_position);

        let pos = book.find_open("NIFTY", PositionSide::Long).unwrap();
        assert_eq!(pos.quantity, 4.0);
        assert!((pos.avg_price - 105.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn close_long_realizes_and_links_signal() {
        let store = store_with_price("NIFTY", 120.0);
        let broker = Arc::new(PaperBroker::new(store.clone(), IdSource::replay(9)));
        let (exec, bus, book) = executor_with(store, broker);
        let mut events = bus.subscribe("trading:executed:NIFTY");

        book.open_position("NIFTY", PositionSide::Long, 1.0, 100.0, None, None, None, 0)
            .unwrap();

        let sig = market_signal(TradeAction::Exit, PositionAction::CloseLong);
        let receipt = exec.execute(&sig).await.unwrap();
        assert!(receipt.closed_position);
        assert_eq!(book.open_count(), 0);

        let closed = book.closed_recent(1).pop().unwrap();
        assert!((closed.realized_pnl - 20.0).abs() < 1e-12);
        assert_eq!(closed.closing_signal_id.as_deref(), Some("sig-1"));

        let env = events.try_recv().unwrap();
        let event: ExecutionEvent = serde_json::from_value((*env.payload).clone()).unwrap();
        assert_eq!(event.kind, "close");
    }

    #[tokio::test]
    async fn retryable_errors_back_off_then_succeed() {
        let store = store_with_price("NIFTY", 106.0);
        let flaky = Arc::new(FlakyBroker {
            inner: PaperBroker::new(store.clone(), IdSource::replay(9)),
            failures_left: AtomicU32::new(2),
            attempts: AtomicU32::new(0),
            fatal: false,
        });
        let (exec, _bus, _book) = executor_with(store, flaky.clone());

        let receipt = exec
            .execute(&market_signal(TradeAction::Buy, PositionAction::OpenNew))
            .await
            .unwrap();
        assert_eq!(receipt.fill_price, 106.0);
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_exhaust_after_max_attempts() {
        let store = store_with_price("NIFTY", 106.0);
        let flaky = Arc::new(FlakyBroker {
            inner: PaperBroker::new(store.clone(), IdSource::replay(9)),
            failures_left: AtomicU32::new(10),
            attempts: AtomicU32::new(0),
            fatal: false,
        });
        let (exec, bus, _book) = executor_with(store, flaky.clone());
        let mut events = bus.subscribe("trading:executed:*");

        let err = exec
            .execute(&market_signal(TradeAction::Buy, PositionAction::OpenNew))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);

        let env = events.try_recv().unwrap();
        let event: ExecutionEvent = serde_json::from_value((*env.payload).clone()).unwrap();
        assert_eq!(event.status, "rejected");
    }

    #[tokio::test]
    async fn fatal_errors_do_not_retry() {
        let store = store_with_price("NIFTY", 106.0);
        let flaky = Arc::new(FlakyBroker {
            inner: PaperBroker::new(store.clone(), IdSource::replay(9)),
            failures_left: AtomicU32::new(10),
            attempts: AtomicU32::new(0),
            fatal: true,
        });
        let (exec, _bus, _book) = executor_with(store, flaky.clone());

        let err = exec
            .execute(&market_signal(TradeAction::Buy, PositionAction::OpenNew))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_position_is_idempotent() {
        let store = store_with_price("NIFTY", 105.0);
        let broker = Arc::new(PaperBroker::new(store.clone(), IdSource::replay(9)));
        let (exec, _bus, book) = executor_with(store, broker);

        let pos = book
            .open_position("NIFTY", PositionSide::Long, 1.0, 100.0, None, None, None, 0)
            .unwrap();

        let first = exec
            .close_position(&pos.position_id, "manual")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.close_price, Some(105.0));

        let second = exec
            .close_position(&pos.position_id, "manual-again")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, second);
    }
}
