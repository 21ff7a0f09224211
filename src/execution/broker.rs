// =============================================================================
// Broker adapter -- the boundary to the (paper or live) order endpoint
// =============================================================================
//
// Errors carry their retry class: network/5xx style failures are `Retryable`
// and the executor backs off and retries them; validation/funds failures are
// `Fatal` and surface immediately.
//
// The paper broker is deterministic: market orders fill at the latest stored
// tick price, limit orders at their limit price, no slippage model. A live
// adapter implements the same trait out of tree.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::clock::IdSource;
use crate::execution::positions::Position;
use crate::market_data::Tick;
use crate::store::{keys, TickStore};

/// Broker failure, classified for the retry policy.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    /// Network / upstream 5xx: worth retrying with backoff.
    #[error("retryable broker error: {0}")]
    Retryable(String),
    /// Validation, auth, insufficient margin: retrying cannot help.
    #[error("fatal broker error: {0}")]
    Fatal(String),
}

impl BrokerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

/// Successful order placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub status: String,
    pub avg_price: f64,
}

/// The order endpoint the executor talks to.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn place_order(
        &self,
        instrument: &str,
        side: OrderSide,
        quantity: f64,
        order_type: OrderType,
        price: Option<f64>,
    ) -> Result<OrderResult, BrokerError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;

    async fn positions(&self) -> Result<Vec<Position>, BrokerError>;
}

// =============================================================================
// PaperBroker
// =============================================================================

/// Simulated broker for paper mode.
pub struct PaperBroker {
    store: Arc<TickStore>,
    ids: Arc<IdSource>,
    fills: AtomicU64,
}

impl PaperBroker {
    pub fn new(store: Arc<TickStore>, ids: Arc<IdSource>) -> Self {
        Self {
            store,
            ids,
            fills: AtomicU64::new(0),
        }
    }

    pub fn fill_count(&self) -> u64 {
        self.fills.load(Ordering::Relaxed)
    }

    fn market_price(&self, instrument: &str) -> Option<f64> {
        self.store
            .get::<Tick>(&keys::tick_latest(instrument))
            .map(|t| t.last_price)
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    async fn place_order(
        &self,
        instrument: &str,
        side: OrderSide,
        quantity: f64,
        order_type: OrderType,
        price: Option<f64>,
    ) -> Result<OrderResult, BrokerError> {
        if quantity <= 0.0 {
            return Err(BrokerError::Fatal(format!(
                "invalid quantity {quantity} for {instrument}"
            )));
        }

        let fill_price = match order_type {
            OrderType::Limit => price.ok_or_else(|| {
                BrokerError::Fatal(format!("limit order for {instrument} without a price"))
            })?,
            OrderType::Market => self.market_price(instrument).ok_or_else(|| {
                BrokerError::Fatal(format!("no market price known for {instrument}"))
            })?,
        };

        if !fill_price.is_finite() || fill_price <= 0.0 {
            return Err(BrokerError::Fatal(format!(
                "degenerate fill price {fill_price} for {instrument}"
            )));
        }

        self.fills.fetch_add(1, Ordering::Relaxed);
        let order_id = self.ids.next_id("ord");
        info!(
            order_id = %order_id,
            instrument,
            side = %side,
            quantity,
            fill_price,
            "paper fill"
        );

        Ok(OrderResult {
            order_id,
            status: "FILLED".to_string(),
            avg_price: fill_price,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        // Paper orders fill instantly; cancellation is a no-op.
        debug!(order_id, "paper cancel (no-op)");
        Ok(())
    }

    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        // The engine's position book is authoritative in paper mode.
        Ok(Vec::new())
    }
}

impl std::fmt::Debug for PaperBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperBroker")
            .field("fills", &self.fill_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn broker_with_price(instrument: &str, price: f64) -> PaperBroker {
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
        PaperBroker::new(store, IdSource::replay(3))
    }

    #[tokio::test]
    async fn market_order_fills_at_last_tick() {
        let broker = broker_with_price("NIFTY", 106.0);
        let result = broker
            .place_order("NIFTY", OrderSide::Buy, 1.0, OrderType::Market, None)
            .await
            .unwrap();
        assert_eq!(result.avg_price, 106.0);
        assert_eq!(result.status, "FILLED");
        assert_eq!(broker.fill_count(), 1);
    }

    #[tokio::test]
    async fn limit_order_fills_at_limit() {
        let broker = broker_with_price("NIFTY", 106.0);
        let result = broker
            .place_order("NIFTY", OrderSide::Sell, 2.0, OrderType::Limit, Some(107.5))
            .await
            .unwrap();
        assert_eq!(result.avg_price, 107.5);
    }

    #[tokio::test]
    async fn market_order_without_price_is_fatal() {
        let store = Arc::new(TickStore::new());
        let broker = PaperBroker::new(store, IdSource::replay(1));
        let err = broker
            .place_order("NIFTY", OrderSide::Buy, 1.0, OrderType::Market, None)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn limit_order_without_price_is_fatal() {
        let broker = broker_with_price("NIFTY", 106.0);
        let err = broker
            .place_order("NIFTY", OrderSide::Buy, 1.0, OrderType::Limit, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Fatal(_)));
    }

    #[tokio::test]
    async fn zero_quantity_is_fatal() {
        let broker = broker_with_price("NIFTY", 106.0);
        let err = broker
            .place_order("NIFTY", OrderSide::Buy, 0.0, OrderType::Market, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Fatal(_)));
    }

    #[test]
    fn error_classification() {
        assert!(BrokerError::Retryable("timeout".into()).is_retryable());
        assert!(!BrokerError::Fatal("margin".into()).is_retryable());
    }
}
