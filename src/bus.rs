// =============================================================================
// Message Bus -- in-process pub/sub over colon-segmented channels
// =============================================================================
//
// Publish is non-blocking: each subscriber owns a bounded FIFO queue and a
// slow subscriber loses messages (per-subscriber drop counter) instead of
// stalling the publisher. There is no persistence; publishing to a channel
// nobody subscribes to is a no-op observable only through a counter.
//
// Pattern grammar (colon-segmented glob):
//   `market:tick:*`   -- `*` matches exactly one segment
//   `indicators:**`   -- `**` matches one or more trailing segments
//
// Each delivered envelope carries a per-subscription `seq` starting at 1 and
// strictly increasing, so consumers can detect gaps caused by drops.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::Timeframe;

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

// =============================================================================
// Channel names (bit-stable, see the wire contract)
// =============================================================================

pub mod channels {
    use super::Timeframe;

    pub fn tick(instrument: &str) -> String {
        format!("market:tick:{instrument}")
    }

    pub fn ohlc(instrument: &str, tf: Timeframe) -> String {
        format!("market:ohlc:{instrument}:{tf}")
    }

    pub fn indicators(instrument: &str, tf: Timeframe) -> String {
        format!("indicators:{instrument}:{tf}")
    }

    pub fn signal(instrument: &str) -> String {
        format!("engine:signal:{instrument}")
    }

    pub fn signal_triggered(instrument: &str) -> String {
        format!("engine:signal:triggered:{instrument}")
    }

    pub fn decision(instrument: &str) -> String {
        format!("engine:decision:{instrument}")
    }

    pub fn executed(instrument: &str) -> String {
        format!("trading:executed:{instrument}")
    }
}

// =============================================================================
// Pattern matching
// =============================================================================

/// Match a colon-segmented glob against a concrete channel name.
///
/// `*` consumes exactly one segment; `**` (only meaningful as the final
/// pattern segment) consumes one or more remaining segments.
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    let pat: Vec<&str> = pattern.split(':').collect();
    let chan: Vec<&str> = channel.split(':').collect();

    let mut pi = 0;
    let mut ci = 0;
    while pi < pat.len() {
        match pat[pi] {
            "**" => {
                // Trailing multi-segment wildcard: needs at least one segment left.
                return pi == pat.len() - 1 && ci < chan.len();
            }
            "*" => {
                if ci >= chan.len() {
                    return false;
                }
                ci += 1;
            }
            lit => {
                if ci >= chan.len() || chan[ci] != lit {
                    return false;
                }
                ci += 1;
            }
        }
        pi += 1;
    }
    ci == chan.len()
}

// =============================================================================
// Envelope & Subscription
// =============================================================================

/// One delivered message.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub channel: Arc<str>,
    /// Per-subscription sequence number, starting at 1.
    pub seq: u64,
    pub payload: Arc<Value>,
}

/// Receiving half of a subscription. Dropping the subscription (or calling
/// [`MessageBus::unsubscribe`]) ends delivery.
pub struct Subscription {
    pub id: u64,
    pub pattern: String,
    rx: mpsc::Receiver<Envelope>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Receive the next envelope; `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Number of messages dropped because this subscriber's queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("dropped", &self.dropped())
            .finish()
    }
}

// =============================================================================
// MessageBus
// =============================================================================

struct SubscriberSlot {
    id: u64,
    pattern: String,
    tx: mpsc::Sender<Envelope>,
    seq: AtomicU64,
    dropped: Arc<AtomicU64>,
}

/// The in-process broker. Cheap to share via `Arc`.
pub struct MessageBus {
    slots: RwLock<Vec<SubscriberSlot>>,
    next_id: AtomicU64,
    queue_capacity: usize,

    // Counters exposed for observability.
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    unrouted: AtomicU64,
}

impl MessageBus {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            unrouted: AtomicU64::new(0),
        }
    }

    /// Subscribe to all channels matching `pattern`.
    pub fn subscribe(&self, pattern: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let dropped = Arc::new(AtomicU64::new(0));

        self.slots.write().push(SubscriberSlot {
            id,
            pattern: pattern.to_string(),
            tx,
            seq: AtomicU64::new(0),
            dropped: dropped.clone(),
        });

        debug!(id, pattern, "bus subscription created");
        Subscription {
            id,
            pattern: pattern.to_string(),
            rx,
            dropped,
        }
    }

    /// Remove a subscription. Idempotent; after this returns no further
    /// envelope will be enqueued for it (already-queued messages drain and
    /// then `recv` yields `None`).
    pub fn unsubscribe(&self, sub: &Subscription) {
        self.unsubscribe_id(sub.id);
    }

    /// Remove a subscription by id (for callers that moved the receiving
    /// half into a task). Idempotent.
    pub fn unsubscribe_id(&self, id: u64) {
        self.slots.write().retain(|s| s.id != id);
        debug!(id, "bus subscription removed");
    }

    /// Publish `payload` on `channel`. Never blocks; returns the number of
    /// subscribers the message was actually delivered to.
    pub fn publish(&self, channel: &str, payload: Value) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);

        let channel: Arc<str> = Arc::from(channel);
        let payload = Arc::new(payload);

        let mut delivered = 0usize;
        let mut matched = false;
        let mut closed: Vec<u64> = Vec::new();

        {
            let slots = self.slots.read();
            for slot in slots.iter() {
                if !pattern_matches(&slot.pattern, &channel) {
                    continue;
                }
                matched = true;

                let seq = slot.seq.fetch_add(1, Ordering::SeqCst) + 1;
                let env = Envelope {
                    channel: channel.clone(),
                    seq,
                    payload: payload.clone(),
                };

                match slot.tx.try_send(env) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        slot.dropped.fetch_add(1, Ordering::Relaxed);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            subscriber = slot.id,
                            pattern = %slot.pattern,
                            channel = %channel,
                            "subscriber queue full -- message dropped"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        closed.push(slot.id);
                    }
                }
            }
        }

        // Lazily reap subscriptions whose receiver is gone.
        if !closed.is_empty() {
            self.slots.write().retain(|s| !closed.contains(&s.id));
        }

        if !matched {
            self.unrouted.fetch_add(1, Ordering::Relaxed);
        }
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Publishes that matched no subscriber at all.
    pub fn unrouted_count(&self) -> u64 {
        self.unrouted.load(Ordering::Relaxed)
    }

    /// Total messages dropped across all subscribers.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Total messages handed to subscriber queues.
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("subscribers", &self.subscriber_count())
            .field("delivered", &self.delivered_count())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}
