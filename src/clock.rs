// =============================================================================
// Clock -- single time source for the whole engine
// =============================================================================
//
// Every scheduler in the engine (orchestrator cycle timer, signal expiry scan,
// gateway heartbeats, execution backoff) consults one `Clock`. In live mode
// this is the wall clock; in historical replay it is a virtual clock that only
// advances when the replay feed pushes it forward, so timer-driven behaviour
// is reproducible run to run.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Notify;

/// Engine-wide time source.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;

    /// Suspend the caller for `duration` of *this clock's* time.
    async fn sleep(&self, duration: Duration);

    /// Current time as a chrono UTC timestamp (wire format RFC 3339).
    fn now_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_ms())
            .single()
            .unwrap_or_else(Utc::now)
    }
}

// =============================================================================
// WallClock
// =============================================================================

/// Real time. `sleep` delegates to the tokio timer.
#[derive(Debug, Default)]
pub struct WallClock;

#[async_trait]
impl Clock for WallClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

// =============================================================================
// VirtualClock
// =============================================================================

/// Replay time. The clock never advances on its own; the replay feed calls
/// [`VirtualClock::advance_to`] with each tick timestamp and sleepers wake
/// once virtual time passes their deadline.
#[derive(Debug)]
pub struct VirtualClock {
    now_ms: AtomicI64,
    advanced: Notify,
}

impl VirtualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
            advanced: Notify::new(),
        }
    }

    /// Move virtual time forward to `ts_ms`. Moves backwards are ignored so
    /// the clock stays monotonic even if the feed replays a late tick.
    pub fn advance_to(&self, ts_ms: i64) {
        self.now_ms.fetch_max(ts_ms, Ordering::SeqCst);
        self.advanced.notify_waiters();
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self.now_ms().saturating_add(duration.as_millis() as i64);
        loop {
            // Register for the wakeup before re-checking the deadline so an
            // advance between the check and the await cannot be lost.
            let notified = self.advanced.notified();
            if self.now_ms() >= deadline {
                return;
            }
            notified.await;
        }
    }
}

// =============================================================================
// IdSource
// =============================================================================

/// Identifier generator for signals and positions.
///
/// Live mode hands out UUID v4. Replay mode hands out sequence-derived IDs so
/// that two runs over the same tick file produce identical signal and position
/// IDs (and therefore identical store contents).
#[derive(Debug)]
pub enum IdSource {
    Random,
    Replay { seed: u64, counter: AtomicU64 },
}

impl IdSource {
    pub fn random() -> Arc<Self> {
        Arc::new(Self::Random)
    }

    pub fn replay(seed: u64) -> Arc<Self> {
        Arc::new(Self::Replay {
            seed,
            counter: AtomicU64::new(0),
        })
    }

    /// Produce the next identifier, tagged with a short kind ("sig", "pos").
    pub fn next_id(&self, kind: &str) -> String {
        match self {
            Self::Random => format!("{kind}-{}", uuid::Uuid::new_v4()),
            Self::Replay { seed, counter } => {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                format!("{kind}-{seed:08x}-{n:06}")
            }
        }
    }
}
