// =============================================================================
// TickStore -- latest-snapshot key/value store
// =============================================================================
//
// Owns every durable snapshot the engine keeps: latest ticks, in-flight and
// closed OHLC bars, indicator sets, signals and positions. Writes are
// last-writer-wins per key; there are no multi-key transactions. Components
// rebuild their working sets from here on restart.
//
// Key layout:
//   tick:{instrument}:latest
//   ohlc:{instrument}:{tf}:current
//   ohlc:{instrument}:{tf}:{bucket}
//   indicators:{instrument}:{tf}:latest
//   signal:{signal_id}
//   position:{position_id}
// Index sets:
//   signals:pending:{instrument}
//   positions:open:{instrument}
// =============================================================================

use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::types::Timeframe;

// =============================================================================
// Key constructors
// =============================================================================

pub mod keys {
    use super::Timeframe;

    pub fn tick_latest(instrument: &str) -> String {
        format!("tick:{instrument}:latest")
    }

    pub fn ohlc_current(instrument: &str, tf: Timeframe) -> String {
        format!("ohlc:{instrument}:{tf}:current")
    }

    pub fn ohlc_bucket(instrument: &str, tf: Timeframe, bucket: i64) -> String {
        format!("ohlc:{instrument}:{tf}:{bucket}")
    }

    pub fn indicators_latest(instrument: &str, tf: Timeframe) -> String {
        format!("indicators:{instrument}:{tf}:latest")
    }

    pub fn signal(signal_id: &str) -> String {
        format!("signal:{signal_id}")
    }

    pub fn signals_pending(instrument: &str) -> String {
        format!("signals:pending:{instrument}")
    }

    pub fn position(position_id: &str) -> String {
        format!("position:{position_id}")
    }

    pub fn positions_open(instrument: &str) -> String {
        format!("positions:open:{instrument}")
    }
}

// =============================================================================
// TickStore
// =============================================================================

/// In-memory KV backend. Values are stored as JSON so any serde-able snapshot
/// type round-trips through the same interface.
pub struct TickStore {
    kv: RwLock<HashMap<String, Value>>,
    sets: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl TickStore {
    pub fn new() -> Self {
        Self {
            kv: RwLock::new(HashMap::new()),
            sets: RwLock::new(HashMap::new()),
        }
    }

    /// Write a snapshot under `key`, replacing any previous value.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_value(value)
            .with_context(|| format!("failed to serialize store value for key {key}"))?;
        self.kv.write().insert(key.to_string(), json);
        Ok(())
    }

    /// Read and deserialize the snapshot under `key`.
    ///
    /// A value that fails to deserialize into `T` is treated as absent (and
    /// logged); the caller sees `None` exactly as for a missing key.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let json = self.kv.read().get(key).cloned()?;
        match serde_json::from_value(json) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "store value failed to deserialize");
                None
            }
        }
    }

    /// Read the raw JSON value under `key`.
    pub fn get_raw(&self, key: &str) -> Option<Value> {
        self.kv.read().get(key).cloned()
    }

    /// Remove `key`. Returns whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        self.kv.write().remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.kv.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.kv.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.kv.read().is_empty()
    }

    // ── Index sets ──────────────────────────────────────────────────────

    /// Add `member` to the index set `set_key`. Returns true if newly added.
    pub fn set_add(&self, set_key: &str, member: &str) -> bool {
        self.sets
            .write()
            .entry(set_key.to_string())
            .or_default()
            .insert(member.to_string())
    }

    /// Remove `member` from the index set. Idempotent.
    pub fn set_remove(&self, set_key: &str, member: &str) -> bool {
        let mut sets = self.sets.write();
        match sets.get_mut(set_key) {
            Some(set) => {
                let removed = set.remove(member);
                if set.is_empty() {
                    sets.remove(set_key);
                }
                removed
            }
            None => false,
        }
    }

    /// All members of the index set, in lexicographic order.
    pub fn set_members(&self, set_key: &str) -> Vec<String> {
        self.sets
            .read()
            .get(set_key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for TickStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TickStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickStore")
            .field("keys", &self.len())
            .field("sets", &self.sets.read().len())
            .finish()
    }
}
