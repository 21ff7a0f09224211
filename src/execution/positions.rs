// =============================================================================
// Position Book -- the engine's open/closed position set
// =============================================================================
//
// Life-cycle: OPEN -> CLOSED, never reopened. Per instrument there is at most
// one open position (long/short hedging on the same instrument is not
// supported; a contrary decision closes the open side instead).
//
// The book is the sole writer of position state. Every mutation is mirrored
// to the store (`position:{id}` plus the `positions:open:{instrument}` index)
// so a restart rebuilds the same book.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::IdSource;
use crate::store::{keys, TickStore};
use crate::types::PositionSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// A held exposure resulting from executed signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub instrument: String,
    pub side: PositionSide,
    /// Always > 0 while open.
    pub quantity: f64,
    /// First fill price.
    pub entry_price: f64,
    /// Volume-weighted across adds.
    pub avg_price: f64,
    pub opened_at: i64,
    pub status: PositionStatus,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub opening_signal_id: Option<String>,
    #[serde(default)]
    pub closing_signal_id: Option<String>,
    #[serde(default)]
    pub closed_at: Option<i64>,
    #[serde(default)]
    pub close_price: Option<f64>,
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default)]
    pub close_reason: Option<String>,
}

/// Thread-safe owner of the position set.
pub struct PositionBook {
    store: Arc<TickStore>,
    ids: Arc<IdSource>,
    open: RwLock<Vec<Position>>,
    closed: RwLock<Vec<Position>>,
}

impl PositionBook {
    pub fn new(store: Arc<TickStore>, ids: Arc<IdSource>) -> Self {
        Self {
            store,
            ids,
            open: RwLock::new(Vec::new()),
            closed: RwLock::new(Vec::new()),
        }
    }

    /// Rebuild the open set from the store for the given instruments.
    pub fn restore(&self, instruments: &[String]) -> usize {
        let mut restored = 0;
        let mut open = self.open.write();
        for instrument in instruments {
            for id in self.store.set_members(&keys::positions_open(instrument)) {
                match self.store.get::<Position>(&keys::position(&id)) {
                    Some(pos) if pos.status == PositionStatus::Open => {
                        open.push(pos);
                        restored += 1;
                    }
                    Some(_) => {
                        // Closed position left in the index: repair it.
                        self.store.set_remove(&keys::positions_open(instrument), &id);
                    }
                    None => {
                        warn!(position_id = %id, "indexed position missing from store");
                        self.store.set_remove(&keys::positions_open(instrument), &id);
                    }
                }
            }
        }
        restored
    }

    /// Open a new position. Refuses when the instrument already has one open.
    #[allow(clippy::too_many_arguments)]
    pub fn open_position(
        &self,
        instrument: &str,
        side: PositionSide,
        quantity: f64,
        fill_price: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        opening_signal_id: Option<String>,
        now_ms: i64,
    ) -> Option<Position> {
        if quantity <= 0.0 || !fill_price.is_finite() {
            return None;
        }

        let mut open = self.open.write();
        if open.iter().any(|p| p.instrument == instrument) {
            warn!(instrument, "refusing to open a second position for instrument");
            return None;
        }

        let position = Position {
            position_id: self.ids.next_id("pos"),
            instrument: instrument.to_string(),
            side,
            quantity,
            entry_price: fill_price,
            avg_price: fill_price,
            opened_at: now_ms,
            status: PositionStatus::Open,
            stop_loss,
            take_profit,
            opening_signal_id,
            closing_signal_id: None,
            closed_at: None,
            close_price: None,
            realized_pnl: 0.0,
            close_reason: None,
        };

        info!(
            position_id = %position.position_id,
            instrument,
            side = %side,
            quantity,
            fill_price,
            "position opened"
        );

        self.persist(&position);
        self.store
            .set_add(&keys::positions_open(instrument), &position.position_id);
        open.push(position.clone());
        Some(position)
    }

    /// Add to the open position on `instrument`/`side`, recomputing the
    /// volume-weighted average price.
    pub fn add_to(
        &self,
        instrument: &str,
        side: PositionSide,
        quantity: f64,
        fill_price: f64,
    ) -> Option<Position> {
        if quantity <= 0.0 || !fill_price.is_finite() {
            return None;
        }

        let mut open = self.open.write();
        let pos = open
            .iter_mut()
            .find(|p| p.instrument == instrument && p.side == side)?;

        let total = pos.quantity + quantity;
        pos.avg_price = (pos.avg_price * pos.quantity + fill_price * quantity) / total;
        pos.quantity = total;

        info!(
            position_id = %pos.position_id,
            instrument,
            added = quantity,
            quantity = pos.quantity,
            avg_price = pos.avg_price,
            "position increased"
        );

        let snapshot = pos.clone();
        self.persist(&snapshot);
        Some(snapshot)
    }

    /// Close a position by id. Idempotent: closing an already-closed position
    /// returns its final state unchanged.
    pub fn close(
        &self,
        position_id: &str,
        close_price: f64,
        reason: &str,
        closing_signal_id: Option<String>,
        now_ms: i64,
    ) -> Option<Position> {
        {
            let closed = self.closed.read();
            if let Some(done) = closed.iter().find(|p| p.position_id == position_id) {
                return Some(done.clone());
            }
        }

        let mut open = self.open.write();
        let idx = open.iter().position(|p| p.position_id == position_id)?;
        let mut pos = open.remove(idx);
        drop(open);

        let direction = match pos.side {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        };
        pos.realized_pnl = direction * (close_price - pos.avg_price) * pos.quantity;
        pos.status = PositionStatus::Closed;
        pos.closed_at = Some(now_ms);
        pos.close_price = Some(close_price);
        pos.close_reason = Some(reason.to_string());
        pos.closing_signal_id = closing_signal_id;

        info!(
            position_id = %pos.position_id,
            instrument = %pos.instrument,
            close_price,
            realized_pnl = pos.realized_pnl,
            reason,
            "position closed"
        );

        self.persist(&pos);
        self.store
            .set_remove(&keys::positions_open(&pos.instrument), &pos.position_id);
        self.closed.write().push(pos.clone());
        Some(pos)
    }

    fn persist(&self, position: &Position) {
        let _ = self
            .store
            .put(&keys::position(&position.position_id), position);
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn open_for(&self, instrument: &str) -> Vec<Position> {
        self.open
            .read()
            .iter()
            .filter(|p| p.instrument == instrument)
            .cloned()
            .collect()
    }

    pub fn find_open(&self, instrument: &str, side: PositionSide) -> Option<Position> {
        self.open
            .read()
            .iter()
            .find(|p| p.instrument == instrument && p.side == side)
            .cloned()
    }

    pub fn open_count(&self) -> usize {
        self.open.read().len()
    }

    pub fn all_open(&self) -> Vec<Position> {
        self.open.read().clone()
    }

    pub fn closed_recent(&self, count: usize) -> Vec<Position> {
        let closed = self.closed.read();
        closed.iter().rev().take(count).cloned().collect()
    }
}

impl std::fmt::Debug for PositionBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionBook")
            .field("open", &self.open.read().len())
            .field("closed", &self.closed.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> (PositionBook, Arc<TickStore>) {
        let store = Arc::new(TickStore::new());
        let book = PositionBook::new(store.clone(), IdSource::replay(7));
        (book, store)
    }

    #[test]
    fn open_and_query() {
        let (book, store) = book();
        let pos = book
            .open_position("NIFTY", PositionSide::Long, 2.0, 100.0, Some(95.0), Some(110.0), Some("sig-1".into()), 1_000)
            .unwrap();

        assert_eq!(pos.avg_price, 100.0);
        assert_eq!(book.open_count(), 1);
        assert_eq!(book.open_for("NIFTY").len(), 1);
        assert!(book.find_open("NIFTY", PositionSide::Short).is_none());

        // Persisted and indexed.
        assert!(store.get::<Position>(&keys::position(&pos.position_id)).is_some());
        assert_eq!(
            store.set_members(&keys::positions_open("NIFTY")),
            vec![pos.position_id.clone()]
        );
    }

    #[test]
    fn one_open_position_per_instrument() {
        let (book, _store) = book();
        book.open_position("NIFTY", PositionSide::Long, 1.0, 100.0, None, None, None, 0)
            .unwrap();
        assert!(book
            .open_position("NIFTY", PositionSide::Short, 1.0, 100.0, None, None, None, 0)
            .is_none());
        // A different instrument is fine.
        assert!(book
            .open_position("BANKNIFTY", PositionSide::Short, 1.0, 200.0, None, None, None, 0)
            .is_some());
    }

    #[test]
    fn add_recomputes_average_price() {
        let (book, _store) = book();
        book.open_position("NIFTY", PositionSide::Long, 2.0, 100.0, None, None, None, 0)
            .unwrap();
        let pos = book.add_to("NIFTY", PositionSide::Long, 2.0, 110.0).unwrap();
        assert_eq!(pos.quantity, 4.0);
        assert!((pos.avg_price - 105.0).abs() < 1e-12);
        // Entry price stays at the first fill.
        assert_eq!(pos.entry_price, 100.0);
    }

    #[test]
    fn close_realizes_pnl_long_and_short() {
        let (book, _store) = book();
        let long = book
            .open_position("NIFTY", PositionSide::Long, 2.0, 100.0, None, None, None, 0)
            .unwrap();
        let closed = book
            .close(&long.position_id, 110.0, "take_profit", Some("sig-x".into()), 5_000)
            .unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert!((closed.realized_pnl - 20.0).abs() < 1e-12);
        assert_eq!(closed.closing_signal_id.as_deref(), Some("sig-x"));

        let short = book
            .open_position("BANKNIFTY", PositionSide::Short, 1.0, 200.0, None, None, None, 0)
            .unwrap();
        let closed = book
            .close(&short.position_id, 190.0, "signal_exit", None, 6_000)
            .unwrap();
        assert!((closed.realized_pnl - 10.0).abs() < 1e-12);
    }

    #[test]
    fn close_is_idempotent() {
        let (book, _store) = book();
        let pos = book
            .open_position("NIFTY", PositionSide::Long, 1.0, 100.0, None, None, None, 0)
            .unwrap();
        let first = book.close(&pos.position_id, 105.0, "manual", None, 1_000).unwrap();
        let second = book.close(&pos.position_id, 999.0, "again", None, 2_000).unwrap();
        assert_eq!(first, second);
        assert_eq!(book.open_count(), 0);
    }

    #[test]
    fn restore_rebuilds_open_set_from_store() {
        let store = Arc::new(TickStore::new());
        {
            let book = PositionBook::new(store.clone(), IdSource::replay(1));
            book.open_position("NIFTY", PositionSide::Long, 1.0, 100.0, None, None, None, 0)
                .unwrap();
            let doomed = book
                .open_position("BANKNIFTY", PositionSide::Short, 1.0, 200.0, None, None, None, 0)
                .unwrap();
            book.close(&doomed.position_id, 195.0, "done", None, 1_000);
        }

        let fresh = PositionBook::new(store, IdSource::replay(2));
        let restored = fresh.restore(&["NIFTY".to_string(), "BANKNIFTY".to_string()]);
        assert_eq!(restored, 1);
        assert_eq!(fresh.open_count(), 1);
        assert_eq!(fresh.open_for("NIFTY").len(), 1);
    }
}
