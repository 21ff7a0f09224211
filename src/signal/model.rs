// =============================================================================
// Signal model -- conditional order intent with a CAS-guarded state machine
// =============================================================================
//
// Life-cycle:
//
//   PENDING  -> TRIGGERED | EXPIRED | CANCELLED
//   TRIGGERED -> EXECUTED | CANCELLED | PENDING (broker failure revert)
//                         | EXPIRED   (broker failure past TTL)
//   EXECUTED -> CLOSED
//
// Transitions go through one atomic status word per signal via
// compare-and-set, so racing samples can trigger a signal at most once and
// the observed status sequence is always a valid path through the machine.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::decision::PositionAction;
use crate::signal::condition::Condition;
use crate::types::{TradeAction, Timeframe};

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalStatus {
    Pending,
    Triggered,
    Executed,
    Expired,
    Cancelled,
    Closed,
}

impl SignalStatus {
    fn as_u8(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Triggered => 1,
            Self::Executed => 2,
            Self::Expired => 3,
            Self::Cancelled => 4,
            Self::Closed => 5,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Triggered,
            2 => Self::Executed,
            3 => Self::Expired,
            4 => Self::Cancelled,
            _ => Self::Closed,
        }
    }

    /// Whether `from -> to` is a legal edge of the state machine.
    pub fn can_transition(from: SignalStatus, to: SignalStatus) -> bool {
        use SignalStatus::*;
        matches!(
            (from, to),
            (Pending, Triggered)
                | (Pending, Expired)
                | (Pending, Cancelled)
                | (Triggered, Executed)
                | (Triggered, Cancelled)
                | (Triggered, Pending)
                | (Triggered, Expired)
                | (Executed, Closed)
        )
    }

    /// Statuses that survive a restart and are reloaded into the monitor.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Triggered | Self::Executed)
    }
}

impl std::fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Triggered => write!(f, "TRIGGERED"),
            Self::Executed => write!(f, "EXECUTED"),
            Self::Expired => write!(f, "EXPIRED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

// =============================================================================
// Signal record
// =============================================================================

/// The persisted form of a signal. `status` here is the snapshot at write
/// time; the live status word lives in [`ActiveSignal`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub instrument: String,
    pub action: TradeAction,
    pub status: SignalStatus,
    /// Aggregate confidence in [0, 1] carried over from the decision.
    pub confidence: f64,
    pub condition: Condition,
    /// Stream the condition is monitored on (cross predicates compare the two
    /// most recent samples of this timeframe).
    pub timeframe: Timeframe,
    pub entry_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub quantity: f64,
    pub position_action: PositionAction,
    pub created_at: i64,
    pub expires_at: i64,
    #[serde(default)]
    pub triggered_at: Option<i64>,
    /// Field values at the evaluation that triggered the signal.
    #[serde(default)]
    pub trigger_snapshot: Option<HashMap<String, f64>>,
    /// Set when the signal opened or closed a position.
    #[serde(default)]
    pub position_id: Option<String>,
    /// Machine-readable reason for CANCELLED / EXPIRED.
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl Signal {
    /// Price-level sanity: `sl < entry < tp` for BUY, symmetric for SELL.
    /// Levels that are absent are not constrained.
    pub fn levels_sane(&self) -> bool {
        let Some(entry) = self.entry_price else {
            return true;
        };
        match self.action {
            TradeAction::Buy => {
                self.stop_loss.is_none_or(|sl| sl < entry)
                    && self.take_profit.is_none_or(|tp| tp > entry)
            }
            TradeAction::Sell => {
                self.stop_loss.is_none_or(|sl| sl > entry)
                    && self.take_profit.is_none_or(|tp| tp < entry)
            }
            // EXIT/HOLD carry no entry levels worth constraining.
            _ => true,
        }
    }
}

// =============================================================================
// ActiveSignal -- in-memory handle with the atomic status word
// =============================================================================

/// A signal held by the monitor. The record is the source of truth for
/// everything except `status`, which lives in an atomic so concurrent
/// samples settle transitions by compare-and-set.
pub struct ActiveSignal {
    record: RwLock<Signal>,
    status: AtomicU8,
}

impl ActiveSignal {
    pub fn new(record: Signal) -> Self {
        let status = AtomicU8::new(record.status.as_u8());
        Self {
            record: RwLock::new(record),
            status,
        }
    }

    pub fn status(&self) -> SignalStatus {
        SignalStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Attempt the `from -> to` transition. Returns false when the edge is
    /// illegal or another caller already moved the signal off `from`; at most
    /// one caller ever wins a given edge.
    pub fn try_transition(&self, from: SignalStatus, to: SignalStatus) -> bool {
        if !SignalStatus::can_transition(from, to) {
            return false;
        }
        let won = self
            .status
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            self.record.write().status = to;
        }
        won
    }

    /// Mutate the record (everything except `status`).
    pub fn update<F: FnOnce(&mut Signal)>(&self, f: F) {
        let mut record = self.record.write();
        f(&mut record);
        // Status is owned by the atomic; keep the record consistent with it.
        record.status = SignalStatus::from_u8(self.status.load(Ordering::SeqCst));
    }

    /// Consistent copy of the record with the live status.
    pub fn snapshot(&self) -> Signal {
        let mut record = self.record.read().clone();
        record.status = self.status();
        record
    }

    pub fn id(&self) -> String {
        self.record.read().signal_id.clone()
    }

    pub fn instrument(&self) -> String {
        self.record.read().instrument.clone()
    }

    pub fn expires_at(&self) -> i64 {
        self.record.read().expires_at
    }

    pub fn created_at(&self) -> i64 {
        self.record.read().created_at
    }

    pub fn action(&self) -> TradeAction {
        self.record.read().action
    }
}

impl std::fmt::Debug for ActiveSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let record = self.record.read();
        f.debug_struct("ActiveSignal")
            .field("signal_id", &record.signal_id)
            .field("instrument", &record.instrument)
            .field("status", &self.status())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::condition::CmpOp;
    use std::sync::Arc;

    fn signal(action: TradeAction) -> Signal {
        Signal {
            signal_id: "sig-1".into(),
            instrument: "NIFTY".into(),
            action,
            status: SignalStatus::Pending,
            confidence: 0.7,
            condition: Condition::price(CmpOp::Ge, 105.0),
            timeframe: Timeframe::M5,
            entry_price: Some(105.0),
            stop_loss: Some(100.0),
            take_profit: Some(115.0),
            quantity: 1.0,
            position_action: PositionAction::OpenNew,
            created_at: 0,
            expires_at: 60_000,
            triggered_at: None,
            trigger_snapshot: None,
            position_id: None,
            reason: None,
            metadata: Value::Null,
        }
    }

    #[test]
    fn legal_and_illegal_edges() {
        use SignalStatus::*;
        assert!(SignalStatus::can_transition(Pending, Triggered));
        assert!(SignalStatus::can_transition(Pending, Expired));
        assert!(SignalStatus::can_transition(Triggered, Executed));
        assert!(SignalStatus::can_transition(Triggered, Pending));
        assert!(SignalStatus::can_transition(Executed, Closed));

        assert!(!SignalStatus::can_transition(Pending, Executed));
        assert!(!SignalStatus::can_transition(Executed, Pending));
        assert!(!SignalStatus::can_transition(Expired, Triggered));
        assert!(!SignalStatus::can_transition(Closed, Pending));
        assert!(!SignalStatus::can_transition(Cancelled, Executed));
    }

    #[test]
    fn transition_updates_status_and_snapshot() {
        let active = ActiveSignal::new(signal(TradeAction::Buy));
        assert!(active.try_transition(SignalStatus::Pending, SignalStatus::Triggered));
        assert_eq!(active.status(), SignalStatus::Triggered);
        assert_eq!(active.snapshot().status, SignalStatus::Triggered);
    }

    #[test]
    fn stale_from_state_loses() {
        let active = ActiveSignal::new(signal(TradeAction::Buy));
        assert!(active.try_transition(SignalStatus::Pending, SignalStatus::Triggered));
        // Second caller still believes PENDING: CAS fails.
        assert!(!active.try_transition(SignalStatus::Pending, SignalStatus::Triggered));
        assert!(!active.try_transition(SignalStatus::Pending, SignalStatus::Expired));
    }

    #[test]
    fn racing_triggers_win_at_most_once() {
        let active = Arc::new(ActiveSignal::new(signal(TradeAction::Buy)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let sig = active.clone();
            handles.push(std::thread::spawn(move || {
                sig.try_transition(SignalStatus::Pending, SignalStatus::Triggered)
            }));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(wins, 1, "exactly one racer may take PENDING -> TRIGGERED");
        assert_eq!(active.status(), SignalStatus::Triggered);
    }

    #[test]
    fn buy_levels_sanity() {
        let good = signal(TradeAction::Buy);
        assert!(good.levels_sane());

        let mut inverted = signal(TradeAction::Buy);
        inverted.stop_loss = Some(110.0);
        assert!(!inverted.levels_sane());

        let mut bad_tp = signal(TradeAction::Buy);
        bad_tp.take_profit = Some(90.0);
        assert!(!bad_tp.levels_sane());
    }

    #[test]
    fn sell_levels_are_symmetric() {
        let mut sell = signal(TradeAction::Sell);
        sell.stop_loss = Some(110.0);
        sell.take_profit = Some(95.0);
        assert!(sell.levels_sane());

        sell.stop_loss = Some(95.0);
        assert!(!sell.levels_sane());
    }

    #[test]
    fn absent_levels_are_unconstrained() {
        let mut sig = signal(TradeAction::Buy);
        sig.entry_price = None;
        sig.stop_loss = Some(999.0);
        assert!(sig.levels_sane());
    }

    #[test]
    fn status_serde_is_uppercase() {
        assert_eq!(
            serde_json::to_string(&SignalStatus::Pending).unwrap(),
            "\"PENDING\""
        );
        let s: SignalStatus = serde_json::from_str("\"TRIGGERED\"").unwrap();
        assert_eq!(s, SignalStatus::Triggered);
    }
}
