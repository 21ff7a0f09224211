// =============================================================================
// SignalMonitor -- PENDING signals become trades the instant they trigger
// =============================================================================
//
// The monitor holds every live signal in memory, keyed by id and indexed by
// instrument. It consumes three streams:
//
//   engine:signal:*       new PENDING signals from the orchestrator
//   market:tick:*         price/volume samples
//   indicators:**         indicator samples per (instrument, timeframe)
//   trading:executed:*    position lifecycle (EXECUTED -> CLOSED)
//
// plus a 1 s expiry scan on the engine clock.
//
// Trigger discipline: evaluation is lock-free over a candidate list; the
// PENDING -> TRIGGERED edge is a CAS, so racing samples trigger a signal at
// most once. Execution is serialized per instrument through a fair async
// mutex (FIFO); conflicting same-instant triggers resolve by earliest
// `created_at`, the loser is CANCELLED with reason `superseded`.
//
// Broker failure reverts TRIGGERED -> PENDING while time remains, else the
// signal expires. On restart the monitor rebuilds its working set from the
// store alone.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::bus::{channels, MessageBus, Subscription};
use crate::clock::Clock;
use crate::execution::executor::{ExecutionEvent, Executor};
use crate::market_data::Tick;
use crate::signal::condition::Sample;
use crate::signal::model::{ActiveSignal, Signal, SignalStatus};
use crate::store::{keys, TickStore};
use crate::types::{TradeAction, Timeframe};

/// Expiry scan period.
const EXPIRY_SCAN: Duration = Duration::from_secs(1);

/// Stream identity for cross-predicate sample pairing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    instrument: String,
    timeframe: Option<Timeframe>,
}

pub struct SignalMonitor {
    bus: Arc<MessageBus>,
    store: Arc<TickStore>,
    clock: Arc<dyn Clock>,
    executor: Arc<Executor>,

    signals: RwLock<HashMap<String, Arc<ActiveSignal>>>,
    last_samples: Mutex<HashMap<StreamKey, Sample>>,
    exec_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,

    triggered: AtomicU64,
    expired: AtomicU64,
    superseded: AtomicU64,
}

impl SignalMonitor {
    pub fn new(
        bus: Arc<MessageBus>,
        store: Arc<TickStore>,
        clock: Arc<dyn Clock>,
        executor: Arc<Executor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            store,
            clock,
            executor,
            signals: RwLock::new(HashMap::new()),
            last_samples: Mutex::new(HashMap::new()),
            exec_locks: Mutex::new(HashMap::new()),
            triggered: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            superseded: AtomicU64::new(0),
        })
    }

    // ── Recovery ────────────────────────────────────────────────────────

    /// Rebuild the working set from the store. Signals whose persisted status
    /// is terminal are dropped from the index instead of loaded.
    pub fn restore(&self, instruments: &[String]) -> usize {
        let mut loaded = 0;
        for instrument in instruments {
            let index = keys::signals_pending(instrument);
            for id in self.store.set_members(&index) {
                match self.store.get::<Signal>(&keys::signal(&id)) {
                    Some(record) if record.status.is_live() => {
                        self.signals
                            .write()
                            .insert(id.clone(), Arc::new(ActiveSignal::new(record)));
                        loaded += 1;
                    }
                    Some(_) | None => {
                        self.store.set_remove(&index, &id);
                    }
                }
            }
        }
        info!(loaded, "signal monitor restored working set");
        loaded
    }

    /// Track a newly created signal.
    pub fn register(&self, record: Signal) {
        if record.status != SignalStatus::Pending {
            warn!(
                signal_id = %record.signal_id,
                status = %record.status,
                "refusing to register signal that is not PENDING"
            );
            return;
        }
        debug!(signal_id = %record.signal_id, instrument = %record.instrument, "signal registered");
        self.signals
            .write()
            .insert(record.signal_id.clone(), Arc::new(ActiveSignal::new(record)));
    }

    // ── Run loops ───────────────────────────────────────────────────────

    /// Spawn one receive loop per subscribed pattern plus the expiry scan.
    pub fn spawn_loops(
        self: &Arc<Self>,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let intake = self.bus.subscribe("engine:signal:*");
        handles.push(tokio::spawn(
            self.clone().run_intake(intake, shutdown.clone()),
        ));

        let ticks = self.bus.subscribe("market:tick:*");
        handles.push(tokio::spawn(self.clone().run_ticks(ticks, shutdown.clone())));

        let indicators = self.bus.subscribe("indicators:**");
        handles.push(tokio::spawn(
            self.clone().run_indicators(indicators, shutdown.clone()),
        ));

        let executed = self.bus.subscribe("trading:executed:*");
        handles.push(tokio::spawn(
            self.clone().run_executed(executed, shutdown.clone()),
        ));

        handles.push(tokio::spawn(self.clone().run_expiry(shutdown)));

        handles
    }

    async fn run_intake(
        self: Arc<Self>,
        mut sub: Subscription,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                env = sub.recv() => {
                    let Some(env) = env else { break };
                    match serde_json::from_value::<Signal>((*env.payload).clone()) {
                        Ok(record) => self.register(record),
                        Err(e) => warn!(channel = %env.channel, error = %e, "bad signal payload"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn run_ticks(
        self: Arc<Self>,
        mut sub: Subscription,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                env = sub.recv() => {
                    let Some(env) = env else { break };
                    match serde_json::from_value::<Tick>((*env.payload).clone()) {
                        Ok(tick) => {
                            let mut sample = Sample::new(tick.ts);
                            sample.fields.insert("price".into(), tick.last_price);
                            sample.fields.insert("volume".into(), tick.volume);
                            let handles = self.on_sample(&tick.instrument, None, sample);
                            drop(handles);
                        }
                        Err(e) => warn!(channel = %env.channel, error = %e, "bad tick payload"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn run_indicators(
        self: Arc<Self>,
        mut sub: Subscription,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                env = sub.recv() => {
                    let Some(env) = env else { break };
                    match serde_json::from_value::<crate::indicators::IndicatorSet>((*env.payload).clone()) {
                        Ok(set) => {
                            let mut sample = Sample::new(set.ts);
                            sample.fields = set.fields();
                            let handles =
                                self.on_sample(&set.instrument, Some(set.timeframe), sample);
                            drop(handles);
                        }
                        Err(e) => warn!(channel = %env.channel, error = %e, "bad indicator payload"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn run_executed(
        self: Arc<Self>,
        mut sub: Subscription,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                env = sub.recv() => {
                    let Some(env) = env else { break };
                    match serde_json::from_value::<ExecutionEvent>((*env.payload).clone()) {
                        Ok(event) => self.on_execution_event(&event),
                        Err(e) => warn!(channel = %env.channel, error = %e, "bad execution payload"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn run_expiry(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.clock.sleep(EXPIRY_SCAN) => {
                    self.expire_due();
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    // ── Sample evaluation ───────────────────────────────────────────────

    /// Evaluate every candidate PENDING signal against the arriving sample.
    /// Returns the spawned execution tasks (callers outside tests drop them).
    pub fn on_sample(
        self: &Arc<Self>,
        instrument: &str,
        timeframe: Option<Timeframe>,
        sample: Sample,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let key = StreamKey {
            instrument: instrument.to_string(),
            timeframe,
        };
        let previous = self.last_samples.lock().get(&key).cloned();

        let now = self.clock.now_ms();
        let candidates: Vec<Arc<ActiveSignal>> = {
            let signals = self.signals.read();
            signals
                .values()
                .filter(|s| s.status() == SignalStatus::Pending)
                .filter(|s| s.instrument() == instrument)
                .filter(|s| {
                    // Indicator samples only drive signals monitoring that
                    // timeframe; tick samples drive every signal of the
                    // instrument.
                    timeframe.is_none_or(|tf| s.snapshot().timeframe == tf)
                })
                .cloned()
                .collect()
        };

        let mut spawned = Vec::new();
        for active in candidates {
            let record = active.snapshot();
            if now >= record.expires_at {
                continue; // the expiry scan owns this transition
            }

            // Field index: a sample can only trigger conditions that read at
            // least one of its fields (Always reads none and passes through).
            let mut referenced = std::collections::HashSet::new();
            record.condition.referenced_fields(&mut referenced);
            if !referenced.is_empty()
                && !referenced.iter().any(|f| sample.fields.contains_key(f))
            {
                continue;
            }

            if !record.condition.eval(&sample, previous.as_ref()) {
                continue;
            }

            // First CAS wins; a duplicate sample or a racing stream loses
            // here and the signal triggers at most once.
            if !active.try_transition(SignalStatus::Pending, SignalStatus::Triggered) {
                continue;
            }
            self.triggered.fetch_add(1, Ordering::Relaxed);

            let fields = sample.fields.clone();
            active.update(|s| {
                s.triggered_at = Some(now);
                s.trigger_snapshot = Some(fields);
            });
            self.persist(&active);

            info!(
                signal_id = %record.signal_id,
                instrument = %record.instrument,
                action = %record.action,
                "signal TRIGGERED"
            );
            if let Ok(json) = serde_json::to_value(active.snapshot()) {
                self.bus
                    .publish(&channels::signal_triggered(instrument), json);
            }

            let monitor = self.clone();
            spawned.push(tokio::spawn(async move {
                monitor.execute_trigger(active).await;
            }));
        }

        self.last_samples.lock().insert(key, sample);
        spawned
    }

    // ── Execution handoff ───────────────────────────────────────────────

    fn instrument_lock(&self, instrument: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.exec_locks
            .lock()
            .entry(instrument.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Execute one triggered signal under the per-instrument mutex.
    async fn execute_trigger(self: Arc<Self>, active: Arc<ActiveSignal>) {
        let instrument = active.instrument();
        let lock = self.instrument_lock(&instrument);
        let _guard = lock.lock().await;

        if active.status() != SignalStatus::Triggered {
            return;
        }

        // Conflicting same-instant trigger: the earliest creation wins.
        if self.superseded_by_earlier(&active) {
            if active.try_transition(SignalStatus::Triggered, SignalStatus::Cancelled) {
                self.superseded.fetch_add(1, Ordering::Relaxed);
                active.update(|s| s.reason = Some("superseded".to_string()));
                self.persist(&active);
                self.drop_from_index(&active);
                info!(signal_id = %active.id(), "signal CANCELLED (superseded)");
            }
            return;
        }

        let snapshot = active.snapshot();
        match self.executor.execute(&snapshot).await {
            Ok(receipt) => {
                if active.try_transition(SignalStatus::Triggered, SignalStatus::Executed) {
                    active.update(|s| s.position_id = receipt.position_id.clone());
                    info!(
                        signal_id = %active.id(),
                        position_id = ?receipt.position_id,
                        fill_price = receipt.fill_price,
                        "signal EXECUTED"
                    );
                    if receipt.closed_position {
                        // A closing signal's own position work is done.
                        active.try_transition(SignalStatus::Executed, SignalStatus::Closed);
                        self.drop_from_index(&active);
                    }
                    self.persist(&active);
                }
            }
            Err(e) => {
                let now = self.clock.now_ms();
                if now >= active.expires_at() {
                    if active.try_transition(SignalStatus::Triggered, SignalStatus::Expired) {
                        self.expired.fetch_add(1, Ordering::Relaxed);
                        active.update(|s| s.reason = Some(format!("broker failure past ttl: {e}")));
                        self.persist(&active);
                        self.drop_from_index(&active);
                        warn!(signal_id = %active.id(), error = %e, "signal EXPIRED after broker failure");
                    }
                } else if active.try_transition(SignalStatus::Triggered, SignalStatus::Pending) {
                    self.persist(&active);
                    warn!(
                        signal_id = %active.id(),
                        error = %e,
                        "execution failed -- signal reverted to PENDING"
                    );
                }
            }
        }
    }

    /// A conflicting (opposite-direction) signal for the same instrument that
    /// is also in flight and was created earlier.
    fn superseded_by_earlier(&self, active: &Arc<ActiveSignal>) -> bool {
        let me = active.snapshot();
        let opposite = match me.action {
            TradeAction::Buy => TradeAction::Sell,
            TradeAction::Sell => TradeAction::Buy,
            _ => return false,
        };

        let signals = self.signals.read();
        signals.values().any(|other| {
            other.id() != me.signal_id
                && other.instrument() == me.instrument
                && other.action() == opposite
                && matches!(
                    other.status(),
                    SignalStatus::Triggered | SignalStatus::Executed
                )
                && other.created_at() < me.created_at
        })
    }

    // ── Lifecycle events ────────────────────────────────────────────────

    /// Position-close events complete the signals that opened the position.
    pub fn on_execution_event(&self, event: &ExecutionEvent) {
        if event.kind != "close" {
            return;
        }
        let Some(position_id) = &event.position_id else {
            return;
        };

        let holders: Vec<Arc<ActiveSignal>> = {
            let signals = self.signals.read();
            signals
                .values()
                .filter(|s| s.status() == SignalStatus::Executed)
                .filter(|s| s.snapshot().position_id.as_deref() == Some(position_id))
                .cloned()
                .collect()
        };

        for active in holders {
            if active.try_transition(SignalStatus::Executed, SignalStatus::Closed) {
                info!(signal_id = %active.id(), position_id = %position_id, "signal CLOSED");
                self.persist(&active);
                self.drop_from_index(&active);
            }
        }
    }

    /// Cancel a PENDING signal (operator action).
    pub fn cancel(&self, signal_id: &str, reason: &str) -> bool {
        let Some(active) = self.signals.read().get(signal_id).cloned() else {
            return false;
        };
        if active.try_transition(SignalStatus::Pending, SignalStatus::Cancelled) {
            active.update(|s| s.reason = Some(reason.to_string()));
            self.persist(&active);
            self.drop_from_index(&active);
            info!(signal_id, reason, "signal CANCELLED");
            true
        } else {
            false
        }
    }

    /// Move every over-age PENDING signal to EXPIRED. Returns the count.
    pub fn expire_due(&self) -> usize {
        let now = self.clock.now_ms();
        let due: Vec<Arc<ActiveSignal>> = {
            let signals = self.signals.read();
            signals
                .values()
                .filter(|s| s.status() == SignalStatus::Pending && now >= s.expires_at())
                .cloned()
                .collect()
        };

        let mut count = 0;
        for active in due {
            if active.try_transition(SignalStatus::Pending, SignalStatus::Expired) {
                self.expired.fetch_add(1, Ordering::Relaxed);
                active.update(|s| s.reason = Some("ttl elapsed".to_string()));
                self.persist(&active);
                self.drop_from_index(&active);
                info!(signal_id = %active.id(), "signal EXPIRED");
                count += 1;
            }
        }
        count
    }

    // ── Persistence helpers ─────────────────────────────────────────────

    fn persist(&self, active: &Arc<ActiveSignal>) {
        let snapshot = active.snapshot();
        if self
            .store
            .put(&keys::signal(&snapshot.signal_id), &snapshot)
            .is_err()
        {
            warn!(signal_id = %snapshot.signal_id, "failed to persist signal state");
        }
    }

    fn drop_from_index(&self, active: &Arc<ActiveSignal>) {
        let snapshot = active.snapshot();
        self.store.set_remove(
            &keys::signals_pending(&snapshot.instrument),
            &snapshot.signal_id,
        );
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn status_of(&self, signal_id: &str) -> Option<SignalStatus> {
        self.signals.read().get(signal_id).map(|s| s.status())
    }

    pub fn snapshot_of(&self, signal_id: &str) -> Option<Signal> {
        self.signals.read().get(signal_id).map(|s| s.snapshot())
    }

    pub fn live_count(&self) -> usize {
        self.signals
            .read()
            .values()
            .filter(|s| s.status().is_live())
            .count()
    }

    pub fn triggered_count(&self) -> u64 {
        self.triggered.load(Ordering::Relaxed)
    }

    pub fn expired_count(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for SignalMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalMonitor")
            .field("signals", &self.signals.read().len())
            .field("triggered", &self.triggered_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{IdSource, VirtualClock};
    use crate::engine::decision::PositionAction;
    use crate::execution::broker::PaperBroker;
    use crate::execution::positions::PositionBook;
    use crate::signal::condition::{CmpOp, Condition};

    struct Rig {
        monitor: Arc<SignalMonitor>,
        bus: Arc<MessageBus>,
        store: Arc<TickStore>,
        clock: Arc<VirtualClock>,
        book: Arc<PositionBook>,
    }

    fn rig() -> Rig {
        let bus = Arc::new(MessageBus::default());
        let store = Arc::new(TickStore::new());
        let clock = Arc::new(VirtualClock::new(0));
        let ids = IdSource::replay(21);
        let book = Arc::new(PositionBook::new(store.clone(), ids.clone()));
        let broker = Arc::new(PaperBroker::new(store.clone(), ids));
        let executor = Arc::new(Executor::new(
            broker,
            book.clone(),
            bus.clone(),
            clock.clone() as Arc<dyn Clock>,
        ));
        let monitor = SignalMonitor::new(
            bus.clone(),
            store.clone(),
            clock.clone() as Arc<dyn Clock>,
            executor,
        );
        Rig {
            monitor,
            bus,
            store,
            clock,
            book,
        }
    }

    fn pending_signal(id: &str, condition: Condition, expires_at: i64) -> Signal {
        Signal {
            signal_id: id.to_string(),
            instrument: "INST_X".into(),
            action: TradeAction::Buy,
            status: SignalStatus::Pending,
            confidence: 0.8,
            condition,
            timeframe: Timeframe::M5,
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            quantity: 1.0,
            position_action: PositionAction::OpenNew,
            created_at: 0,
            expires_at,
            triggered_at: None,
            trigger_snapshot: None,
            position_id: None,
            reason: None,
            metadata: serde_json::Value::Null,
        }
    }

    fn seed_tick(rig: &Rig, price: f64, ts: i64) {
        let tick = Tick {
            instrument: "INST_X".into(),
            ts,
            last_price: price,
            volume: 1.0,
            bid: None,
            ask: None,
            oi: None,
        };
        rig.store.put(&keys::tick_latest("INST_X"), &tick).unwrap();
    }

    fn price_sample(price: f64, ts: i64) -> Sample {
        Sample::new(ts).with("price", price).with("volume", 1.0)
    }

    async fn feed_price(rig: &Rig, price: f64, ts: i64) {
        rig.clock.advance_to(ts);
        seed_tick(rig, price, ts);
        let handles = rig
            .monitor
            .on_sample("INST_X", None, price_sample(price, ts));
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn below_threshold_stays_pending_then_triggers_and_executes() {
        let rig = rig();
        let index = keys::signals_pending("INST_X");
        rig.store.set_add(&index, "sig-1");
        rig.monitor
            .register(pending_signal("sig-1", Condition::price(CmpOp::Ge, 105.0), 60_000));
        let mut triggered_events = rig.bus.subscribe("engine:signal:triggered:*");

        // 104 at t=30s: no transition.
        feed_price(&rig, 104.0, 30_000).await;
        assert_eq!(rig.monitor.status_of("sig-1"), Some(SignalStatus::Pending));

        // 106 at t=40s: TRIGGERED then EXECUTED, position at the trigger price.
        feed_price(&rig, 106.0, 40_000).await;
        assert_eq!(rig.monitor.status_of("sig-1"), Some(SignalStatus::Executed));
        assert!(triggered_events.try_recv().is_some());

        let positions = rig.book.open_for("INST_X");
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].entry_price, 106.0);
        assert_eq!(positions[0].opening_signal_id.as_deref(), Some("sig-1"));

        let snapshot = rig.monitor.snapshot_of("sig-1").unwrap();
        assert_eq!(snapshot.triggered_at, Some(40_000));
        assert_eq!(
            snapshot.trigger_snapshot.unwrap().get("price"),
            Some(&106.0)
        );
    }

    #[tokio::test]
    async fn unmet_condition_expires_after_ttl() {
        let rig = rig();
        rig.monitor
            .register(pending_signal("sig-1", Condition::price(CmpOp::Ge, 105.0), 60_000));

        feed_price(&rig, 104.0, 30_000).await;
        rig.clock.advance_to(61_000);
        assert_eq!(rig.monitor.expire_due(), 1);
        assert_eq!(rig.monitor.status_of("sig-1"), Some(SignalStatus::Expired));
        assert_eq!(
            rig.monitor.snapshot_of("sig-1").unwrap().reason.as_deref(),
            Some("ttl elapsed")
        );
    }

    #[tokio::test]
    async fn duplicate_sample_does_not_double_trigger() {
        let rig = rig();
        rig.monitor
            .register(pending_signal("sig-1", Condition::price(CmpOp::Ge, 105.0), 600_000));

        feed_price(&rig, 106.0, 10_000).await;
        let first = rig.monitor.triggered_count();
        // The same sample delivered again (e.g. after a re-subscribe).
        feed_price(&rig, 106.0, 10_000).await;
        assert_eq!(rig.monitor.triggered_count(), first);
        assert_eq!(first, 1);
    }

    #[tokio::test]
    async fn expired_signals_never_trigger() {
        let rig = rig();
        rig.monitor
            .register(pending_signal("sig-1", Condition::price(CmpOp::Ge, 105.0), 60_000));

        // Condition satisfied, but only after the TTL.
        feed_price(&rig, 110.0, 70_000).await;
        assert_eq!(rig.monitor.status_of("sig-1"), Some(SignalStatus::Pending));
        rig.monitor.expire_due();
        assert_eq!(rig.monitor.status_of("sig-1"), Some(SignalStatus::Expired));
    }

    #[tokio::test]
    async fn cross_predicate_needs_transition_between_samples() {
        let rig = rig();
        let condition = Condition::CrossUp {
            fast: "macd_value".into(),
            slow: "macd_signal".into(),
        };
        rig.monitor
            .register(pending_signal("sig-1", condition, 600_000));
        seed_tick(&rig, 100.0, 1_000);

        let below = Sample::new(1_000)
            .with("macd_value", -0.2)
            .with("macd_signal", 0.1);
        let handles = rig.monitor.on_sample("INST_X", Some(Timeframe::M5), below);
        assert!(handles.is_empty());
        assert_eq!(rig.monitor.status_of("sig-1"), Some(SignalStatus::Pending));

        let above = Sample::new(2_000)
            .with("macd_value", 0.3)
            .with("macd_signal", 0.1);
        let handles = rig.monitor.on_sample("INST_X", Some(Timeframe::M5), above);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(rig.monitor.status_of("sig-1"), Some(SignalStatus::Executed));
    }

    #[tokio::test]
    async fn indicator_samples_respect_the_signal_timeframe() {
        let rig = rig();
        let condition = Condition::Leaf {
            field: "rsi_14".into(),
            op: CmpOp::Ge,
            value: 50.0,
        };
        rig.monitor
            .register(pending_signal("sig-1", condition, 600_000));

        // Wrong timeframe: ignored.
        let sample = Sample::new(1_000).with("rsi_14", 60.0);
        let handles = rig.monitor.on_sample("INST_X", Some(Timeframe::M1), sample);
        assert!(handles.is_empty());

        // Matching timeframe triggers.
        seed_tick(&rig, 100.0, 1_500);
        let sample = Sample::new(2_000).with("rsi_14", 60.0);
        let handles = rig.monitor.on_sample("INST_X", Some(Timeframe::M5), sample);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(rig.monitor.status_of("sig-1"), Some(SignalStatus::Executed));
    }

    #[tokio::test]
    async fn conflicting_later_trigger_is_superseded() {
        let rig = rig();
        // Earlier BUY and later SELL both fire on the same sample.
        let buy = pending_signal("sig-buy", Condition::price(CmpOp::Ge, 100.0), 600_000);
        let mut sell = pending_signal("sig-sell", Condition::price(CmpOp::Ge, 100.0), 600_000);
        sell.action = TradeAction::Sell;
        sell.created_at = 10; // later than the buy's 0
        rig.monitor.register(buy);
        rig.monitor.register(sell);

        feed_price(&rig, 101.0, 5_000).await;

        assert_eq!(
            rig.monitor.status_of("sig-buy"),
            Some(SignalStatus::Executed)
        );
        assert_eq!(
            rig.monitor.status_of("sig-sell"),
            Some(SignalStatus::Cancelled)
        );
        assert_eq!(
            rig.monitor.snapshot_of("sig-sell").unwrap().reason.as_deref(),
            Some("superseded")
        );
        // Only the winner produced a position.
        assert_eq!(rig.book.open_count(), 1);
    }

    #[tokio::test]
    async fn close_event_completes_the_opening_signal() {
        let rig = rig();
        rig.monitor
            .register(pending_signal("sig-1", Condition::price(CmpOp::Ge, 105.0), 600_000));
        feed_price(&rig, 106.0, 10_000).await;
        assert_eq!(rig.monitor.status_of("sig-1"), Some(SignalStatus::Executed));

        let position_id = rig
            .monitor
            .snapshot_of("sig-1")
            .unwrap()
            .position_id
            .unwrap();

        let event = ExecutionEvent {
            signal_id: None,
            instrument: "INST_X".into(),
            kind: "close".into(),
            status: "filled".into(),
            order_id: Some("ord-9".into()),
            fill_price: Some(110.0),
            quantity: 1.0,
            position_id: Some(position_id),
            reason: Some("take_profit".into()),
            ts: 20_000,
        };
        rig.monitor.on_execution_event(&event);
        assert_eq!(rig.monitor.status_of("sig-1"), Some(SignalStatus::Closed));
    }

    #[tokio::test]
    async fn restart_with_same_store_reaches_same_statuses() {
        let first = rig();
        let index = keys::signals_pending("INST_X");

        // One signal executes, one stays pending; both are persisted.
        let executed = pending_signal("sig-exec", Condition::price(CmpOp::Ge, 100.0), 600_000);
        let waiting = pending_signal("sig-wait", Condition::price(CmpOp::Ge, 1_000.0), 600_000);
        first.store.put(&keys::signal("sig-exec"), &executed).unwrap();
        first.store.put(&keys::signal("sig-wait"), &waiting).unwrap();
        first.store.set_add(&index, "sig-exec");
        first.store.set_add(&index, "sig-wait");
        first.monitor.register(executed);
        first.monitor.register(waiting);
        feed_price(&first, 101.0, 10_000).await;
        assert_eq!(
            first.monitor.status_of("sig-exec"),
            Some(SignalStatus::Executed)
        );

        // A fresh monitor over the same store sees identical statuses.
        let bus = Arc::new(MessageBus::default());
        let clock = Arc::new(VirtualClock::new(10_000));
        let ids = IdSource::replay(99);
        let book = Arc::new(PositionBook::new(first.store.clone(), ids.clone()));
        let broker = Arc::new(PaperBroker::new(first.store.clone(), ids));
        let executor = Arc::new(Executor::new(
            broker,
            book,
            bus.clone(),
            clock.clone() as Arc<dyn Clock>,
        ));
        let second = SignalMonitor::new(
            bus,
            first.store.clone(),
            clock as Arc<dyn Clock>,
            executor,
        );
        let loaded = second.restore(&["INST_X".to_string()]);
        assert_eq!(loaded, 2);
        assert_eq!(
            second.status_of("sig-exec"),
            Some(SignalStatus::Executed)
        );
        assert_eq!(second.status_of("sig-wait"), Some(SignalStatus::Pending));

        // Replaying the already-seen sample does not re-trigger sig-exec.
        let handles = second.on_sample("INST_X", None, price_sample(101.0, 10_000));
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(
            second.status_of("sig-exec"),
            Some(SignalStatus::Executed)
        );
    }

    #[tokio::test]
    async fn broker_failure_reverts_to_pending_while_time_remains() {
        use crate::execution::broker::{BrokerAdapter, BrokerError, OrderResult, OrderSide, OrderType};
        use crate::execution::positions::Position;
        use async_trait::async_trait;

        struct DeadBroker;

        #[async_trait]
        impl BrokerAdapter for DeadBroker {
            async fn place_order(
                &self,
                _i: &str,
                _s: OrderSide,
                _q: f64,
                _t: OrderType,
                _p: Option<f64>,
            ) -> Result<OrderResult, BrokerError> {
                Err(BrokerError::Fatal("exchange rejected".into()))
            }
            async fn cancel_order(&self, _o: &str) -> Result<(), BrokerError> {
                Ok(())
            }
            async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
                Ok(Vec::new())
            }
        }

        let bus = Arc::new(MessageBus::default());
        let store = Arc::new(TickStore::new());
        let clock = Arc::new(VirtualClock::new(0));
        let ids = IdSource::replay(5);
        let book = Arc::new(PositionBook::new(store.clone(), ids));
        let executor = Arc::new(Executor::new(
            Arc::new(DeadBroker),
            book,
            bus.clone(),
            clock.clone() as Arc<dyn Clock>,
        ));
        let monitor = SignalMonitor::new(
            bus,
            store.clone(),
            clock.clone() as Arc<dyn Clock>,
            executor,
        );

        monitor.register(pending_signal(
            "sig-1",
            Condition::price(CmpOp::Ge, 105.0),
            600_000,
        ));

        clock.advance_to(10_000);
        let handles = monitor.on_sample("INST_X", None, price_sample(106.0, 10_000));
        for h in handles {
            h.await.unwrap();
        }
        // Reverted: the same signal may trigger again later.
        assert_eq!(monitor.status_of("sig-1"), Some(SignalStatus::Pending));

        // Past the TTL the same failure expires the signal instead.
        clock.advance_to(700_000);
        let handles = monitor.on_sample("INST_X", None, price_sample(106.0, 599_000));
        for h in handles {
            h.await.unwrap();
        }
        // now >= expires_at at evaluation time, so nothing triggered at all.
        assert_eq!(monitor.status_of("sig-1"), Some(SignalStatus::Pending));
    }
}
