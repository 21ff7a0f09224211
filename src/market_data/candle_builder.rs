// =============================================================================
// CandleBuilder -- ticks in, OHLC bars out
// =============================================================================
//
// The ingestion point of the pipeline. Every tick is validated, canonicalized,
// published on `market:tick:{instrument}` and snapshotted, then folded into
// one in-flight bar per configured timeframe. A bar closes when a tick lands
// in a later bucket; the closed bar is published on
// `market:ohlc:{instrument}:{tf}` and written to the store.
//
// Gap rule: if no ticks arrive for N buckets, the stale bar is closed at its
// last seen values and the next bar opens at the new tick's bucket. Missing
// buckets are represented by absence -- no synthetic empty bars.
//
// Only closed bars reach indicator subscribers; the in-flight bar is visible
// through the store snapshot key `ohlc:{instrument}:{tf}:current`.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bus::{channels, MessageBus};
use crate::market_data::tick::{InstrumentMap, Tick};
use crate::store::{keys, TickStore};
use crate::types::Timeframe;

// =============================================================================
// OhlcBar
// =============================================================================

/// Aggregated price action over one timeframe bucket.
/// Identity is `(instrument, timeframe, start_at)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcBar {
    pub instrument: String,
    pub timeframe: Timeframe,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Bucket start, milliseconds since the Unix epoch.
    pub start_at: i64,
    pub closed: bool,
}

impl OhlcBar {
    fn open_from(tick: &Tick, tf: Timeframe, bucket: i64) -> Self {
        Self {
            instrument: tick.instrument.clone(),
            timeframe: tf,
            open: tick.last_price,
            high: tick.last_price,
            low: tick.last_price,
            close: tick.last_price,
            volume: tick.volume,
            start_at: bucket,
            closed: false,
        }
    }

    fn absorb(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.last_price);
        self.low = self.low.min(tick.last_price);
        self.close = tick.last_price;
        self.volume += tick.volume;
    }
}

// =============================================================================
// CandleBuilder
// =============================================================================

struct InstrumentState {
    last_ts: i64,
    open_bars: HashMap<Timeframe, OhlcBar>,
}

/// Per-instrument tick-to-bar aggregation across all configured timeframes.
pub struct CandleBuilder {
    bus: Arc<MessageBus>,
    store: Arc<TickStore>,
    timeframes: Vec<Timeframe>,
    instruments: InstrumentMap,
    state: Mutex<HashMap<String, InstrumentState>>,

    invalid_ticks: AtomicU64,
    out_of_order_ticks: AtomicU64,
}

impl CandleBuilder {
    pub fn new(
        bus: Arc<MessageBus>,
        store: Arc<TickStore>,
        timeframes: Vec<Timeframe>,
        instruments: InstrumentMap,
    ) -> Self {
        Self {
            bus,
            store,
            timeframes,
            instruments,
            state: Mutex::new(HashMap::new()),
            invalid_ticks: AtomicU64::new(0),
            out_of_order_ticks: AtomicU64::new(0),
        }
    }

    /// Ingest one tick. Returns the number of bars closed by this tick
    /// (across all timeframes).
    pub fn on_tick(&self, mut tick: Tick) -> usize {
        if !tick.is_finite() || tick.ts <= 0 {
            self.invalid_ticks.fetch_add(1, Ordering::Relaxed);
            warn!(instrument = %tick.instrument, ts = tick.ts, "invalid tick dropped");
            return 0;
        }

        tick.instrument = self.instruments.canonical(&tick.instrument);

        let mut state = self.state.lock();
        let entry = state
            .entry(tick.instrument.clone())
            .or_insert_with(|| InstrumentState {
                last_ts: i64::MIN,
                open_bars: HashMap::new(),
            });

        // Timestamps are monotonic per instrument within a session; a tick
        // older than the last seen one is dropped and counted. Equal
        // timestamps are allowed (several trades in the same millisecond).
        if tick.ts < entry.last_ts {
            self.out_of_order_ticks.fetch_add(1, Ordering::Relaxed);
            warn!(
                instrument = %tick.instrument,
                ts = tick.ts,
                last_ts = entry.last_ts,
                "out-of-order tick dropped"
            );
            return 0;
        }
        entry.last_ts = tick.ts;

        // Latest-tick snapshot and fan-out before bar folding, so the store
        // is never behind what subscribers saw.
        if let Ok(json) = serde_json::to_value(&tick) {
            let _ = self.store.put(&keys::tick_latest(&tick.instrument), &json);
            self.bus.publish(&channels::tick(&tick.instrument), json);
        }

        let mut closed = 0usize;
        for &tf in &self.timeframes {
            let bucket = tf.bucket_start(tick.ts);

            match entry.open_bars.get_mut(&tf) {
                None => {
                    // First tick of the session for this timeframe.
                    let bar = OhlcBar::open_from(&tick, tf, bucket);
                    self.snapshot_current(&bar);
                    entry.open_bars.insert(tf, bar);
                }
                Some(bar) if bucket == bar.start_at => {
                    bar.absorb(&tick);
                    self.snapshot_current(bar);
                }
                Some(bar) => {
                    // Tick landed in a later bucket: close the stale bar at
                    // its last seen values and open a fresh one. Skipped
                    // buckets stay absent.
                    debug_assert!(bucket > bar.start_at);
                    let mut finished = bar.clone();
                    finished.closed = true;
                    self.emit_closed(&finished);
                    closed += 1;

                    let bar = OhlcBar::open_from(&tick, tf, bucket);
                    self.snapshot_current(&bar);
                    entry.open_bars.insert(tf, bar);
                }
            }
        }

        closed
    }

    /// Close every in-flight bar at its last seen values, e.g. at session end.
    /// Returns the number of bars emitted.
    pub fn flush(&self) -> usize {
        let mut state = self.state.lock();
        let mut closed = 0usize;
        for entry in state.values_mut() {
            for (_, mut bar) in entry.open_bars.drain() {
                bar.closed = true;
                self.emit_closed(&bar);
                closed += 1;
            }
        }
        closed
    }

    fn snapshot_current(&self, bar: &OhlcBar) {
        let _ = self
            .store
            .put(&keys::ohlc_current(&bar.instrument, bar.timeframe), bar);
    }

    fn emit_closed(&self, bar: &OhlcBar) {
        debug!(
            instrument = %bar.instrument,
            tf = %bar.timeframe,
            start_at = bar.start_at,
            close = bar.close,
            "bar closed"
        );
        let _ = self.store.put(
            &keys::ohlc_bucket(&bar.instrument, bar.timeframe, bar.start_at),
            bar,
        );
        if let Ok(json) = serde_json::to_value(bar) {
            self.bus
                .publish(&channels::ohlc(&bar.instrument, bar.timeframe), json);
        }
    }

    pub fn invalid_tick_count(&self) -> u64 {
        self.invalid_ticks.load(Ordering::Relaxed)
    }

    pub fn out_of_order_count(&self) -> u64 {
        self.out_of_order_ticks.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CandleBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleBuilder")
            .field("timeframes", &self.timeframes)
            .field("invalid_ticks", &self.invalid_tick_count())
            .field("out_of_order", &self.out_of_order_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn builder_with(timeframes: Vec<Timeframe>) -> (CandleBuilder, Arc<MessageBus>, Arc<TickStore>) {
        let bus = Arc::new(MessageBus::default());
        let store = Arc::new(TickStore::new());
        let builder = CandleBuilder::new(
            bus.clone(),
            store.clone(),
            timeframes,
            InstrumentMap::default(),
        );
        (builder, bus, store)
    }

    fn tick(instrument: &str, ts: i64, price: f64, volume: f64) -> Tick {
        Tick {
            instrument: instrument.into(),
            ts,
            last_price: price,
            volume,
            bid: None,
            ask: None,
            oi: None,
        }
    }

    #[tokio::test]
    async fn minute_ticks_close_one_bar_each() {
        let (builder, bus, _store) = builder_with(vec![Timeframe::M1]);
        let mut bars = bus.subscribe("market:ohlc:INST_X:1m");

        // Six ticks at one-minute spacing: five bars close, the sixth stays
        // in flight.
        let prices = [100.0, 102.0, 101.0, 103.0, 105.0, 104.0];
        let mut closed = 0;
        for (i, &p) in prices.iter().enumerate() {
            closed += builder.on_tick(tick("INST_X", i as i64 * 60_000, p, 10.0));
        }
        assert_eq!(closed, 5);

        let mut closes = Vec::new();
        while let Some(env) = bars.try_recv() {
            let bar: OhlcBar = serde_json::from_value((*env.payload).clone()).unwrap();
            assert!(bar.closed);
            closes.push(bar.close);
        }
        assert_eq!(closes, vec![100.0, 102.0, 101.0, 103.0, 105.0]);
    }

    #[test]
    fn intrabar_ticks_update_ohlc_and_volume() {
        let (builder, _bus, store) = builder_with(vec![Timeframe::M1]);

        builder.on_tick(tick("NIFTY", 1_000, 100.0, 5.0));
        builder.on_tick(tick("NIFTY", 2_000, 104.0, 3.0));
        builder.on_tick(tick("NIFTY", 3_000, 98.0, 2.0));
        builder.on_tick(tick("NIFTY", 4_000, 101.0, 1.0));

        let bar: OhlcBar = store.get(&keys::ohlc_current("NIFTY", Timeframe::M1)).unwrap();
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 104.0);
        assert_eq!(bar.low, 98.0);
        assert_eq!(bar.close, 101.0);
        assert_eq!(bar.volume, 11.0);
        assert!(!bar.closed);
        // Bar invariant: low <= min(open, close) <= max(open, close) <= high.
        assert!(bar.low <= bar.open.min(bar.close));
        assert!(bar.high >= bar.open.max(bar.close));
    }

    #[test]
    fn gap_produces_no_synthetic_bars() {
        let (builder, bus, _store) = builder_with(vec![Timeframe::M1]);
        let mut bars = bus.subscribe("market:ohlc:NIFTY:1m");

        builder.on_tick(tick("NIFTY", 0, 100.0, 1.0));
        // Ten-minute gap: exactly one bar closes, at its last seen values.
        let closed = builder.on_tick(tick("NIFTY", 600_000, 110.0, 1.0));
        assert_eq!(closed, 1);

        let env = bars.try_recv().unwrap();
        let bar: OhlcBar = serde_json::from_value((*env.payload).clone()).unwrap();
        assert_eq!(bar.start_at, 0);
        assert_eq!(bar.close, 100.0);
        assert!(bars.try_recv().is_none(), "no synthetic bars for the gap");
    }

    #[test]
    fn out_of_order_tick_is_dropped_and_counted() {
        let (builder, _bus, store) = builder_with(vec![Timeframe::M1]);

        builder.on_tick(tick("NIFTY", 10_000, 100.0, 1.0));
        builder.on_tick(tick("NIFTY", 5_000, 999.0, 1.0));

        assert_eq!(builder.out_of_order_count(), 1);
        let bar: OhlcBar = store.get(&keys::ohlc_current("NIFTY", Timeframe::M1)).unwrap();
        assert_eq!(bar.close, 100.0);
    }

    #[test]
    fn non_finite_tick_is_dropped_and_counted() {
        let (builder, _bus, store) = builder_with(vec![Timeframe::M1]);
        builder.on_tick(tick("NIFTY", 1_000, f64::NAN, 1.0));

        assert_eq!(builder.invalid_tick_count(), 1);
        assert!(store.get_raw(&keys::tick_latest("NIFTY")).is_none());
    }

    #[test]
    fn multiple_timeframes_close_independently() {
        let (builder, _bus, store) = builder_with(vec![Timeframe::M1, Timeframe::M5]);

        // Four 1m buckets inside one 5m bucket.
        for i in 0..4 {
            builder.on_tick(tick("NIFTY", i * 60_000, 100.0 + i as f64, 1.0));
        }
        // The 5m bar is still open and spans all ticks so far.
        let bar5: OhlcBar = store.get(&keys::ohlc_current("NIFTY", Timeframe::M5)).unwrap();
        assert_eq!(bar5.start_at, 0);
        assert_eq!(bar5.volume, 4.0);
        assert!(!bar5.closed);

        // Crossing the 5m boundary closes both the 1m and the 5m bar.
        let closed = builder.on_tick(tick("NIFTY", 5 * 60_000, 110.0, 1.0));
        assert_eq!(closed, 2);

        let stored: OhlcBar = store
            .get(&keys::ohlc_bucket("NIFTY", Timeframe::M5, 0))
            .unwrap();
        assert!(stored.closed);
        assert_eq!(stored.close, 103.0);
    }

    #[test]
    fn tick_snapshot_and_fanout_use_canonical_name() {
        let mut aliases = HashMap::new();
        aliases.insert("NSE:NIFTY50".to_string(), "NIFTY".to_string());
        let bus = Arc::new(MessageBus::default());
        let store = Arc::new(TickStore::new());
        let builder = CandleBuilder::new(
            bus.clone(),
            store.clone(),
            vec![Timeframe::M1],
            InstrumentMap::new(aliases),
        );
        let mut sub = bus.subscribe("market:tick:NIFTY");

        builder.on_tick(tick("nse:nifty50", 1_000, 100.0, 1.0));

        assert!(store.get_raw(&keys::tick_latest("NIFTY")).is_some());
        assert!(sub.try_recv().is_some());
    }

    #[test]
    fn flush_closes_in_flight_bars() {
        let (builder, bus, _store) = builder_with(vec![Timeframe::M1, Timeframe::M5]);
        let mut bars = bus.subscribe("market:ohlc:**");

        builder.on_tick(tick("NIFTY", 1_000, 100.0, 1.0));
        assert_eq!(builder.flush(), 2);
        assert!(bars.try_recv().is_some());
    }
}
