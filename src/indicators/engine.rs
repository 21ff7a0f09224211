// =============================================================================
// Indicator Engine -- rolling windows, recompute on bar close
// =============================================================================
//
// Subscribes to `market:ohlc:*:*`, appends every closed bar to a per
// (instrument, timeframe) ring buffer, recomputes the full IndicatorSet and
// publishes it on `indicators:{instrument}:{tf}` plus the store snapshot.
// In-flight bars never reach this engine; the candle builder only publishes
// closed bars.
//
// VWAP accumulates since session start; the session rolls at a configurable
// UTC-offset midnight (IST by default).
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bus::{channels, MessageBus, Subscription};
use crate::indicators::{adx, atr, bollinger, ema, macd, rsi, sma, vwap, IndicatorSet};
use crate::market_data::OhlcBar;
use crate::store::{keys, TickStore};
use crate::types::Timeframe;

/// Closed bars retained per (instrument, timeframe). Sized for the largest
/// window (ADX 14 needs 29 bars, MACD needs 34) with generous headroom.
const MAX_BARS: usize = 200;

struct SeriesState {
    bars: VecDeque<OhlcBar>,
    session_day: i64,
    cum_pv: f64,
    cum_vol: f64,
}

impl SeriesState {
    fn new() -> Self {
        Self {
            bars: VecDeque::with_capacity(MAX_BARS + 1),
            session_day: i64::MIN,
            cum_pv: 0.0,
            cum_vol: 0.0,
        }
    }
}

/// Maintains rolling windows and computes the named indicator set on every
/// bar close.
pub struct IndicatorEngine {
    bus: Arc<MessageBus>,
    store: Arc<TickStore>,
    session_offset_minutes: i64,
    series: Mutex<HashMap<(String, Timeframe), SeriesState>>,
}

impl IndicatorEngine {
    pub fn new(bus: Arc<MessageBus>, store: Arc<TickStore>, session_offset_minutes: i64) -> Self {
        Self {
            bus,
            store,
            session_offset_minutes,
            series: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to the bar stream. Split from `run` so callers can create
    /// the subscription before the first bar is published.
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe("market:ohlc:*:*")
    }

    /// Consume closed bars until the subscription ends or shutdown fires.
    pub async fn run(
        self: Arc<Self>,
        mut bars: Subscription,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!("indicator engine started");
        loop {
            tokio::select! {
                env = bars.recv() => {
                    let Some(env) = env else { break };
                    let bar: OhlcBar = match serde_json::from_value((*env.payload).clone()) {
                        Ok(b) => b,
                        Err(e) => {
                            warn!(channel = %env.channel, error = %e, "bad bar payload");
                            continue;
                        }
                    };
                    self.on_bar(bar);
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("indicator engine stopped");
    }

    /// Fold one closed bar into the window and publish the recomputed set.
    /// Returns the set for direct (non-bus) callers; `None` if the bar was
    /// not closed.
    pub fn on_bar(&self, bar: OhlcBar) -> Option<IndicatorSet> {
        if !bar.closed {
            return None;
        }

        let key = (bar.instrument.clone(), bar.timeframe);
        let mut series = self.series.lock();
        let state = series.entry(key).or_insert_with(SeriesState::new);

        // Session roll: reset the VWAP accumulators.
        let day = vwap::session_day(bar.start_at, self.session_offset_minutes);
        if day != state.session_day {
            state.session_day = day;
            state.cum_pv = 0.0;
            state.cum_vol = 0.0;
        }
        let typical = (bar.high + bar.low + bar.close) / 3.0;
        state.cum_pv += typical * bar.volume;
        state.cum_vol += bar.volume;

        state.bars.push_back(bar.clone());
        while state.bars.len() > MAX_BARS {
            state.bars.pop_front();
        }

        let set = compute_set(state, &bar);
        drop(series);

        debug!(
            instrument = %set.instrument,
            tf = %set.timeframe,
            ts = set.ts,
            rsi = ?set.rsi_14,
            "indicators recomputed"
        );

        let _ = self.store.put(
            &keys::indicators_latest(&set.instrument, set.timeframe),
            &set,
        );
        if let Ok(json) = serde_json::to_value(&set) {
            self.bus
                .publish(&channels::indicators(&set.instrument, set.timeframe), json);
        }
        Some(set)
    }
}

/// Recompute the full set from the current window.
fn compute_set(state: &SeriesState, bar: &OhlcBar) -> IndicatorSet {
    let bars: Vec<OhlcBar> = state.bars.iter().cloned().collect();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

    let macd_out = macd::macd(&closes);
    let bb = bollinger::bollinger(&closes, 20, 2.0);

    let volume_sma = sma::sma(&volumes, 20);
    let volume_ratio = volume_sma.and_then(|vs| {
        if vs > 0.0 {
            let ratio = bar.volume / vs;
            ratio.is_finite().then_some(ratio)
        } else {
            None
        }
    });

    let session_vwap = if state.cum_vol > 0.0 {
        let v = state.cum_pv / state.cum_vol;
        v.is_finite().then_some(v)
    } else {
        None
    };

    IndicatorSet {
        instrument: bar.instrument.clone(),
        timeframe: bar.timeframe,
        ts: bar.start_at + bar.timeframe.duration_ms(),
        rsi_14: rsi::rsi(&closes, 14),
        macd_value: macd_out.map(|m| m.value),
        macd_signal: macd_out.map(|m| m.signal),
        macd_hist: macd_out.map(|m| m.hist),
        atr_14: atr::atr(&bars, 14),
        sma_20: sma::sma(&closes, 20),
        sma_50: sma::sma(&closes, 50),
        ema_20: ema::ema(&closes, 20),
        ema_50: ema::ema(&closes, 50),
        bb_upper: bb.map(|b| b.upper),
        bb_mid: bb.map(|b| b.mid),
        bb_lower: bb.map(|b| b.lower),
        adx_14: adx::adx(&bars, 14),
        vwap: session_vwap,
        volume_sma,
        volume_ratio,
    }
}

impl std::fmt::Debug for IndicatorEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndicatorEngine")
            .field("series", &self.series.lock().len())
            .finish()
    }
}
