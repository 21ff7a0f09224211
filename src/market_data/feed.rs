// =============================================================================
// Tick feeds -- upstream sources that drive the pipeline
// =============================================================================
//
// The engine consumes ticks through the `TickSource` contract. Two sources
// ship with the engine:
//
// - `ReplayFeed`: reads a JSON-lines tick file and replays it at a speed
//   multiplier, advancing the virtual clock in step with tick timestamps so
//   every timer in the engine moves in replay time.
// - `VendorSocketFeed`: a generic JSON-over-WebSocket vendor stream. Runs
//   until the stream ends or errors; the caller owns the reconnect loop.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::clock::VirtualClock;
use crate::market_data::candle_builder::CandleBuilder;
use crate::market_data::tick::Tick;

/// An upstream tick provider. Implementations push every tick into the
/// builder and return when the source is exhausted or the connection dies.
#[async_trait]
pub trait TickSource: Send + Sync {
    async fn run(&self, builder: Arc<CandleBuilder>) -> Result<()>;
}

// =============================================================================
// ReplayFeed
// =============================================================================

/// Historical replay from a JSON-lines file (one `Tick` per line).
pub struct ReplayFeed {
    path: String,
    /// Wall-time speed multiplier. `None` replays as fast as possible.
    speed: Option<f64>,
    clock: Arc<VirtualClock>,
}

impl ReplayFeed {
    pub fn new(path: impl Into<String>, speed: Option<f64>, clock: Arc<VirtualClock>) -> Self {
        Self {
            path: path.into(),
            speed: speed.filter(|s| *s > 0.0),
            clock,
        }
    }
}

#[async_trait]
impl TickSource for ReplayFeed {
    async fn run(&self, builder: Arc<CandleBuilder>) -> Result<()> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read replay file {}", self.path))?;

        info!(path = %self.path, speed = ?self.speed, "replay feed starting");

        let mut fed = 0u64;
        let mut skipped = 0u64;
        let mut prev_ts: Option<i64> = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let tick: Tick = match serde_json::from_str(line) {
                Ok(t) => t,
                Err(e) => {
                    skipped += 1;
                    warn!(error = %e, "replay line failed to parse -- skipped");
                    continue;
                }
            };

            // Pace the replay in wall time when a multiplier is configured.
            if let (Some(speed), Some(prev)) = (self.speed, prev_ts) {
                let gap_ms = (tick.ts - prev).max(0) as f64 / speed;
                if gap_ms >= 1.0 {
                    tokio::time::sleep(Duration::from_millis(gap_ms as u64)).await;
                }
            }
            prev_ts = Some(tick.ts);

            // Virtual time tracks the replayed timestamps.
            self.clock.advance_to(tick.ts);
            builder.on_tick(tick);
            fed += 1;
        }

        info!(fed, skipped, "replay feed finished");
        Ok(())
    }
}

// =============================================================================
// VendorSocketFeed
// =============================================================================

/// Generic vendor tick stream: JSON text frames over a WebSocket.
///
/// Expected frame shape (numbers may arrive as JSON strings, which several
/// vendors do):
///
/// ```json
/// { "instrument": "NIFTY", "ts": 1700000000000, "last_price": "22150.5",
///   "volume": "75", "bid": "22150.0", "ask": "22151.0", "oi": 12000 }
/// ```
pub struct VendorSocketFeed {
    url: String,
}

impl VendorSocketFeed {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl TickSource for VendorSocketFeed {
    async fn run(&self, builder: Arc<CandleBuilder>) -> Result<()> {
        info!(url = %self.url, "connecting to vendor tick stream");

        let (ws_stream, _response) = connect_async(&self.url)
            .await
            .context("failed to connect to vendor tick stream")?;
        info!(url = %self.url, "vendor tick stream connected");

        let (_write, mut read) = ws_stream.split();

        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                        match parse_tick_frame(&text) {
                            Ok(tick) => {
                                debug!(
                                    instrument = %tick.instrument,
                                    price = tick.last_price,
                                    "tick received"
                                );
                                builder.on_tick(tick);
                            }
                            Err(e) => {
                                warn!(error = %e, "failed to parse tick frame");
                            }
                        }
                    }
                    // Ping/Pong/Binary/Close frames are handled by tungstenite.
                }
                Some(Err(e)) => {
                    warn!(error = %e, "vendor tick stream read error");
                    return Err(e.into());
                }
                None => {
                    warn!(url = %self.url, "vendor tick stream ended");
                    return Ok(());
                }
            }
        }
    }
}

/// Parse one vendor tick frame.
fn parse_tick_frame(text: &str) -> Result<Tick> {
    let root: Value = serde_json::from_str(text).context("failed to parse tick JSON")?;

    let instrument = root["instrument"]
        .as_str()
        .or_else(|| root["symbol"].as_str())
        .context("missing field instrument")?
        .to_string();

    let ts = root["ts"].as_i64().context("missing field ts")?;

    Ok(Tick {
        instrument,
        ts,
        last_price: field_f64(&root, "last_price")?,
        volume: field_f64(&root, "volume").unwrap_or(0.0),
        bid: field_f64(&root, "bid").ok(),
        ask: field_f64(&root, "ask").ok(),
        oi: field_f64(&root, "oi").ok(),
    })
}

/// Vendors send numerics either as numbers or as strings.
fn field_f64(root: &Value, name: &str) -> Result<f64> {
    match &root[name] {
        Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} missing or has unexpected JSON type"),
    }
}
