// =============================================================================
// Market Data Module
// =============================================================================
//
// Tick ingestion and OHLC derivation:
// - Tick model and vendor-symbol canonicalization
// - CandleBuilder: ticks -> bars per configured timeframe
// - Feeds: replay from file, generic vendor WebSocket

pub mod candle_builder;
pub mod feed;
pub mod tick;

pub use candle_builder::{CandleBuilder, OhlcBar};
pub use feed::{ReplayFeed, TickSource, VendorSocketFeed};
pub use tick::{InstrumentMap, Tick};
