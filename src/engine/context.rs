// =============================================================================
// AnalysisContext -- the consistent snapshot handed to every agent
// =============================================================================
//
// Built once at the start of each orchestrator cycle from the store and the
// position book; agents only ever see this frozen view, never live state.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::execution::positions::Position;
use crate::indicators::IndicatorSet;
use crate::market_data::{OhlcBar, Tick};
use crate::types::Timeframe;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisContext {
    pub instrument: String,
    /// Primary analysis timeframe the bars below belong to.
    pub timeframe: Timeframe,
    /// Latest closed bars, oldest first.
    pub bars: Vec<OhlcBar>,
    pub indicators: Option<IndicatorSet>,
    pub last_tick: Option<Tick>,
    pub open_positions: Vec<Position>,
    /// Opaque regime hint ("trending", "ranging", "volatile").
    pub market_regime: Option<String>,
    /// Cycle start on the engine clock.
    pub now_ms: i64,
}

impl AnalysisContext {
    /// Closes of the snapshot bars, oldest first.
    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    /// Best known price: the latest tick, falling back to the last close.
    pub fn last_price(&self) -> Option<f64> {
        self.last_tick
            .as_ref()
            .map(|t| t.last_price)
            .or_else(|| self.bars.last().map(|b| b.close))
    }
}
