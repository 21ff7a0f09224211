// =============================================================================
// Breakout agent -- Bollinger band breaks confirmed by volume
// =============================================================================
//
// BUY when price closes above the upper band on expanded volume, SELL below
// the lower band. A break on thin volume is discounted hard; most of those
// are stop-runs that mean-revert within a few bars.
// =============================================================================

use async_trait::async_trait;
use serde_json::json;

use crate::engine::agents::{protective_levels, Agent};
use crate::engine::context::AnalysisContext;
use crate::engine::decision::AgentVerdict;
use crate::signal::condition::{CmpOp, Condition};
use crate::types::TradeAction;

const VOLUME_CONFIRM: f64 = 1.2;

pub struct BreakoutAgent;

impl BreakoutAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BreakoutAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for BreakoutAgent {
    fn id(&self) -> &str {
        "breakout"
    }

    async fn analyze(&self, ctx: &AnalysisContext) -> Option<AgentVerdict> {
        let indicators = ctx.indicators.as_ref()?;
        let upper = indicators.bb_upper?;
        let lower = indicators.bb_lower?;
        let mid = indicators.bb_mid?;
        let price = ctx.last_price()?;

        let volume_ratio = indicators.volume_ratio.unwrap_or(1.0);
        let band_width = (upper - lower).max(f64::EPSILON);

        let (action, mut confidence, reasoning, trigger_level, trigger_op) = if price > upper {
            let excess = ((price - upper) / band_width).min(1.0);
            (
                TradeAction::Buy,
                0.4 + 0.4 * excess,
                format!("price {price:.1} above upper band {upper:.1}"),
                upper,
                CmpOp::Ge,
            )
        } else if price < lower {
            let excess = ((lower - price) / band_width).min(1.0);
            (
                TradeAction::Sell,
                0.4 + 0.4 * excess,
                format!("price {price:.1} below lower band {lower:.1}"),
                lower,
                CmpOp::Le,
            )
        } else {
            (
                TradeAction::Hold,
                0.25,
                format!("price {price:.1} inside bands"),
                mid,
                CmpOp::Ge,
            )
        };

        if action != TradeAction::Hold {
            confidence = if volume_ratio >= VOLUME_CONFIRM {
                (confidence + 0.15).min(1.0)
            } else {
                confidence * 0.4
            };
        }

        let mut verdict = AgentVerdict::new(self.id(), &ctx.instrument, action, confidence, reasoning);
        verdict.features.insert("bb_upper".into(), json!(upper));
        verdict.features.insert("bb_lower".into(), json!(lower));
        verdict.features.insert("volume_ratio".into(), json!(volume_ratio));

        if action != TradeAction::Hold {
            let long = action == TradeAction::Buy;
            let (sl, tp) = protective_levels(price, indicators.atr_14, long);
            verdict.stop_loss = sl;
            verdict.take_profit = tp;
            // Trigger only while the break holds beyond the band level.
            verdict.condition = Some(Condition::Leaf {
                field: "price".into(),
                op: trigger_op,
                value: trigger_level,
            });
        }

        Some(verdict)
    }
}
