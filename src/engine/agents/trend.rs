// =============================================================================
// Trend agent -- EMA stack alignment gated by ADX strength
// =============================================================================
//
// BUY when EMA20 > EMA50 with price above the fast EMA and ADX showing a real
// trend; SELL on the mirror image. Without ADX strength the agent only ever
// holds: chasing an unconfirmed stack is how ranging sessions eat accounts.
// =============================================================================

use async_trait::async_trait;
use serde_json::json;

use crate::engine::agents::{protective_levels, Agent};
use crate::engine::context::AnalysisContext;
use crate::engine::decision::AgentVerdict;
use crate::signal::condition::{CmpOp, Condition};
use crate::types::TradeAction;

const ADX_FLOOR: f64 = 20.0;
const ADX_STRONG: f64 = 40.0;

pub struct TrendAgent;

impl TrendAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TrendAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for TrendAgent {
    fn id(&self) -> &str {
        "trend"
    }

    async fn analyze(&self, ctx: &AnalysisContext) -> Option<AgentVerdict> {
        let indicators = ctx.indicators.as_ref()?;
        let ema_20 = indicators.ema_20?;
        let ema_50 = indicators.ema_50?;
        let adx = indicators.adx_14?;
        let price = ctx.last_price()?;

        let bullish = ema_20 > ema_50 && price > ema_20;
        let bearish = ema_20 < ema_50 && price < ema_20;

        // Strength in [0, 1] from the ADX band [floor, strong].
        let strength = ((adx - ADX_FLOOR) / (ADX_STRONG - ADX_FLOOR)).clamp(0.0, 1.0);

        let (action, confidence, reasoning) = if adx < ADX_FLOOR || (!bullish && !bearish) {
            (
                TradeAction::Hold,
                0.3,
                format!("no aligned trend (adx {adx:.1})"),
            )
        } else if bullish {
            (
                TradeAction::Buy,
                0.4 + 0.6 * strength,
                format!("bullish EMA stack, adx {adx:.1}"),
            )
        } else {
            (
                TradeAction::Sell,
                0.4 + 0.6 * strength,
                format!("bearish EMA stack, adx {adx:.1}"),
            )
        };

        let mut verdict = AgentVerdict::new(self.id(), &ctx.instrument, action, confidence, reasoning);
        verdict.features.insert("ema_20".into(), json!(ema_20));
        verdict.features.insert("ema_50".into(), json!(ema_50));
        verdict.features.insert("adx_14".into(), json!(adx));

        if action != TradeAction::Hold {
            let long = action == TradeAction::Buy;
            let (sl, tp) = protective_levels(price, indicators.atr_14, long);
            verdict.stop_loss = sl;
            verdict.take_profit = tp;
            // Enter only while price holds the fast EMA (value baked at
            // analysis time -- the trigger must be tick-evaluable).
            verdict.condition = Some(Condition::Leaf {
                field: "price".into(),
                op: if long { CmpOp::Ge } else { CmpOp::Le },
                value: ema_20,
            });
        }

        Some(verdict)
    }
}
