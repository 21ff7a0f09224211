// =============================================================================
// Momentum agent -- RSI extremes confirmed by MACD histogram
// =============================================================================
//
// BUY when RSI is oversold, SELL when overbought; the MACD histogram pointing
// the same way raises confidence, pointing the other way halves it. In the
// neutral band the agent votes HOLD with low confidence rather than
// abstaining, so a quiet tape still pulls decisions toward inaction.
// =============================================================================

use async_trait::async_trait;
use serde_json::json;

use crate::engine::agents::{protective_levels, Agent};
use crate::engine::context::AnalysisContext;
use crate::engine::decision::AgentVerdict;
use crate::signal::condition::{CmpOp, Condition};
use crate::types::TradeAction;

const OVERSOLD: f64 = 30.0;
const OVERBOUGHT: f64 = 70.0;

pub struct MomentumAgent;

impl MomentumAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MomentumAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for MomentumAgent {
    fn id(&self) -> &str {
        "momentum"
    }

    async fn analyze(&self, ctx: &AnalysisContext) -> Option<AgentVerdict> {
        let indicators = ctx.indicators.as_ref()?;
        let rsi = indicators.rsi_14?;
        let price = ctx.last_price()?;

        let hist = indicators.macd_hist;

        let (action, mut confidence, reasoning) = if rsi <= OVERSOLD {
            (
                TradeAction::Buy,
                ((OVERSOLD - rsi) / OVERSOLD).min(1.0),
                format!("RSI {rsi:.1} oversold"),
            )
        } else if rsi >= OVERBOUGHT {
            (
                TradeAction::Sell,
                ((rsi - OVERBOUGHT) / (100.0 - OVERBOUGHT)).min(1.0),
                format!("RSI {rsi:.1} overbought"),
            )
        } else {
            (
                TradeAction::Hold,
                0.3,
                format!("RSI {rsi:.1} neutral"),
            )
        };

        // MACD histogram as confirmation.
        if let Some(hist) = hist {
            let aligned = match action {
                TradeAction::Buy => hist > 0.0,
                TradeAction::Sell => hist < 0.0,
                _ => true,
            };
            if action != TradeAction::Hold {
                confidence = if aligned {
                    (confidence + 0.2).min(1.0)
                } else {
                    confidence * 0.5
                };
            }
        }

        let mut verdict = AgentVerdict::new(self.id(), &ctx.instrument, action, confidence, reasoning);
        verdict.features.insert("rsi_14".into(), json!(rsi));
        if let Some(hist) = hist {
            verdict.features.insert("macd_hist".into(), json!(hist));
        }

        if action != TradeAction::Hold {
            let long = action == TradeAction::Buy;
            let (sl, tp) = protective_levels(price, indicators.atr_14, long);
            verdict.entry_price = None; // market-style entry
            verdict.stop_loss = sl;
            verdict.take_profit = tp;
            // Enter once momentum actually turns: MACD line crossing its
            // signal in our direction.
            verdict.condition = Some(if long {
                Condition::Any {
                    any: vec![
                        Condition::CrossUp {
                            fast: "macd_value".into(),
                            slow: "macd_signal".into(),
                        },
                        Condition::Leaf {
                            field: "rsi_14".into(),
                            op: CmpOp::Ge,
                            value: OVERSOLD,
                        },
                    ],
                }
            } else {
                Condition::Any {
                    any: vec![
                        Condition::CrossDown {
                            fast: "macd_value".into(),
                            slow: "macd_signal".into(),
                        },
                        Condition::Leaf {
                            field: "rsi_14".into(),
                            op: CmpOp::Le,
                            value: OVERBOUGHT,
                        },
                    ],
                }
            });
        }

        Some(verdict)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::IndicatorSet;
    use crate::market_data::OhlcBar;
    use crate::types::Timeframe;

    fn context(rsi: Option<f64>, hist: Option<f64>) -> AnalysisContext {
        let set = IndicatorSet {
            instrument: "NIFTY".into(),
            timeframe: Timeframe::M5,
            ts: 0,
            rsi_14: rsi,
            macd_value: None,
            macd_signal: None,
            macd_hist: hist,
            atr_14: Some(20.0),
            sma_20: None,
            sma_50: None,
            ema_20: None,
            ema_50: None,
            bb_upper: None,
            bb_mid: None,
            bb_lower: None,
            adx_14: None,
            vwap: None,
            volume_sma: None,
            volume_ratio: None,
        };
        AnalysisContext {
            instrument: "NIFTY".into(),
            timeframe: Timeframe::M5,
            bars: vec![OhlcBar {
                instrument: "NIFTY".into(),
                timeframe: Timeframe::M5,
                open: 22_000.0,
                high: 22_010.0,
                low: 21_990.0,
                close: 22_000.0,
                volume: 100.0,
                start_at: 0,
                closed: true,
            }],
            indicators: Some(set),
            last_tick: None,
            open_positions: Vec::new(),
            market_regime: None,
            now_ms: 0,
        }
    }

    #[tokio::test]
    async fn abstains_without_rsi() {
        let agent = MomentumAgent::new();
        assert!(agent.analyze(&context(None, None)).await.is_none());
    }

    #[tokio::test]
    async fn oversold_with_confirmation_buys() {
        let agent = MomentumAgent::new();
        let verdict = agent.analyze(&context(Some(20.0), Some(1.5))).await.unwrap();
        assert_eq!(verdict.action, TradeAction::Buy);
        assert!(verdict.confidence > 0.4);
        assert!(verdict.condition.is_some());
        assert!(verdict.stop_loss.unwrap() < 22_000.0);
        assert!(verdict.take_profit.unwrap() > 22_000.0);
    }

    #[tokio::test]
    async fn contradicting_histogram_halves_confidence() {
        let agent = MomentumAgent::new();
        let confirmed = agent.analyze(&context(Some(20.0), Some(1.0))).await.unwrap();
        let contradicted = agent.analyze(&context(Some(20.0), Some(-1.0))).await.unwrap();
        assert!(contradicted.confidence < confirmed.confidence);
    }

    #[tokio::test]
    async fn overbought_sells() {
        let agent = MomentumAgent::new();
        let verdict = agent.analyze(&context(Some(85.0), Some(-0.5))).await.unwrap();
        assert_eq!(verdict.action, TradeAction::Sell);
        assert!(verdict.stop_loss.unwrap() > 22_000.0);
    }

    #[tokio::test]
    async fn neutral_band_holds_with_low_confidence() {
        let agent = MomentumAgent::new();
        let verdict = agent.analyze(&context(Some(50.0), None)).await.unwrap();
        assert_eq!(verdict.action, TradeAction::Hold);
        assert!(verdict.confidence <= 0.3);
        assert!(verdict.condition.is_none());
    }
}
