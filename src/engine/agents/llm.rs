// =============================================================================
// LLM agent -- language-model analysis with a deterministic fallback
// =============================================================================
//
// The agent summarizes the analysis context into a compact prompt and expects
// a JSON verdict back: {"action": "BUY", "confidence": 0.7, "reasoning": "…"}.
// Any failure along the way (no client configured, transport error, garbage
// response) falls back to a simple deterministic rule so the agent still
// casts a vote. The orchestrator's per-agent timeout handles a hung provider.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::engine::agents::Agent;
use crate::engine::context::AnalysisContext;
use crate::engine::decision::AgentVerdict;
use crate::types::TradeAction;

const MAX_TOKENS: u32 = 256;
const TEMPERATURE: f64 = 0.2;

/// Generic completion endpoint the agent talks to.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, prompt: &str, max_tokens: u32, temperature: f64) -> Result<String>;
}

// =============================================================================
// HttpLlmClient
// =============================================================================

/// Minimal JSON-over-HTTP completion client:
/// POST {prompt, max_tokens, temperature} -> {"text": "..."}.
pub struct HttpLlmClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpLlmClient {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            api_key,
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate(&self, prompt: &str, max_tokens: u32, temperature: f64) -> Result<String> {
        let body = json!({
            "prompt": prompt,
            "max_tokens": max_tokens,
            "temperature": temperature,
        });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .context("llm request failed")?
            .error_for_status()
            .context("llm endpoint returned an error status")?;

        let parsed: Value = response.json().await.context("llm response was not JSON")?;
        parsed["text"]
            .as_str()
            .map(str::to_string)
            .context("llm response missing 'text' field")
    }
}

// =============================================================================
// LlmAgent
// =============================================================================

pub struct LlmAgent {
    client: Option<Arc<dyn LlmClient>>,
}

impl LlmAgent {
    pub fn new(client: Option<Arc<dyn LlmClient>>) -> Self {
        Self { client }
    }

    fn build_prompt(ctx: &AnalysisContext) -> String {
        let indicator_summary = ctx
            .indicators
            .as_ref()
            .map(|set| serde_json::to_string(&set.fields()).unwrap_or_default())
            .unwrap_or_else(|| "{}".to_string());

        format!(
            "You are a trading analyst for Indian index derivatives.\n\
             Instrument: {} ({} bars, timeframe {}).\n\
             Last price: {:?}. Regime: {}. Open positions: {}.\n\
             Indicators: {}\n\
             Reply with one JSON object only: \
             {{\"action\": \"BUY|SELL|HOLD|EXIT\", \"confidence\": 0.0-1.0, \"reasoning\": \"...\"}}",
            ctx.instrument,
            ctx.bars.len(),
            ctx.timeframe,
            ctx.last_price(),
            ctx.market_regime.as_deref().unwrap_or("unknown"),
            ctx.open_positions.len(),
            indicator_summary,
        )
    }

    /// Parse the model's reply, tolerating surrounding prose.
    fn parse_reply(instrument: &str, text: &str) -> Option<AgentVerdict> {
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        let parsed: Value = serde_json::from_str(&text[start..=end]).ok()?;

        let action = match parsed["action"].as_str()? {
            "BUY" => TradeAction::Buy,
            "SELL" => TradeAction::Sell,
            "HOLD" => TradeAction::Hold,
            "EXIT" => TradeAction::Exit,
            _ => return None,
        };
        let confidence = parsed["confidence"].as_f64()?;
        if !confidence.is_finite() {
            return None;
        }
        let reasoning = parsed["reasoning"].as_str().unwrap_or("").to_string();

        Some(AgentVerdict::new("llm", instrument, action, confidence, reasoning))
    }

    /// Deterministic rule used whenever the model is unavailable: side with
    /// the price relative to VWAP, weakly.
    fn fallback(ctx: &AnalysisContext) -> Option<AgentVerdict> {
        let indicators = ctx.indicators.as_ref()?;
        let vwap = indicators.vwap?;
        let price = ctx.last_price()?;

        let (action, reasoning) = if price > vwap {
            (TradeAction::Buy, format!("price {price:.1} above vwap {vwap:.1}"))
        } else if price < vwap {
            (TradeAction::Sell, format!("price {price:.1} below vwap {vwap:.1}"))
        } else {
            (TradeAction::Hold, "price at vwap".to_string())
        };

        let mut verdict = AgentVerdict::new("llm", &ctx.instrument, action, 0.35, reasoning);
        verdict
            .features
            .insert("fallback".into(), Value::Bool(true));
        Some(verdict)
    }
}

#[async_trait]
impl Agent for LlmAgent {
    fn id(&self) -> &str {
        "llm"
    }

    async fn analyze(&self, ctx: &AnalysisContext) -> Option<AgentVerdict> {
        let Some(client) = &self.client else {
            return Self::fallback(ctx);
        };

        let prompt = Self::build_prompt(ctx);
        match client.generate(&prompt, MAX_TOKENS, TEMPERATURE).await {
            Ok(text) => match Self::parse_reply(&ctx.instrument, &text) {
                Some(verdict) => {
                    debug!(instrument = %ctx.instrument, action = %verdict.action, "llm verdict");
                    Some(verdict)
                }
                None => {
                    warn!(instrument = %ctx.instrument, "llm reply unparseable -- using fallback");
                    Self::fallback(ctx)
                }
            },
            Err(e) => {
                warn!(instrument = %ctx.instrument, error = %e, "llm call failed -- using fallback");
                Self::fallback(ctx)
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::IndicatorSet;
    use crate::market_data::Tick;
    use crate::types::Timeframe;

    struct CannedLlm {
        reply: Result<String, String>,
    }

    #[async_trait]
    impl LlmClient for CannedLlm {
        async fn generate(&self, _p: &str, _m: u32, _t: f64) -> Result<String> {
            self.reply
                .clone()
                .map_err(|e| anyhow::anyhow!(e))
        }
    }

    fn context(price: f64, vwap: Option<f64>) -> AnalysisContext {
        let set = IndicatorSet {
            instrument: "NIFTY".into(),
            timeframe: Timeframe::M5,
            ts: 0,
            rsi_14: Some(55.0),
            macd_value: None,
            macd_signal: None,
            macd_hist: None,
            atr_14: None,
            sma_20: None,
            sma_50: None,
            ema_20: None,
            ema_50: None,
            bb_upper: None,
            bb_mid: None,
            bb_lower: None,
            adx_14: None,
            vwap,
            volume_sma: None,
            volume_ratio: None,
        };
        AnalysisContext {
            instrument: "NIFTY".into(),
            timeframe: Timeframe::M5,
            bars: Vec::new(),
            indicators: Some(set),
            last_tick: Some(Tick {
                instrument: "NIFTY".into(),
                ts: 1,
                last_price: price,
                volume: 1.0,
                bid: None,
                ask: None,
                oi: None,
            }),
            open_positions: Vec::new(),
            market_regime: Some("trending".into()),
            now_ms: 0,
        }
    }

    #[tokio::test]
    async fn parses_model_verdict() {
        let agent = LlmAgent::new(Some(Arc::new(CannedLlm {
            reply: Ok(r#"Here you go: {"action":"BUY","confidence":0.7,"reasoning":"strong flow"}"#.into()),
        })));
        let verdict = agent.analyze(&context(100.0, Some(99.0))).await.unwrap();
        assert_eq!(verdict.action, TradeAction::Buy);
        assert_eq!(verdict.confidence, 0.7);
        assert_eq!(verdict.reasoning, "strong flow");
    }

    #[tokio::test]
    async fn transport_failure_falls_back() {
        let agent = LlmAgent::new(Some(Arc::new(CannedLlm {
            reply: Err("connection refused".into()),
        })));
        let verdict = agent.analyze(&context(105.0, Some(100.0))).await.unwrap();
        assert_eq!(verdict.action, TradeAction::Buy);
        assert_eq!(verdict.features.get("fallback"), Some(&Value::Bool(true)));
    }

    #[tokio::test]
    async fn garbage_reply_falls_back() {
        let agent = LlmAgent::new(Some(Arc::new(CannedLlm {
            reply: Ok("I cannot advise on financial matters.".into()),
        })));
        let verdict = agent.analyze(&context(95.0, Some(100.0))).await.unwrap();
        assert_eq!(verdict.action, TradeAction::Sell);
    }

    #[tokio::test]
    async fn no_client_uses_fallback_directly() {
        let agent = LlmAgent::new(None);
        let verdict = agent.analyze(&context(100.0, Some(100.0))).await.unwrap();
        assert_eq!(verdict.action, TradeAction::Hold);
    }

    #[tokio::test]
    async fn fallback_abstains_without_vwap() {
        let agent = LlmAgent::new(None);
        assert!(agent.analyze(&context(100.0, None)).await.is_none());
    }
}
