// =============================================================================
// Agents -- specialized analyzers behind one contract
// =============================================================================
//
// Every agent implements `analyze(context) -> Option<AgentVerdict>`. `None`
// is abstention. Agents are stateless across cycles: anything rolling lives
// in the indicator engine, not here. Agent construction goes through the
// registry so configuration refers to agents by name only.

pub mod breakout;
pub mod llm;
pub mod momentum;
pub mod trend;

use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::context::AnalysisContext;
use crate::engine::decision::AgentVerdict;

pub use llm::{HttpLlmClient, LlmClient};

/// One analyzer. Implementations must be cheap to call every cycle and must
/// never panic on missing data -- abstain instead.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;
    async fn analyze(&self, ctx: &AnalysisContext) -> Option<AgentVerdict>;
}

/// Names the registry accepts.
pub const KNOWN_AGENTS: [&str; 4] = ["momentum", "trend", "breakout", "llm"];

/// Map an agent name to its constructor. Unknown names return `None`; the
/// caller treats that as a configuration error at startup.
pub fn build(name: &str, llm_client: Option<Arc<dyn LlmClient>>) -> Option<Arc<dyn Agent>> {
    match name {
        "momentum" => Some(Arc::new(momentum::MomentumAgent::new())),
        "trend" => Some(Arc::new(trend::TrendAgent::new())),
        "breakout" => Some(Arc::new(breakout::BreakoutAgent::new())),
        "llm" => Some(Arc::new(llm::LlmAgent::new(llm_client))),
        _ => None,
    }
}

// =============================================================================
// Shared level helpers
// =============================================================================

/// Stop/target distances from ATR, with the floors the engine always applies.
pub(crate) fn protective_levels(
    entry: f64,
    atr: Option<f64>,
    long: bool,
) -> (Option<f64>, Option<f64>) {
    let Some(atr) = atr.filter(|a| *a > 0.0) else {
        return (None, None);
    };
    let sl_dist = (atr * 1.5).max(entry * 0.002);
    let tp_dist = (atr * 2.5).max(entry * 0.004);
    if long {
        (Some(entry - sl_dist), Some(entry + tp_dist))
    } else {
        (Some(entry + sl_dist), Some(entry - tp_dist))
    }
}
