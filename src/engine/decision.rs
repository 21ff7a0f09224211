// =============================================================================
// Decision types -- agent verdicts and the aggregated trading decision
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::signal::condition::Condition;
use crate::types::TradeAction;

/// What the aggregated decision does to the position set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionAction {
    OpenNew,
    AddToLong,
    AddToShort,
    CloseLong,
    CloseShort,
    None,
}

impl std::fmt::Display for PositionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenNew => write!(f, "OPEN_NEW"),
            Self::AddToLong => write!(f, "ADD_TO_LONG"),
            Self::AddToShort => write!(f, "ADD_TO_SHORT"),
            Self::CloseLong => write!(f, "CLOSE_LONG"),
            Self::CloseShort => write!(f, "CLOSE_SHORT"),
            Self::None => write!(f, "NONE"),
        }
    }
}

/// One agent's answer for one cycle. Discarded after aggregation except for
/// the audit copy embedded in the decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentVerdict {
    pub agent_id: String,
    pub instrument: String,
    pub action: TradeAction,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub reasoning: String,
    /// Free-form feature values the agent derived (audit only).
    #[serde(default)]
    pub features: HashMap<String, Value>,
    /// Optional trigger predicate the agent attaches to its verdict; the
    /// strongest contributing condition becomes the signal's condition.
    #[serde(default)]
    pub condition: Option<Condition>,
    /// Suggested price levels, if the agent derived any.
    #[serde(default)]
    pub entry_price: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

impl AgentVerdict {
    pub fn new(
        agent_id: impl Into<String>,
        instrument: impl Into<String>,
        action: TradeAction,
        confidence: f64,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            instrument: instrument.into(),
            action,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: reasoning.into(),
            features: HashMap::new(),
            condition: None,
            entry_price: None,
            stop_loss: None,
            take_profit: None,
        }
    }
}

/// The orchestrator's aggregated, position-aware output for one instrument
/// and one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingDecision {
    pub instrument: String,
    pub action: TradeAction,
    /// score(chosen) / total weighted confidence mass, in [0, 1].
    pub confidence: f64,
    pub entry_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub position_action: PositionAction,
    pub rationale: String,
    /// The verdicts that were aggregated (audit trail).
    pub contributing: Vec<AgentVerdict>,
    pub created_at: i64,
}
