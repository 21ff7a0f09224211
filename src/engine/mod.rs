// =============================================================================
// Analysis Engine Module
// =============================================================================
//
// The periodic multi-agent analysis cycle:
// - AnalysisContext: consistent snapshot handed to every agent
// - agents: the Agent trait, registry, and shipped analyzers
// - decision: verdicts, aggregation output, position actions
// - regime: coarse market regime hint
// - orchestrator: the cycle driver

pub mod agents;
pub mod context;
pub mod decision;
pub mod orchestrator;
pub mod regime;

pub use context::AnalysisContext;
pub use decision::{AgentVerdict, PositionAction, TradingDecision};
pub use orchestrator::Orchestrator;
