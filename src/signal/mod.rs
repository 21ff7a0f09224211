// =============================================================================
// Signal Module
// =============================================================================
//
// Conditional order intents:
// - Condition: structured trigger predicate language
// - Signal / SignalStatus: the record and its CAS-guarded state machine
// - SignalMonitor: evaluates conditions against live streams and drives
//   execution

pub mod condition;
pub mod model;
pub mod monitor;

pub use condition::{CmpOp, Condition, ConditionError, Sample};
pub use model::{ActiveSignal, Signal, SignalStatus};
pub use monitor::SignalMonitor;
