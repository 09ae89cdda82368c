// =============================================================================
// Decision Agent Module
// =============================================================================
//
// The decision side of the learning loop:
// - Composite confidence scoring (statistical / behavioral / regime / data
//   quality, penalized by uncertainty)
// - The authority rules that turn an anomaly + context into a Decision

pub mod confidence;
pub mod decision;

pub use confidence::{CompositeConfidence, ConfidenceInputs};
pub use decision::{AgentStats, Decision, DecisionAgent, SignalStory};
