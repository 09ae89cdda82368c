// =============================================================================
// Outcome Tracking Module
// =============================================================================
//
// Closes the loop on every non-ignored decision: samples forward returns at
// configured offsets, classifies profitability, scores the agent, and feeds
// the quality store and causal learner.

pub mod outcome;

pub use outcome::{evaluate_agent, run_outcome_scheduler, OutcomeTracker};
