// =============================================================================
// Learning Module
// =============================================================================
//
// The feedback half of the loop:
// - Causal learner: per-context success statistics with temporal decay
// - Adaptive thresholds: outcome-driven per-(user, pattern, symbol) z tuning

pub mod adaptive;
pub mod causal;

pub use adaptive::{run_adaptive_job, AdaptationReport, AdaptiveThresholds};
pub use causal::{CausalLearner, CausalObservation, ContextAssessment, RegimeInsight};
