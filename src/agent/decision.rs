// =============================================================================
// Decision Agent — authority rules over composite confidence
// =============================================================================
//
// The agent is a decision-maker, not just a scorer. It can reject its own
// signals, request more data, and escalate to human review irrespective of
// raw confidence. Rules are applied in strict priority order; the first
// match wins:
//
//   1. REJECT poor history        — 15+ samples with accuracy < 25%
//   2. REJECT unfavorable regime  — known regime, causal confidence < 0.4,
//                                   and a weak signal (z < 3.5)
//   3. REJECT insufficient data   — data quality < 0.5 (requests more data)
//   4. ESCALATE high uncertainty  — uncertainty >= 0.4
//   5. ESCALATE first occurrence  — no causal record for (pattern, regime)
//   6. EXECUTE                    — composite >= 0.75 and z >= 4.0
//   7. REVIEW                     — composite >= 0.55
//   8. MONITOR                    — composite >= 0.35 and z >= 2.5
//   9. IGNORE                     — everything else (no rejection flag)
//
// Deterministic: identical inputs produce identical decisions. The only
// mutation is the agent's own counters.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::agent::confidence::{CompositeConfidence, ConfidenceInputs};
use crate::detect::Anomaly;
use crate::learning::causal::ContextAssessment;
use crate::regime::{RegimeContext, TimeOfDay, VolumeRegime};
use crate::types::{DecisionState, PatternQuality, PatternType};

/// Execute gate thresholds.
const EXECUTE_MIN_COMPOSITE: f64 = 0.75;
const EXECUTE_MIN_Z: f64 = 4.0;
/// Review / monitor thresholds.
const REVIEW_MIN_COMPOSITE: f64 = 0.55;
const MONITOR_MIN_COMPOSITE: f64 = 0.35;
const MONITOR_MIN_Z: f64 = 2.5;
/// Rejection rule constants.
const POOR_HISTORY_MIN_SAMPLES: u32 = 15;
const POOR_HISTORY_ACCURACY: f64 = 0.25;
const UNFAVORABLE_REGIME_CONFIDENCE: f64 = 0.4;
const UNFAVORABLE_REGIME_MAX_Z: f64 = 3.5;
const INSUFFICIENT_DATA_QUALITY: f64 = 0.5;
const HIGH_UNCERTAINTY: f64 = 0.4;

// =============================================================================
// Types
// =============================================================================

/// Four-part human-readable narrative attached to every decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalStory {
    pub context: String,
    pub trigger: String,
    pub risk: String,
    pub invalidation: String,
}

/// The agent's authoritative output for one anomaly. Immutable; persisted
/// alongside the anomaly row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub anomaly_id: String,
    pub state: DecisionState,
    pub confidence: CompositeConfidence,
    pub reason: String,
    pub risk_assessment: String,
    pub rejected: bool,
    pub rejection_reason: Option<String>,
    pub escalated: bool,
    pub escalation_reason: Option<String>,
    pub requested_more_data: bool,
    pub invalidation: String,
    pub story: SignalStory,
    pub decided_at: DateTime<Utc>,
}

/// Inputs to one decision, gathered by the engine.
pub struct DecisionInputs<'a> {
    pub anomaly: &'a Anomaly,
    pub context: &'a RegimeContext,
    pub history: Option<&'a PatternQuality>,
    pub causal: &'a ContextAssessment,
    pub data_points: usize,
    pub conflicting_signals: usize,
}

/// Counter snapshot for reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentStats {
    pub total: u64,
    pub rejected: u64,
    pub escalated: u64,
    pub by_state: HashMap<String, u64>,
}

// =============================================================================
// DecisionAgent
// =============================================================================

/// Applies the authority rules and keeps decision counters for reporting.
pub struct DecisionAgent {
    stats: RwLock<AgentStats>,
}

impl DecisionAgent {
    pub fn new() -> Self {
        Self {
            stats: RwLock::new(AgentStats::default()),
        }
    }

    /// Decide on one anomaly. Pure given its inputs, except for the stats
    /// counters.
    pub fn decide(&self, inputs: &DecisionInputs<'_>, now: DateTime<Utc>) -> Decision {
        let confidence = CompositeConfidence::compute(&ConfidenceInputs {
            z_score: inputs.anomaly.z_score,
            context: inputs.context,
            history: inputs.history,
            regime_multiplier: inputs.causal.multiplier,
            data_points: inputs.data_points,
            conflicting_signals: inputs.conflicting_signals,
        });

        let verdict = Self::apply_rules(inputs, &confidence);
        let decision = self.assemble(inputs, confidence, verdict, now);
        self.tally(&decision);

        info!(
            anomaly_id = %decision.anomaly_id,
            symbol = %inputs.anomaly.symbol,
            pattern = %inputs.anomaly.pattern_type,
            state = %decision.state,
            composite = format!("{:.3}", decision.confidence.composite),
            rejected = decision.rejected,
            escalated = decision.escalated,
            reason = %decision.reason,
            "decision made"
        );

        decision
    }

    /// Current counter snapshot.
    pub fn stats(&self) -> AgentStats {
        self.stats.read().clone()
    }

    /// Log the running totals (end-of-cycle report).
    pub fn log_stats(&self) {
        let stats = self.stats.read();
        info!(
            total = stats.total,
            rejected = stats.rejected,
            escalated = stats.escalated,
            by_state = ?stats.by_state,
            "agent decision totals"
        );
    }

    // -------------------------------------------------------------------------
    // Rule evaluation
    // -------------------------------------------------------------------------

    fn apply_rules(inputs: &DecisionInputs<'_>, confidence: &CompositeConfidence) -> Verdict {
        let z = inputs.anomaly.z_score;

        // 1. Reject: poor history.
        if let Some(history) = inputs.history {
            if history.sample_size >= POOR_HISTORY_MIN_SAMPLES
                && history.accuracy < POOR_HISTORY_ACCURACY
            {
                return Verdict::Rejected {
                    token: "poor_history",
                    reason: format!(
                        "history is working against this signal: {:.0}% accuracy over {} outcomes",
                        history.accuracy * 100.0,
                        history.sample_size
                    ),
                };
            }
        }

        // 2. Reject: unfavorable regime + weak signal.
        if inputs.context.regime.is_known() {
            if let Some(multiplier) = inputs.causal.multiplier {
                if multiplier < UNFAVORABLE_REGIME_CONFIDENCE && z < UNFAVORABLE_REGIME_MAX_Z {
                    return Verdict::Rejected {
                        token: "unfavorable_regime",
                        reason: format!(
                            "{} has failed in the {} regime (confidence {:.2}) and z={:.1} is not strong enough to override",
                            inputs.anomaly.pattern_type, inputs.context.regime, multiplier, z
                        ),
                    };
                }
            }
        }

        // 3. Reject: insufficient data.
        if confidence.data_quality < INSUFFICIENT_DATA_QUALITY {
            return Verdict::RejectedMoreData {
                token: "insufficient_data",
                reason: format!(
                    "only {} bars behind this detection; refusing to act on a thin window",
                    inputs.data_points
                ),
            };
        }

        // 4. Escalate: high uncertainty.
        if confidence.uncertainty >= HIGH_UNCERTAINTY {
            return Verdict::Escalated {
                token: "high_uncertainty",
                reason: format!(
                    "uncertainty {:.0}% is too high for an autonomous call",
                    confidence.uncertainty * 100.0
                ),
            };
        }

        // 5. Escalate: first occurrence of this (pattern, regime).
        if !inputs.causal.has_regime_record {
            return Verdict::Escalated {
                token: "first_occurrence",
                reason: format!(
                    "first {} observed in the {} regime; needs a human look",
                    inputs.anomaly.pattern_type, inputs.context.regime
                ),
            };
        }

        // 6-9. Confidence ladder.
        let composite = confidence.composite;
        if composite >= EXECUTE_MIN_COMPOSITE && z >= EXECUTE_MIN_Z {
            Verdict::Plain {
                state: DecisionState::Execute,
                reason: format!(
                    "composite {:.0}% with z={:.1}: strong signal, favorable history and regime",
                    composite * 100.0,
                    z
                ),
            }
        } else if composite >= REVIEW_MIN_COMPOSITE {
            Verdict::Plain {
                state: DecisionState::Review,
                reason: format!("composite {:.0}%: worth human attention", composite * 100.0),
            }
        } else if composite >= MONITOR_MIN_COMPOSITE && z >= MONITOR_MIN_Z {
            Verdict::Plain {
                state: DecisionState::Monitor,
                reason: format!(
                    "composite {:.0}% with z={:.1}: watch for follow-through",
                    composite * 100.0,
                    z
                ),
            }
        } else {
            Verdict::Plain {
                state: DecisionState::Ignore,
                reason: format!(
                    "composite {:.0}% below action thresholds",
                    composite * 100.0
                ),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Assembly
    // -------------------------------------------------------------------------

    fn assemble(
        &self,
        inputs: &DecisionInputs<'_>,
        confidence: CompositeConfidence,
        verdict: Verdict,
        now: DateTime<Utc>,
    ) -> Decision {
        let risk_assessment = build_risk_assessment(inputs.context, inputs.anomaly.z_score);
        let invalidation = build_invalidation(inputs.anomaly.pattern_type, inputs.anomaly.price);
        let story_context = build_story_context(inputs.context);

        let (state, reason, rejected, rejection_reason, escalated, escalation_reason, more_data) =
            match verdict {
                Verdict::Rejected { token, reason } => (
                    DecisionState::Ignore,
                    reason,
                    true,
                    Some(token.to_string()),
                    false,
                    None,
                    false,
                ),
                Verdict::RejectedMoreData { token, reason } => (
                    DecisionState::Ignore,
                    reason,
                    true,
                    Some(token.to_string()),
                    false,
                    None,
                    true,
                ),
                Verdict::Escalated { token, reason } => (
                    DecisionState::Review,
                    reason,
                    false,
                    None,
                    true,
                    Some(token.to_string()),
                    false,
                ),
                Verdict::Plain { state, reason } => {
                    (state, reason, false, None, false, None, false)
                }
            };

        Decision {
            anomaly_id: inputs.anomaly.id.clone(),
            state,
            story: SignalStory {
                context: story_context,
                trigger: inputs.anomaly.description.clone(),
                risk: risk_assessment.clone(),
                invalidation: invalidation.clone(),
            },
            confidence,
            reason,
            risk_assessment,
            rejected,
            rejection_reason,
            escalated,
            escalation_reason,
            requested_more_data: more_data,
            invalidation,
            decided_at: now,
        }
    }

    fn tally(&self, decision: &Decision) {
        let mut stats = self.stats.write();
        stats.total += 1;
        if decision.rejected {
            stats.rejected += 1;
        }
        if decision.escalated {
            stats.escalated += 1;
        }
        *stats
            .by_state
            .entry(decision.state.as_str().to_string())
            .or_insert(0) += 1;
    }
}

impl Default for DecisionAgent {
    fn default() -> Self {
        Self::new()
    }
}

enum Verdict {
    Rejected { token: &'static str, reason: String },
    RejectedMoreData { token: &'static str, reason: String },
    Escalated { token: &'static str, reason: String },
    Plain { state: DecisionState, reason: String },
}

// =============================================================================
// Narrative helpers
// =============================================================================

fn build_risk_assessment(context: &RegimeContext, z: f64) -> String {
    let mut notes: Vec<String> = Vec::new();

    if context.volatility_percentile > 80.0 {
        notes.push(format!(
            "volatility at the {:.0}th percentile amplifies slippage",
            context.volatility_percentile
        ));
    } else if context.volatility_percentile < 20.0 {
        notes.push("unusually quiet tape; moves may not follow through".to_string());
    }

    match context.volume_regime {
        VolumeRegime::High => notes.push("heavy participation behind the move".to_string()),
        VolumeRegime::Low => notes.push("thin volume; prints are less reliable".to_string()),
        VolumeRegime::Normal => {}
    }

    match context.time_of_day {
        TimeOfDay::Open => notes.push("opening-session noise inflates readings".to_string()),
        TimeOfDay::AfterHours => notes.push("after-hours illiquidity widens spreads".to_string()),
        TimeOfDay::Mid | TimeOfDay::Close => {}
    }

    if z >= 5.0 {
        notes.push(format!("extreme reading (z={z:.1}) is prone to snap-back"));
    }

    if notes.is_empty() {
        "no outsized risk factors in the current context".to_string()
    } else {
        notes.join("; ")
    }
}

fn build_invalidation(pattern: PatternType, price: f64) -> String {
    match pattern {
        PatternType::VolumeSpike => format!(
            "Invalidated by a retrace of more than 2% from {price:.2} or volume normalizing on the next bar"
        ),
        PatternType::PriceMomentum => format!(
            "Invalidated if the move retraces more than 2% from {price:.2} before continuation"
        ),
        PatternType::VolatilitySurge => {
            "Invalidated if the range contracts back inside its 20-bar average".to_string()
        }
        PatternType::BreakoutHigh => format!(
            "Invalidated by a close more than 2% back below the breakout print at {price:.2}"
        ),
        PatternType::BreakoutLow => format!(
            "Invalidated by a close more than 2% back above the breakdown print at {price:.2}"
        ),
    }
}

fn build_story_context(context: &RegimeContext) -> String {
    format!(
        "Market {regime}, volatility at the {vol:.0}th percentile, {volume} volume, {tod} session, {horizon} horizon",
        regime = context.regime,
        vol = context.volatility_percentile,
        volume = context.volume_regime,
        tod = context.time_of_day,
        horizon = context.horizon,
    )
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Anomaly;
    use crate::regime::{Horizon, MarketRegime, SignalSource};
    use crate::types::Severity;
    use chrono::TimeZone;

    fn anomaly(pattern: PatternType, z: f64) -> Anomaly {
        Anomaly {
            id: "sig-abc123".into(),
            symbol: "AAPL".into(),
            pattern_type: pattern,
            severity: Severity::from_z(z),
            z_score: z,
            price: 100.0,
            volume: 1_600_000,
            detected_at: Utc.with_ymd_and_hms(2024, 1, 2, 11, 0, 0).unwrap(),
            description: "test anomaly".into(),
            context: String::new(),
            sources: String::new(),
            thought_process: String::new(),
        }
    }

    fn context(regime: MarketRegime, vol_pct: f64) -> RegimeContext {
        RegimeContext {
            regime,
            horizon: Horizon::Intraday,
            source: SignalSource::Composite,
            volatility_percentile: vol_pct,
            trend_strength: 0.0,
            volume_regime: VolumeRegime::Normal,
            time_of_day: TimeOfDay::Mid,
            day_of_week: 1,
        }
    }

    fn history(accuracy: f64, trade_rate: f64, agent_accuracy: f64, n: u32) -> PatternQuality {
        PatternQuality {
            user_id: "default".into(),
            pattern_type: PatternType::VolumeSpike,
            symbol: "AAPL".into(),
            accuracy,
            review_rate: 0.6,
            trade_rate,
            avg_return: 0.01,
            sample_size: n,
            agent_accuracy,
            updated_at: Utc::now(),
        }
    }

    fn seen(multiplier: f64) -> ContextAssessment {
        ContextAssessment {
            multiplier: Some(multiplier),
            has_regime_record: true,
            explanation: "test".into(),
        }
    }

    fn unseen() -> ContextAssessment {
        ContextAssessment {
            multiplier: None,
            has_regime_record: false,
            explanation: "test".into(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 11, 0, 1).unwrap()
    }

    #[test]
    fn strong_spike_with_good_history_executes() {
        let agent = DecisionAgent::new();
        let anomaly = anomaly(PatternType::VolumeSpike, 6.0);
        let ctx = context(MarketRegime::Ranging, 40.0);
        let hist = history(0.72, 0.55, 0.70, 30);
        let causal = seen(1.4);

        let decision = agent.decide(
            &DecisionInputs {
                anomaly: &anomaly,
                context: &ctx,
                history: Some(&hist),
                causal: &causal,
                data_points: 60,
                conflicting_signals: 0,
            },
            now(),
        );

        assert_eq!(decision.state, DecisionState::Execute);
        assert!(!decision.rejected);
        assert!(!decision.escalated);
        assert!(decision.confidence.composite >= 0.75);
        assert!(decision.invalidation.contains("2%"));
        assert!(decision.story.context.contains("ranging"));
    }

    #[test]
    fn poor_history_rejects() {
        let agent = DecisionAgent::new();
        let anomaly = anomaly(PatternType::VolumeSpike, 6.0);
        let ctx = context(MarketRegime::Ranging, 40.0);
        let hist = history(0.18, 0.1, 0.3, 20);
        let causal = seen(1.4);

        let decision = agent.decide(
            &DecisionInputs {
                anomaly: &anomaly,
                context: &ctx,
                history: Some(&hist),
                causal: &causal,
                data_points: 60,
                conflicting_signals: 0,
            },
            now(),
        );

        assert_eq!(decision.state, DecisionState::Ignore);
        assert!(decision.rejected);
        assert_eq!(decision.rejection_reason.as_deref(), Some("poor_history"));
    }

    #[test]
    fn thin_window_rejects_and_requests_data() {
        let agent = DecisionAgent::new();
        let anomaly = anomaly(PatternType::VolumeSpike, 3.0);
        let ctx = context(MarketRegime::Ranging, 40.0);
        let causal = seen(1.0);

        let decision = agent.decide(
            &DecisionInputs {
                anomaly: &anomaly,
                context: &ctx,
                history: None,
                causal: &causal,
                data_points: 10,
                conflicting_signals: 0,
            },
            now(),
        );

        assert_eq!(decision.state, DecisionState::Ignore);
        assert!(decision.rejected);
        assert_eq!(
            decision.rejection_reason.as_deref(),
            Some("insufficient_data")
        );
        assert!(decision.requested_more_data);
    }

    #[test]
    fn first_occurrence_escalates() {
        let agent = DecisionAgent::new();
        let anomaly = anomaly(PatternType::PriceMomentum, 3.2);
        let ctx = context(MarketRegime::Breakout, 50.0);
        let hist = history(0.6, 0.4, 0.6, 12); // present so uncertainty stays low
        let causal = unseen();

        let decision = agent.decide(
            &DecisionInputs {
                anomaly: &anomaly,
                context: &ctx,
                history: Some(&hist),
                causal: &causal,
                data_points: 60,
                conflicting_signals: 0,
            },
            now(),
        );

        assert_eq!(decision.state, DecisionState::Review);
        assert!(decision.escalated);
        assert_eq!(
            decision.escalation_reason.as_deref(),
            Some("first_occurrence")
        );
    }

    #[test]
    fn unfavorable_regime_rejects_weak_signals_only() {
        let agent = DecisionAgent::new();
        let ctx = context(MarketRegime::TrendingDown, 50.0);
        let causal = seen(0.3);
        let hist = history(0.5, 0.4, 0.5, 20);

        // Weak signal: rejected.
        let weak = anomaly(PatternType::VolumeSpike, 3.0);
        let decision = agent.decide(
            &DecisionInputs {
                anomaly: &weak,
                context: &ctx,
                history: Some(&hist),
                causal: &causal,
                data_points: 60,
                conflicting_signals: 0,
            },
            now(),
        );
        assert!(decision.rejected);
        assert_eq!(
            decision.rejection_reason.as_deref(),
            Some("unfavorable_regime")
        );

        // Strong signal overrides the unfavorable regime.
        let strong = anomaly(PatternType::VolumeSpike, 4.5);
        let decision = agent.decide(
            &DecisionInputs {
                anomaly: &strong,
                context: &ctx,
                history: Some(&hist),
                causal: &causal,
                data_points: 60,
                conflicting_signals: 0,
            },
            now(),
        );
        assert!(!decision.rejected);
    }

    #[test]
    fn high_uncertainty_escalates() {
        let agent = DecisionAgent::new();
        let anomaly = anomaly(PatternType::VolumeSpike, 4.5);
        // Unknown regime (+0.20) + no history (+0.15) + high vol (+0.10).
        let ctx = context(MarketRegime::Unknown, 90.0);
        let causal = seen(1.0);

        let decision = agent.decide(
            &DecisionInputs {
                anomaly: &anomaly,
                context: &ctx,
                history: None,
                causal: &causal,
                data_points: 60,
                conflicting_signals: 0,
            },
            now(),
        );

        assert_eq!(decision.state, DecisionState::Review);
        assert!(decision.escalated);
        assert_eq!(
            decision.escalation_reason.as_deref(),
            Some("high_uncertainty")
        );
    }

    #[test]
    fn monitor_band_requires_minimum_z() {
        let agent = DecisionAgent::new();
        let ctx = context(MarketRegime::Ranging, 40.0);
        let hist = history(0.3, 0.1, 0.4, 20);
        let causal = seen(0.6);

        // Composite lands in the monitor band with z above the floor.
        let monitored = anomaly(PatternType::VolumeSpike, 2.6);
        let decision = agent.decide(
            &DecisionInputs {
                anomaly: &monitored,
                context: &ctx,
                history: Some(&hist),
                causal: &causal,
                data_points: 60,
                conflicting_signals: 0,
            },
            now(),
        );
        assert_eq!(decision.state, DecisionState::Monitor);

        // Same confidence ballpark but z below the monitor floor: ignored
        // without a rejection flag.
        let weak = anomaly(PatternType::VolumeSpike, 2.0);
        let decision = agent.decide(
            &DecisionInputs {
                anomaly: &weak,
                context: &ctx,
                history: Some(&hist),
                causal: &causal,
                data_points: 60,
                conflicting_signals: 0,
            },
            now(),
        );
        assert_eq!(decision.state, DecisionState::Ignore);
        assert!(!decision.rejected);
        assert!(decision.rejection_reason.is_none());
    }

    #[test]
    fn execute_gate_property_over_grid() {
        // Every execute must clear the gate; every rejection must land on
        // ignore with a reason; every escalation on review.
        let agent = DecisionAgent::new();
        let contexts = [
            context(MarketRegime::Ranging, 40.0),
            context(MarketRegime::Unknown, 85.0),
            context(MarketRegime::Breakout, 60.0),
        ];
        let histories = [
            None,
            Some(history(0.15, 0.1, 0.2, 25)),
            Some(history(0.8, 0.6, 0.8, 40)),
        ];
        let causals = [unseen(), seen(0.3), seen(1.4)];

        for ctx in &contexts {
            for hist in &histories {
                for causal in &causals {
                    for z in [2.0, 3.0, 4.2, 6.0] {
                        for points in [10, 25, 60] {
                            let a = anomaly(PatternType::VolumeSpike, z);
                            let d = agent.decide(
                                &DecisionInputs {
                                    anomaly: &a,
                                    context: ctx,
                                    history: hist.as_ref(),
                                    causal,
                                    data_points: points,
                                    conflicting_signals: 0,
                                },
                                now(),
                            );

                            if d.state == DecisionState::Execute {
                                assert!(d.confidence.composite >= 0.75);
                                assert!(a.z_score >= 4.0);
                                assert!(!d.rejected);
                            }
                            if d.rejected {
                                assert_eq!(d.state, DecisionState::Ignore);
                                assert!(d.rejection_reason.is_some());
                            }
                            if d.escalated {
                                assert_eq!(d.state, DecisionState::Review);
                                assert!(d.escalation_reason.is_some());
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn counters_tally_decisions() {
        let agent = DecisionAgent::new();
        let ctx = context(MarketRegime::Ranging, 40.0);
        let hist_poor = history(0.18, 0.1, 0.3, 20);
        let hist_good = history(0.72, 0.55, 0.70, 30);
        let causal = seen(1.4);

        let a = anomaly(PatternType::VolumeSpike, 6.0);
        for hist in [&hist_poor, &hist_good] {
            agent.decide(
                &DecisionInputs {
                    anomaly: &a,
                    context: &ctx,
                    history: Some(hist),
                    causal: &causal,
                    data_points: 60,
                    conflicting_signals: 0,
                },
                now(),
            );
        }

        let stats = agent.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.by_state.get("ignore"), Some(&1));
        assert_eq!(stats.by_state.get("execute"), Some(&1));
    }

    #[test]
    fn determinism_for_identical_inputs() {
        let agent = DecisionAgent::new();
        let a = anomaly(PatternType::VolumeSpike, 6.0);
        let ctx = context(MarketRegime::Ranging, 40.0);
        let hist = history(0.72, 0.55, 0.70, 30);
        let causal = seen(1.4);

        let inputs = DecisionInputs {
            anomaly: &a,
            context: &ctx,
            history: Some(&hist),
            causal: &causal,
            data_points: 60,
            conflicting_signals: 0,
        };
        let d1 = agent.decide(&inputs, now());
        let d2 = agent.decide(&inputs, now());
        assert_eq!(d1.state, d2.state);
        assert_eq!(d1.reason, d2.reason);
        assert!((d1.confidence.composite - d2.confidence.composite).abs() < f64::EPSILON);
    }
}
