// =============================================================================
// Causal Learner — per-context success statistics with temporal decay
// =============================================================================
//
// Moves from "this signal worked" to "this signal worked in THIS regime at
// THIS time". Observations are keyed three ways:
//
//   (pattern, regime, horizon)       — the most specific context
//   (pattern, regime)                — regime fit
//   (pattern, time_of_day, weekday)  — timing fit
//
// Each key holds an ordered list of (timestamp, success) tuples. The context
// confidence multiplier is a decay-weighted success rate scaled so that 1.0
// is neutral: the newest observation weighs 1.0 and weights halve every
// `half_life_days`. A key contributes only once it has the minimum sample.
//
// Readers take a read-mostly snapshot through the RwLock; the only writer is
// the outcome-persistence path.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::regime::{Horizon, MarketRegime, RegimeContext, TimeOfDay};
use crate::types::PatternType;

/// Blend weights for the three key families.
const W_PATTERN_REGIME_HORIZON: f64 = 0.5;
const W_PATTERN_REGIME: f64 = 0.3;
const W_PATTERN_TIMING: f64 = 0.2;

/// Threshold suggestion bands.
const LOWER_THRESHOLD_ABOVE: f64 = 1.2;
const RAISE_THRESHOLD_BELOW: f64 = 0.8;
const THRESHOLD_FLOOR: f64 = 2.0;
const THRESHOLD_CAP: f64 = 5.0;

// =============================================================================
// Types
// =============================================================================

/// One recorded context → outcome tuple, as persisted and replayed at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalObservation {
    pub pattern_type: PatternType,
    pub regime: MarketRegime,
    pub horizon: Horizon,
    pub time_of_day: TimeOfDay,
    pub day_of_week: u8,
    pub success: bool,
    pub observed_at: DateTime<Utc>,
}

/// The learner's read-side view for one (pattern, context) pair.
#[derive(Debug, Clone)]
pub struct ContextAssessment {
    /// Confidence multiplier, neutral at 1.0. `None` when no key family has
    /// reached the minimum sample.
    pub multiplier: Option<f64>,
    /// Whether any observation at all exists for (pattern, regime) — the
    /// first-occurrence escalation trigger.
    pub has_regime_record: bool,
    pub explanation: String,
}

/// Diagnostic row of `regime_insights`.
#[derive(Debug, Clone, Serialize)]
pub struct RegimeInsight {
    pub success_rate: f64,
    pub sample_size: usize,
    pub recommendation: String,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    at: DateTime<Utc>,
    success: bool,
}

#[derive(Default)]
struct Inner {
    by_full: HashMap<(PatternType, MarketRegime, Horizon), Vec<Observation>>,
    by_regime: HashMap<(PatternType, MarketRegime), Vec<Observation>>,
    by_timing: HashMap<(PatternType, TimeOfDay, u8), Vec<Observation>>,
}

// =============================================================================
// CausalLearner
// =============================================================================

pub struct CausalLearner {
    inner: RwLock<Inner>,
    half_life_days: f64,
    min_samples: usize,
}

impl CausalLearner {
    pub fn new(half_life_days: f64, min_samples: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            half_life_days: half_life_days.max(f64::EPSILON),
            min_samples: min_samples.max(1),
        }
    }

    /// Append one observation to every relevant key.
    pub fn record(&self, observation: &CausalObservation) {
        let obs = Observation {
            at: observation.observed_at,
            success: observation.success,
        };

        let mut inner = self.inner.write();
        inner
            .by_full
            .entry((
                observation.pattern_type,
                observation.regime,
                observation.horizon,
            ))
            .or_default()
            .push(obs);
        inner
            .by_regime
            .entry((observation.pattern_type, observation.regime))
            .or_default()
            .push(obs);
        inner
            .by_timing
            .entry((
                observation.pattern_type,
                observation.time_of_day,
                observation.day_of_week,
            ))
            .or_default()
            .push(obs);

        debug!(
            pattern = %observation.pattern_type,
            regime = %observation.regime,
            success = observation.success,
            "causal observation recorded"
        );
    }

    /// Replay persisted observations (startup warm-up).
    pub fn load(&self, observations: &[CausalObservation]) {
        for obs in observations {
            self.record(obs);
        }
    }

    /// Assess the fit of `pattern` in `context` as of `now`.
    pub fn assess(
        &self,
        pattern: PatternType,
        context: &RegimeContext,
        now: DateTime<Utc>,
    ) -> ContextAssessment {
        let inner = self.inner.read();

        let full = inner
            .by_full
            .get(&(pattern, context.regime, context.horizon));
        let regime = inner.by_regime.get(&(pattern, context.regime));
        let timing =
            inner
                .by_timing
                .get(&(pattern, context.time_of_day, context.day_of_week));

        let has_regime_record = regime.map(|v| !v.is_empty()).unwrap_or(false);

        let mut weighted_rate = 0.0;
        let mut weight_total = 0.0;
        let mut parts: Vec<String> = Vec::new();

        let mut take = |obs: Option<&Vec<Observation>>, weight: f64, label: &str| {
            if let Some(obs) = obs {
                if obs.len() >= self.min_samples {
                    let rate = self.decayed_success_rate(obs, now);
                    weighted_rate += weight * rate;
                    weight_total += weight;
                    parts.push(format!("{label}: {:.0}% over {} obs", rate * 100.0, obs.len()));
                }
            }
        };

        take(full, W_PATTERN_REGIME_HORIZON, "regime+horizon");
        take(regime, W_PATTERN_REGIME, "regime");
        take(timing, W_PATTERN_TIMING, "timing");

        if weight_total > 0.0 {
            let combined = weighted_rate / weight_total;
            let multiplier = combined * 2.0;
            ContextAssessment {
                multiplier: Some(multiplier),
                has_regime_record,
                explanation: format!(
                    "{} in {}: multiplier {:.2} ({})",
                    pattern,
                    context.regime,
                    multiplier,
                    parts.join("; ")
                ),
            }
        } else {
            ContextAssessment {
                multiplier: None,
                has_regime_record,
                explanation: format!(
                    "{} in {}: no context with {}+ observations yet",
                    pattern, context.regime, self.min_samples
                ),
            }
        }
    }

    /// Per-regime diagnostics for `pattern`.
    pub fn regime_insights(
        &self,
        pattern: PatternType,
        now: DateTime<Utc>,
    ) -> HashMap<MarketRegime, RegimeInsight> {
        let inner = self.inner.read();
        let mut out = HashMap::new();

        for ((p, regime), obs) in &inner.by_regime {
            if *p != pattern || obs.is_empty() {
                continue;
            }
            let rate = self.decayed_success_rate(obs, now);
            let recommendation = if obs.len() < self.min_samples {
                "insufficient data".to_string()
            } else if rate > 0.6 {
                format!("favorable: {} works in {}", pattern, regime)
            } else if rate < 0.4 {
                format!("avoid: {} underperforms in {}", pattern, regime)
            } else {
                "neutral".to_string()
            };
            out.insert(
                *regime,
                RegimeInsight {
                    success_rate: rate,
                    sample_size: obs.len(),
                    recommendation,
                },
            );
        }

        out
    }

    /// Adapt a z-threshold to the context: confident contexts get more
    /// signals, failing contexts fewer. Clamped to [2.0, 5.0].
    pub fn suggest_threshold(
        &self,
        pattern: PatternType,
        context: &RegimeContext,
        current_threshold: f64,
        now: DateTime<Utc>,
    ) -> f64 {
        let assessment = self.assess(pattern, context, now);
        let suggested = match assessment.multiplier {
            Some(m) if m > LOWER_THRESHOLD_ABOVE => current_threshold * 0.9,
            Some(m) if m < RAISE_THRESHOLD_BELOW => current_threshold * 1.15,
            _ => current_threshold,
        };
        suggested.clamp(THRESHOLD_FLOOR, THRESHOLD_CAP)
    }

    /// Decay-weighted success fraction: the newest observation weighs 1.0,
    /// halving every `half_life_days`.
    fn decayed_success_rate(&self, observations: &[Observation], now: DateTime<Utc>) -> f64 {
        let mut weighted_successes = 0.0;
        let mut weight_total = 0.0;

        for obs in observations {
            let age_days = (now - obs.at).num_seconds().max(0) as f64 / 86_400.0;
            let weight = 0.5_f64.powf(age_days / self.half_life_days);
            weight_total += weight;
            if obs.success {
                weighted_successes += weight;
            }
        }

        if weight_total > 0.0 {
            weighted_successes / weight_total
        } else {
            0.5
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::{SignalSource, VolumeRegime};
    use chrono::{Duration, TimeZone};

    fn context(regime: MarketRegime) -> RegimeContext {
        RegimeContext {
            regime,
            horizon: Horizon::Intraday,
            source: SignalSource::Composite,
            volatility_percentile: 50.0,
            trend_strength: 0.0,
            volume_regime: VolumeRegime::Normal,
            time_of_day: TimeOfDay::Mid,
            day_of_week: 2,
        }
    }

    fn observation(
        regime: MarketRegime,
        success: bool,
        at: DateTime<Utc>,
    ) -> CausalObservation {
        CausalObservation {
            pattern_type: PatternType::VolumeSpike,
            regime,
            horizon: Horizon::Intraday,
            time_of_day: TimeOfDay::Mid,
            day_of_week: 2,
            success,
            observed_at: at,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn below_minimum_sample_gives_no_multiplier() {
        let learner = CausalLearner::new(30.0, 3);
        let ctx = context(MarketRegime::Ranging);

        learner.record(&observation(MarketRegime::Ranging, true, now() - Duration::days(1)));
        learner.record(&observation(MarketRegime::Ranging, true, now() - Duration::days(2)));

        let assessment = learner.assess(PatternType::VolumeSpike, &ctx, now());
        assert!(assessment.multiplier.is_none());
        // The record still counts as seen: no first-occurrence escalation.
        assert!(assessment.has_regime_record);
    }

    #[test]
    fn unseen_context_has_no_record() {
        let learner = CausalLearner::new(30.0, 3);
        let ctx = context(MarketRegime::Breakout);
        let assessment = learner.assess(PatternType::PriceMomentum, &ctx, now());
        assert!(assessment.multiplier.is_none());
        assert!(!assessment.has_regime_record);
    }

    #[test]
    fn multiplier_is_twice_the_success_rate() {
        let learner = CausalLearner::new(30.0, 3);
        let ctx = context(MarketRegime::Ranging);

        // Three recent successes, one failure: rate ~0.75 (all near-zero age).
        for success in [true, true, true, false] {
            learner.record(&observation(
                MarketRegime::Ranging,
                success,
                now() - Duration::hours(1),
            ));
        }

        let assessment = learner.assess(PatternType::VolumeSpike, &ctx, now());
        let multiplier = assessment.multiplier.unwrap();
        assert!((multiplier - 1.5).abs() < 0.01, "multiplier was {multiplier}");
    }

    #[test]
    fn decay_discounts_old_failures() {
        let learner = CausalLearner::new(30.0, 3);
        let ctx = context(MarketRegime::Ranging);

        // Three failures ninety days ago (weight 0.125 each), three
        // successes yesterday (weight ~1.0 each).
        for _ in 0..3 {
            learner.record(&observation(
                MarketRegime::Ranging,
                false,
                now() - Duration::days(90),
            ));
        }
        for _ in 0..3 {
            learner.record(&observation(
                MarketRegime::Ranging,
                true,
                now() - Duration::days(1),
            ));
        }

        let assessment = learner.assess(PatternType::VolumeSpike, &ctx, now());
        let multiplier = assessment.multiplier.unwrap();
        // Plain mean would be 0.5 (multiplier 1.0); decay pushes it well up.
        assert!(multiplier > 1.4, "multiplier was {multiplier}");
    }

    #[test]
    fn suggest_threshold_bands_and_clamps() {
        let learner = CausalLearner::new(30.0, 3);
        let ctx = context(MarketRegime::Ranging);

        // Favorable context: lower by 10%.
        for _ in 0..5 {
            learner.record(&observation(MarketRegime::Ranging, true, now() - Duration::days(1)));
        }
        let lowered = learner.suggest_threshold(PatternType::VolumeSpike, &ctx, 3.0, now());
        assert!((lowered - 2.7).abs() < 1e-9);

        // Clamp at the floor.
        let floored = learner.suggest_threshold(PatternType::VolumeSpike, &ctx, 2.1, now());
        assert!((floored - 2.0).abs() < 1e-9);

        // Unfavorable context: raise by 15%, clamped at the cap.
        let bad_ctx = context(MarketRegime::HighVolatility);
        for _ in 0..5 {
            learner.record(&observation(
                MarketRegime::HighVolatility,
                false,
                now() - Duration::days(1),
            ));
        }
        let raised = learner.suggest_threshold(PatternType::VolumeSpike, &bad_ctx, 4.0, now());
        assert!((raised - 4.6).abs() < 1e-9);
        let capped = learner.suggest_threshold(PatternType::VolumeSpike, &bad_ctx, 4.8, now());
        assert!((capped - 5.0).abs() < 1e-9);

        // Neutral context with no data: unchanged.
        let fresh = CausalLearner::new(30.0, 3);
        let kept = fresh.suggest_threshold(PatternType::VolumeSpike, &ctx, 3.0, now());
        assert!((kept - 3.0).abs() < 1e-9);
    }

    #[test]
    fn regime_insights_labels_extremes() {
        let learner = CausalLearner::new(30.0, 3);

        for _ in 0..4 {
            learner.record(&observation(MarketRegime::Ranging, true, now() - Duration::days(1)));
        }
        for _ in 0..4 {
            learner.record(&observation(
                MarketRegime::TrendingDown,
                false,
                now() - Duration::days(1),
            ));
        }
        learner.record(&observation(MarketRegime::Breakout, true, now() - Duration::days(1)));

        let insights = learner.regime_insights(PatternType::VolumeSpike, now());

        let ranging = &insights[&MarketRegime::Ranging];
        assert_eq!(ranging.sample_size, 4);
        assert!(ranging.recommendation.starts_with("favorable"));

        let down = &insights[&MarketRegime::TrendingDown];
        assert!(down.recommendation.starts_with("avoid"));

        let breakout = &insights[&MarketRegime::Breakout];
        assert_eq!(breakout.recommendation, "insufficient data");
    }

    #[test]
    fn load_replays_persisted_observations() {
        let learner = CausalLearner::new(30.0, 3);
        let observations: Vec<CausalObservation> = (0..4)
            .map(|i| observation(MarketRegime::Ranging, true, now() - Duration::days(i)))
            .collect();
        learner.load(&observations);

        let assessment = learner.assess(PatternType::VolumeSpike, &context(MarketRegime::Ranging), now());
        assert!(assessment.multiplier.is_some());
        assert!(assessment.has_regime_record);
    }
}
