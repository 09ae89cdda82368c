// =============================================================================
// Composite Confidence — one score with uncertainty
// =============================================================================
//
// Pure scoring function combining four dimensions into a single [0,1] value:
//
//   statistical  — how extreme the z-score is
//   behavioral   — the user's track record on this (pattern, symbol)
//   regime       — the causal learner's fit for (pattern, regime)
//   data_quality — how much of a window backed the detection
//
// composite = (0.25*stat + 0.30*behav + 0.25*regime + 0.20*dq)
//             * (1 - 0.5*uncertainty)
//
// Uncertainty only ever shrinks the score.

use serde::{Deserialize, Serialize};

use crate::regime::{MarketRegime, RegimeContext};
use crate::types::PatternQuality;

/// Dimension weights. Must sum to 1.
const W_STATISTICAL: f64 = 0.25;
const W_BEHAVIORAL: f64 = 0.30;
const W_REGIME: f64 = 0.25;
const W_DATA_QUALITY: f64 = 0.20;

/// History below this sample size falls back to the neutral behavioral prior.
const MIN_BEHAVIORAL_SAMPLES: u32 = 5;

/// History below this sample size contributes an uncertainty penalty.
const THIN_HISTORY_SAMPLES: u32 = 10;

/// The combined confidence score and its components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeConfidence {
    pub statistical: f64,
    pub behavioral: f64,
    pub regime: f64,
    pub data_quality: f64,
    pub uncertainty: f64,
    pub composite: f64,
}

/// Inputs to the scoring function, gathered by the engine per anomaly.
pub struct ConfidenceInputs<'a> {
    /// Absolute z of the driving anomaly.
    pub z_score: f64,
    pub context: &'a RegimeContext,
    pub history: Option<&'a PatternQuality>,
    /// The causal learner's context-confidence multiplier for
    /// (pattern, regime); `None` when the learner has no qualifying data.
    pub regime_multiplier: Option<f64>,
    /// Bars behind the detection.
    pub data_points: usize,
    /// Simultaneous opposing signals seen this cycle.
    pub conflicting_signals: usize,
}

impl CompositeConfidence {
    /// Score one anomaly. Pure; never fails.
    pub fn compute(inputs: &ConfidenceInputs<'_>) -> Self {
        // ── Statistical: z in [1, 5] maps linearly onto [0, 1] ──────────
        let statistical = ((inputs.z_score - 1.0) / 4.0).clamp(0.0, 1.0);

        // ── Behavioral: weighted track record, neutral prior when thin ──
        let behavioral = match inputs.history {
            Some(h) if h.sample_size >= MIN_BEHAVIORAL_SAMPLES => {
                0.6 * h.accuracy + 0.2 * h.trade_rate + 0.2 * h.agent_accuracy
            }
            _ => 0.5,
        };

        // ── Regime: causal multiplier clamped, 0.5 prior when absent ────
        let regime = inputs
            .regime_multiplier
            .map(|m| m.clamp(0.0, 1.0))
            .unwrap_or(0.5);

        // ── Data quality: window-size tiers ─────────────────────────────
        let data_quality = if inputs.data_points >= 50 {
            1.0
        } else if inputs.data_points >= 30 {
            0.8
        } else if inputs.data_points >= 20 {
            0.6
        } else {
            0.4
        };

        // ── Uncertainty accumulates, clamped to [0, 1] ──────────────────
        let mut uncertainty = 0.0;
        if inputs.context.regime == MarketRegime::Unknown {
            uncertainty += 0.20;
        }
        let thin_history = match inputs.history {
            Some(h) => h.sample_size < THIN_HISTORY_SAMPLES,
            None => true,
        };
        if thin_history {
            uncertainty += 0.15;
        }
        uncertainty += 0.10 * inputs.conflicting_signals.min(3) as f64;
        if inputs.context.volatility_percentile > 80.0 {
            uncertainty += 0.10;
        }
        let uncertainty = uncertainty.clamp(0.0, 1.0);

        let weighted = W_STATISTICAL * statistical
            + W_BEHAVIORAL * behavioral
            + W_REGIME * regime
            + W_DATA_QUALITY * data_quality;

        let composite = (weighted * (1.0 - 0.5 * uncertainty)).clamp(0.0, 1.0);

        Self {
            statistical,
            behavioral,
            regime,
            data_quality,
            uncertainty,
            composite,
        }
    }

    /// Human-readable breakdown naming the strongest and weakest dimensions.
    pub fn summary(&self) -> String {
        let dims = [
            ("statistical", self.statistical),
            ("behavioral", self.behavioral),
            ("regime", self.regime),
            ("data_quality", self.data_quality),
        ];

        let strongest = dims
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .expect("non-empty");
        let weakest = dims
            .iter()
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .expect("non-empty");

        format!(
            "confidence {:.0}%: strongest {} ({:.0}%), weakest {} ({:.0}%), uncertainty {:.0}%",
            self.composite * 100.0,
            strongest.0,
            strongest.1 * 100.0,
            weakest.0,
            weakest.1 * 100.0,
            self.uncertainty * 100.0
        )
    }
}
