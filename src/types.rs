// =============================================================================
// Shared types used across the FinSight detection engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One OHLCV observation of a symbol at an instant.
///
/// Bars are produced by the market data adapter, consumed read-only by the
/// detector and regime classifier, and never persisted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Bar {
    /// Check the OHLC invariant: `low <= open,close <= high`, all fields
    /// finite and non-negative.
    pub fn is_valid(&self) -> bool {
        let finite = self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite();

        finite
            && self.low >= 0.0
            && self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
    }

    /// Intraday range as a fraction of the close (the volatility-surge metric).
    pub fn range_pct(&self) -> f64 {
        if self.close > 0.0 {
            (self.high - self.low) / self.close
        } else {
            0.0
        }
    }
}

/// The kind of statistical anomaly a detection rule fired on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    VolumeSpike,
    PriceMomentum,
    VolatilitySurge,
    BreakoutHigh,
    BreakoutLow,
}

impl PatternType {
    pub const ALL: [PatternType; 5] = [
        Self::VolumeSpike,
        Self::PriceMomentum,
        Self::VolatilitySurge,
        Self::BreakoutHigh,
        Self::BreakoutLow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VolumeSpike => "volume_spike",
            Self::PriceMomentum => "price_momentum",
            Self::VolatilitySurge => "volatility_surge",
            Self::BreakoutHigh => "breakout_high",
            Self::BreakoutLow => "breakout_low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "volume_spike" => Some(Self::VolumeSpike),
            "price_momentum" => Some(Self::PriceMomentum),
            "volatility_surge" => Some(Self::VolatilitySurge),
            "breakout_high" => Some(Self::BreakoutHigh),
            "breakout_low" => Some(Self::BreakoutLow),
            _ => None,
        }
    }
}

impl std::fmt::Display for PatternType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a detected anomaly. Derived deterministically from the z-score
/// of the driving metric, ordered `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Map an absolute z-score onto a severity band.
    pub fn from_z(z: f64) -> Self {
        if z >= 5.0 {
            Self::Critical
        } else if z >= 4.0 {
            Self::High
        } else if z >= 3.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The agent's recommended response to an anomaly. One enumeration used
/// everywhere, including outcome evaluation; serialized lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionState {
    Ignore,
    Monitor,
    Review,
    Execute,
}

impl DecisionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Monitor => "monitor",
            Self::Review => "review",
            Self::Execute => "execute",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ignore" => Some(Self::Ignore),
            "monitor" => Some(Self::Monitor),
            "review" => Some(Self::Review),
            "execute" => Some(Self::Execute),
            _ => None,
        }
    }
}

impl std::fmt::Display for DecisionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded human response to a surfaced anomaly. A missing action becomes
/// `Ignored` once the action timeout elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserActionKind {
    Ignored,
    Reviewed,
    Traded,
}

impl UserActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::Reviewed => "reviewed",
            Self::Traded => "traded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ignored" => Some(Self::Ignored),
            "reviewed" => Some(Self::Reviewed),
            "traded" => Some(Self::Traded),
            _ => None,
        }
    }

    /// Whether the user engaged with the signal at all.
    pub fn engaged(&self) -> bool {
        matches!(self, Self::Reviewed | Self::Traded)
    }
}

impl std::fmt::Display for UserActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Empirical quality statistics for one (user, pattern_type, symbol) triple.
///
/// Recomputed exactly from that user's outcome rows on every new outcome; a
/// row exists iff at least one outcome has been recorded. Drives the agent's
/// behavioral prior and the adaptive threshold job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternQuality {
    pub user_id: String,
    pub pattern_type: PatternType,
    pub symbol: String,
    /// Share of outcomes that were profitable.
    pub accuracy: f64,
    /// Share of outcomes the user reviewed or traded.
    pub review_rate: f64,
    /// Share of outcomes the user traded.
    pub trade_rate: f64,
    /// Mean best-available forward return.
    pub avg_return: f64,
    pub sample_size: u32,
    /// Share of outcomes where the agent's call was correct.
    pub agent_accuracy: f64,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            symbol: "AAPL".into(),
            ts: Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume: 1_000,
        }
    }

    #[test]
    fn bar_valid_ohlc() {
        assert!(bar(10.0, 11.0, 9.5, 10.5).is_valid());
        // Degenerate but legal: all equal.
        assert!(bar(10.0, 10.0, 10.0, 10.0).is_valid());
    }

    #[test]
    fn bar_invalid_when_low_above_high() {
        assert!(!bar(10.0, 9.0, 11.0, 10.0).is_valid());
    }

    #[test]
    fn bar_invalid_when_close_outside_range() {
        assert!(!bar(10.0, 10.5, 9.5, 11.0).is_valid());
        assert!(!bar(10.0, 10.5, 9.5, 9.0).is_valid());
    }

    #[test]
    fn bar_invalid_on_nan() {
        assert!(!bar(f64::NAN, 11.0, 9.0, 10.0).is_valid());
    }

    #[test]
    fn range_pct_zero_close_guard() {
        let b = bar(0.0, 0.0, 0.0, 0.0);
        assert_eq!(b.range_pct(), 0.0);
    }

    #[test]
    fn severity_bands() {
        assert_eq!(Severity::from_z(0.0), Severity::Low);
        assert_eq!(Severity::from_z(2.99), Severity::Low);
        assert_eq!(Severity::from_z(3.0), Severity::Medium);
        assert_eq!(Severity::from_z(3.99), Severity::Medium);
        assert_eq!(Severity::from_z(4.0), Severity::High);
        assert_eq!(Severity::from_z(4.99), Severity::High);
        assert_eq!(Severity::from_z(5.0), Severity::Critical);
        assert_eq!(Severity::from_z(12.0), Severity::Critical);
    }

    #[test]
    fn severity_monotone_in_z() {
        // For any z_a <= z_b, severity(a) <= severity(b).
        let grid: Vec<f64> = (0..120).map(|i| i as f64 * 0.1).collect();
        for pair in grid.windows(2) {
            assert!(Severity::from_z(pair[0]) <= Severity::from_z(pair[1]));
        }
    }

    #[test]
    fn pattern_type_roundtrip() {
        for p in PatternType::ALL {
            assert_eq!(PatternType::parse(p.as_str()), Some(p));
        }
        assert_eq!(PatternType::parse("nonsense"), None);
    }

    #[test]
    fn decision_state_roundtrip() {
        for s in [
            DecisionState::Ignore,
            DecisionState::Monitor,
            DecisionState::Review,
            DecisionState::Execute,
        ] {
            assert_eq!(DecisionState::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn user_action_engagement() {
        assert!(!UserActionKind::Ignored.engaged());
        assert!(UserActionKind::Reviewed.engaged());
        assert!(UserActionKind::Traded.engaged());
    }

    #[test]
    fn serde_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&PatternType::VolumeSpike).unwrap(),
            "\"volume_spike\""
        );
        assert_eq!(
            serde_json::to_string(&DecisionState::Execute).unwrap(),
            "\"execute\""
        );
        assert_eq!(
            serde_json::to_string(&Severity::Critical).unwrap(),
            "\"critical\""
        );
    }
}
