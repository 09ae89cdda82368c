// =============================================================================
// Regime Classifier
// =============================================================================
//
// Summarizes a bar window as a `RegimeContext` — a coarse label for current
// market behavior plus the measurements behind it. Downstream the context
// feeds the composite-confidence score and the causal learner's keys.
//
// Classification hierarchy (evaluated top-to-bottom; first match wins):
//
//   1. HIGH_VOLATILITY — current rolling stddev > 80th percentile
//   2. LOW_VOLATILITY  — current rolling stddev < 20th percentile
//   3. TRENDING_UP/DOWN — |EMA(8) − EMA(21)| / EMA(21) > 2%
//   4. BREAKOUT        — close within 1% of the rolling 20-bar high
//   5. RANGING         — everything else
//
// A window shorter than the minimum yields UNKNOWN with neutral defaults.

use chrono::{Datelike, FixedOffset, Timelike};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::market::BarInterval;
use crate::types::Bar;

/// Minimum bars for a meaningful classification.
const MIN_WINDOW: usize = 20;

/// Width of the rolling stddev window over returns.
const ROLLING_WINDOW: usize = 5;

/// Trend strength above which the market counts as trending.
const TREND_THRESHOLD: f64 = 0.02;

// =============================================================================
// Types
// =============================================================================

/// Coarse market-behavior label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    TrendingUp,
    TrendingDown,
    Ranging,
    HighVolatility,
    LowVolatility,
    Breakout,
    Unknown,
}

impl MarketRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrendingUp => "trending_up",
            Self::TrendingDown => "trending_down",
            Self::Ranging => "ranging",
            Self::HighVolatility => "high_volatility",
            Self::LowVolatility => "low_volatility",
            Self::Breakout => "breakout",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision horizon implied by the bar interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Horizon {
    Scalp,
    Intraday,
    Swing,
    Positional,
}

impl Horizon {
    /// Derive the horizon from the bar interval the window was fetched at.
    pub fn from_interval(interval: BarInterval) -> Self {
        match interval {
            BarInterval::M1 => Self::Scalp,
            BarInterval::M5 | BarInterval::M15 => Self::Intraday,
            BarInterval::H1 => Self::Swing,
            BarInterval::D1 => Self::Positional,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scalp => "scalp",
            Self::Intraday => "intraday",
            Self::Swing => "swing",
            Self::Positional => "positional",
        }
    }
}

impl std::fmt::Display for Horizon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which information stream produced the classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    Technical,
    Sentiment,
    Macro,
    Flow,
    Composite,
}

impl SignalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Technical => "technical",
            Self::Sentiment => "sentiment",
            Self::Macro => "macro",
            Self::Flow => "flow",
            Self::Composite => "composite",
        }
    }
}

impl std::fmt::Display for SignalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Volume relative to the window mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeRegime {
    High,
    Normal,
    Low,
}

impl VolumeRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for VolumeRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session phase of the newest bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeOfDay {
    Open,
    Mid,
    Close,
    AfterHours,
}

impl TimeOfDay {
    pub fn from_hour(hour: u32) -> Self {
        if hour < 10 {
            Self::Open
        } else if hour < 14 {
            Self::Mid
        } else if hour < 16 {
            Self::Close
        } else {
            Self::AfterHours
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Mid => "mid",
            Self::Close => "close",
            Self::AfterHours => "after_hours",
        }
    }
}

impl std::fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable classification of one bar window, derived once per decision
/// cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeContext {
    pub regime: MarketRegime,
    pub horizon: Horizon,
    pub source: SignalSource,

    /// Share of rolling stddev values strictly below the current one, 0-100.
    pub volatility_percentile: f64,

    /// EMA(8) vs EMA(21) divergence, clamped to [-1, 1].
    pub trend_strength: f64,

    pub volume_regime: VolumeRegime,
    pub time_of_day: TimeOfDay,

    /// 0 = Monday .. 6 = Sunday.
    pub day_of_week: u8,
}

impl RegimeContext {
    /// Neutral context for windows too short to classify.
    pub fn unknown(interval: BarInterval) -> Self {
        Self {
            regime: MarketRegime::Unknown,
            horizon: Horizon::from_interval(interval),
            source: SignalSource::Composite,
            volatility_percentile: 50.0,
            trend_strength: 0.0,
            volume_regime: VolumeRegime::Normal,
            time_of_day: TimeOfDay::Mid,
            day_of_week: 0,
        }
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Classify a bar window (oldest-first). Session phase and weekday are
/// taken on the market's local clock (`market_offset`), not UTC. Pure:
/// same window, same context.
pub fn classify(bars: &[Bar], interval: BarInterval, market_offset: FixedOffset) -> RegimeContext {
    if bars.len() < MIN_WINDOW {
        return RegimeContext::unknown(interval);
    }

    let last = bars.last().expect("window checked non-empty");
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

    // ── Return series & rolling stddev ──────────────────────────────────
    let returns = simple_returns(&closes);
    let rolling = rolling_stddev(&returns, ROLLING_WINDOW);

    let current_vol = rolling.last().copied().unwrap_or(0.0);
    let volatility_percentile = strict_percentile_of(&rolling, current_vol);

    // ── Trend strength: EMA(8) vs EMA(21) ───────────────────────────────
    let ema8 = ema(&closes, 8);
    let ema21 = ema(&closes, 21);
    let trend_strength = match (ema8.last(), ema21.last()) {
        (Some(&e8), Some(&e21)) if e21.abs() > f64::EPSILON => {
            ((e8 - e21) / e21).clamp(-1.0, 1.0)
        }
        _ => 0.0,
    };

    // ── Regime selection (ordered by priority) ──────────────────────────
    let p80 = percentile(&rolling, 80.0);
    let p20 = percentile(&rolling, 20.0);
    let window_start = bars.len().saturating_sub(MIN_WINDOW);
    let rolling_high = bars[window_start..]
        .iter()
        .map(|b| b.high)
        .fold(f64::MIN, f64::max);

    let regime = if current_vol > p80 {
        MarketRegime::HighVolatility
    } else if current_vol < p20 {
        MarketRegime::LowVolatility
    } else if trend_strength.abs() > TREND_THRESHOLD {
        if trend_strength > 0.0 {
            MarketRegime::TrendingUp
        } else {
            MarketRegime::TrendingDown
        }
    } else if rolling_high > 0.0 && last.close >= 0.99 * rolling_high {
        MarketRegime::Breakout
    } else {
        MarketRegime::Ranging
    };

    // ── Volume regime: newest volume vs window mean ─────────────────────
    let mean_volume = bars.iter().map(|b| b.volume as f64).sum::<f64>() / bars.len() as f64;
    let volume_regime = if mean_volume > 0.0 {
        let ratio = last.volume as f64 / mean_volume;
        if ratio > 1.5 {
            VolumeRegime::High
        } else if ratio < 0.5 {
            VolumeRegime::Low
        } else {
            VolumeRegime::Normal
        }
    } else {
        VolumeRegime::Normal
    };

    let local = last.ts.with_timezone(&market_offset);
    let context = RegimeContext {
        regime,
        horizon: Horizon::from_interval(interval),
        source: SignalSource::Composite,
        volatility_percentile,
        trend_strength,
        volume_regime,
        time_of_day: TimeOfDay::from_hour(local.hour()),
        day_of_week: local.weekday().num_days_from_monday() as u8,
    };

    trace!(
        symbol = %last.symbol,
        regime = %context.regime,
        vol_pct = format!("{:.0}", context.volatility_percentile),
        trend = format!("{:+.4}", context.trend_strength),
        volume = %context.volume_regime,
        "regime classified"
    );

    context
}

// =============================================================================
// Series helpers
// =============================================================================

/// Simple returns: `close[i] / close[i-1] - 1`.
fn simple_returns(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .map(|w| if w[0] != 0.0 { w[1] / w[0] - 1.0 } else { 0.0 })
        .collect()
}

/// Population stddev over each trailing `window` slice of `values`.
fn rolling_stddev(values: &[f64], window: usize) -> Vec<f64> {
    if values.len() < window || window == 0 {
        return Vec::new();
    }
    values
        .windows(window)
        .map(|w| {
            let mean = w.iter().sum::<f64>() / w.len() as f64;
            let var = w.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / w.len() as f64;
            var.sqrt()
        })
        .collect()
}

/// Exponential moving average seeded with the SMA of the first `period`
/// values. Empty when the series is too short.
fn ema(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;

    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(seed);

    let mut prev = seed;
    for &v in &values[period..] {
        let next = v * multiplier + prev * (1.0 - multiplier);
        if !next.is_finite() {
            break;
        }
        out.push(next);
        prev = next;
    }
    out
}

/// Nearest-rank percentile of an unsorted series. Returns 0 when empty.
fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((q / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Share of `values` strictly below `target`, expressed 0-100.
fn strict_percentile_of(values: &[f64], target: f64) -> f64 {
    if values.is_empty() {
        return 50.0;
    }
    let below = values.iter().filter(|v| **v < target).count();
    below as f64 / values.len() as f64 * 100.0
}
