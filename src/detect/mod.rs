// =============================================================================
// Anomaly Detector — z-score tests over a bar window
// =============================================================================
//
// From a bar window of length N the detector tests the newest bar for
// unusual volume, price movement, and intraday range, plus 20-bar breakout
// rules with volume confirmation. Each rule emits at most one event per
// evaluation; all rules are always evaluated.
//
// The detector is a pure function: identical window + identical thresholds
// produce identical anomalies, including their ids (derived from symbol,
// pattern, and detection instant — re-detecting the same bar upserts the
// same row instead of duplicating it).
//
// Thresholds are read per evaluation. A per-(user, pattern, symbol) override
// from the adaptive threshold store supersedes the configured default.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::config::DetectionConfig;
use crate::types::{Bar, PatternType, Severity};

/// Resolved per-pattern z-threshold overrides for one (user, symbol).
pub type ThresholdOverrides = HashMap<PatternType, f64>;

// =============================================================================
// Types
// =============================================================================

/// A detected unusual event on the newest bar of a window. Immutable once
/// created; persisted alongside the agent's decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: String,
    pub symbol: String,
    pub pattern_type: PatternType,
    pub severity: Severity,
    /// Absolute z of the driving metric.
    pub z_score: f64,
    pub price: f64,
    pub volume: u64,
    pub detected_at: DateTime<Utc>,
    /// One-line description of what fired.
    pub description: String,
    /// Narrative context for the signal feed.
    pub context: String,
    /// Data provenance line.
    pub sources: String,
    /// Step-by-step analysis trail.
    pub thought_process: String,
}

/// Fatal per-symbol failure: the window itself is inconsistent. Carries a
/// hash of the offending window so the exact input can be identified in
/// logs without dumping every bar.
#[derive(Debug, Error)]
#[error("bar window invariant violated: {reason} (window {window_hash})")]
pub struct InvariantViolation {
    pub reason: String,
    pub window_hash: String,
}

/// Summary statistics of the reference window, shared by the rules and the
/// narrative builders.
struct WindowStats {
    volume_mean: f64,
    volume_z: Option<f64>,
    return_current: f64,
    return_z: Option<f64>,
    range_mean: f64,
    range_z: Option<f64>,
    high_20: f64,
    low_20: f64,
    prev_close: f64,
}

// =============================================================================
// Detection
// =============================================================================

/// Run all detection rules over `bars` (oldest-first) and return the events
/// for the newest bar. Returns an empty vec when the window is too short for
/// every rule.
pub fn detect(
    bars: &[Bar],
    cfg: &DetectionConfig,
    overrides: &ThresholdOverrides,
) -> Result<Vec<Anomaly>, InvariantViolation> {
    if bars.len() < 2 {
        return Ok(Vec::new());
    }

    validate_window(bars)?;

    let last = bars.last().expect("len checked above");
    let n = bars.len();
    let stats = window_stats(bars);

    let mut anomalies = Vec::new();

    // ── 1. Volume spike ─────────────────────────────────────────────────
    if n >= cfg.volume_spike.min_data_points {
        let threshold = effective_threshold(
            overrides,
            PatternType::VolumeSpike,
            cfg.volume_spike.z_score,
        );
        if let Some(z) = stats.volume_z {
            if last.volume >= cfg.volume_spike.min_volume && z >= threshold {
                check_finite(z, bars)?;
                anomalies.push(build_anomaly(
                    last,
                    PatternType::VolumeSpike,
                    z,
                    &stats,
                    format!(
                        "Volume {:.1}σ above average ({} vs avg {})",
                        z, last.volume, stats.volume_mean as u64
                    ),
                ));
            }
        }
    }

    // ── 2. Price momentum ───────────────────────────────────────────────
    if n >= cfg.price_momentum.min_data_points {
        let threshold = effective_threshold(
            overrides,
            PatternType::PriceMomentum,
            cfg.price_momentum.z_score,
        );
        if let Some(z) = stats.return_z {
            let abs_z = z.abs();
            if stats.return_current.abs() >= cfg.price_momentum.min_change && abs_z >= threshold
            {
                check_finite(abs_z, bars)?;
                let direction = if stats.return_current > 0.0 { "up" } else { "down" };
                anomalies.push(build_anomaly(
                    last,
                    PatternType::PriceMomentum,
                    abs_z,
                    &stats,
                    format!(
                        "Price moved {} {:.2}% ({:.1}σ)",
                        direction,
                        stats.return_current.abs() * 100.0,
                        abs_z
                    ),
                ));
            }
        }
    }

    // ── 3. Volatility surge ─────────────────────────────────────────────
    if n >= cfg.volatility_surge.min_data_points {
        let threshold = effective_threshold(
            overrides,
            PatternType::VolatilitySurge,
            cfg.volatility_surge.z_score,
        );
        if let Some(z) = stats.range_z {
            if z >= threshold {
                check_finite(z, bars)?;
                anomalies.push(build_anomaly(
                    last,
                    PatternType::VolatilitySurge,
                    z,
                    &stats,
                    format!(
                        "Volatility {:.1}σ above normal (range {:.2}%)",
                        z,
                        last.range_pct() * 100.0
                    ),
                ));
            }
        }
    }

    // ── 4. Breakouts (20-bar extremes with volume confirmation) ─────────
    if n >= 21 {
        if let Some(vol_z) = stats.volume_z {
            let high_confirm =
                effective_threshold(overrides, PatternType::BreakoutHigh, cfg.breakout_volume_z);
            if vol_z >= high_confirm && last.high > stats.high_20 {
                check_finite(vol_z, bars)?;
                anomalies.push(build_anomaly(
                    last,
                    PatternType::BreakoutHigh,
                    vol_z,
                    &stats,
                    format!(
                        "Broke above the 20-bar high of {:.2} on elevated volume ({:.1}σ)",
                        stats.high_20, vol_z
                    ),
                ));
            }

            let low_confirm =
                effective_threshold(overrides, PatternType::BreakoutLow, cfg.breakout_volume_z);
            if vol_z >= low_confirm && last.low < stats.low_20 {
                check_finite(vol_z, bars)?;
                anomalies.push(build_anomaly(
                    last,
                    PatternType::BreakoutLow,
                    vol_z,
                    &stats,
                    format!(
                        "Broke below the 20-bar low of {:.2} on elevated volume ({:.1}σ)",
                        stats.low_20, vol_z
                    ),
                ));
            }
        }
    }

    if !anomalies.is_empty() {
        debug!(
            symbol = %last.symbol,
            count = anomalies.len(),
            "anomalies emitted"
        );
    }

    Ok(anomalies)
}

/// Pick the override for `pattern` if one exists, else the default.
fn effective_threshold(
    overrides: &ThresholdOverrides,
    pattern: PatternType,
    default: f64,
) -> f64 {
    overrides.get(&pattern).copied().unwrap_or(default)
}

// =============================================================================
// Window statistics
// =============================================================================

fn window_stats(bars: &[Bar]) -> WindowStats {
    let n = bars.len();
    let last = &bars[n - 1];

    // Reference excludes the newest bar.
    let reference = &bars[..n - 1];

    // Volume z against the reference distribution.
    let volumes: Vec<f64> = reference.iter().map(|b| b.volume as f64).collect();
    let (vol_mean, vol_std) = mean_std(&volumes);
    let volume_z = if vol_std > 0.0 {
        Some((last.volume as f64 - vol_mean) / vol_std)
    } else {
        None
    };

    // Return z: the newest return against all prior returns.
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let returns: Vec<f64> = closes
        .windows(2)
        .map(|w| if w[0] != 0.0 { w[1] / w[0] - 1.0 } else { 0.0 })
        .collect();
    let return_current = returns.last().copied().unwrap_or(0.0);
    let prior_returns = &returns[..returns.len() - 1];
    let (ret_mean, ret_std) = mean_std(prior_returns);
    let return_z = if ret_std > 0.0 {
        Some((return_current - ret_mean) / ret_std)
    } else {
        None
    };

    // Intraday range z.
    let ranges: Vec<f64> = reference.iter().map(|b| b.range_pct()).collect();
    let (range_mean, range_std) = mean_std(&ranges);
    let range_z = if range_std > 0.0 {
        Some((last.range_pct() - range_mean) / range_std)
    } else {
        None
    };

    // Previous 20-bar extremes, excluding the newest bar.
    let breakout_window = &reference[reference.len().saturating_sub(20)..];
    let high_20 = breakout_window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let low_20 = breakout_window.iter().map(|b| b.low).fold(f64::MAX, f64::min);

    let prev_close = reference.last().map(|b| b.close).unwrap_or(last.close);

    WindowStats {
        volume_mean: vol_mean,
        volume_z,
        return_current,
        return_z,
        range_mean,
        range_z,
        high_20,
        low_20,
        prev_close,
    }
}

/// Mean and population standard deviation. `(0, 0)` for an empty slice.
fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    (mean, var.sqrt())
}

// =============================================================================
// Invariant checks
// =============================================================================

fn validate_window(bars: &[Bar]) -> Result<(), InvariantViolation> {
    for bar in bars {
        if !bar.is_valid() {
            return Err(InvariantViolation {
                reason: format!(
                    "bad OHLC at {} (o={} h={} l={} c={})",
                    bar.ts, bar.open, bar.high, bar.low, bar.close
                ),
                window_hash: window_hash(bars),
            });
        }
    }
    Ok(())
}

fn check_finite(z: f64, bars: &[Bar]) -> Result<(), InvariantViolation> {
    if z.is_finite() {
        Ok(())
    } else {
        Err(InvariantViolation {
            reason: "non-finite z-score".to_string(),
            window_hash: window_hash(bars),
        })
    }
}

/// Stable hex digest of the window contents for log correlation.
pub fn window_hash(bars: &[Bar]) -> String {
    let mut hasher = Sha256::new();
    for bar in bars {
        hasher.update(bar.symbol.as_bytes());
        hasher.update(bar.ts.timestamp().to_le_bytes());
        hasher.update(bar.open.to_le_bytes());
        hasher.update(bar.high.to_le_bytes());
        hasher.update(bar.low.to_le_bytes());
        hasher.update(bar.close.to_le_bytes());
        hasher.update(bar.volume.to_le_bytes());
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Deterministic anomaly id from the identifying triple.
fn anomaly_id(symbol: &str, pattern: PatternType, detected_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(symbol.as_bytes());
    hasher.update(pattern.as_str().as_bytes());
    hasher.update(detected_at.timestamp().to_le_bytes());
    let digest = hasher.finalize();
    format!("sig-{}", hex::encode(&digest[..6]))
}

// =============================================================================
// Narrative builders
// =============================================================================

fn build_anomaly(
    last: &Bar,
    pattern: PatternType,
    z: f64,
    stats: &WindowStats,
    description: String,
) -> Anomaly {
    Anomaly {
        id: anomaly_id(&last.symbol, pattern, last.ts),
        symbol: last.symbol.clone(),
        pattern_type: pattern,
        severity: Severity::from_z(z),
        z_score: z,
        price: last.close,
        volume: last.volume,
        detected_at: last.ts,
        description,
        context: build_context(last, pattern, z, stats),
        sources: build_sources(last, stats),
        thought_process: build_thought_process(last, pattern, z, stats),
    }
}

fn build_context(last: &Bar, pattern: PatternType, z: f64, stats: &WindowStats) -> String {
    let vol_ratio = if stats.volume_mean > 0.0 {
        last.volume as f64 / stats.volume_mean
    } else {
        1.0
    };
    let price_change_pct = stats.return_current * 100.0;

    match pattern {
        PatternType::VolumeSpike => format!(
            "{} detected with unusual volume - {:.1}x the 20-bar average. \
             Activity at this level occurs in less than {:.1}% of bars, \
             suggesting institutional interest or news-driven trading.",
            last.symbol,
            vol_ratio,
            normal_tail_pct(z)
        ),
        PatternType::PriceMomentum => {
            let direction = if stats.return_current > 0.0 { "upward" } else { "downward" };
            format!(
                "{} showing strong {} momentum with a {:.2}% move, {:.1} standard \
                 deviations from typical bar-to-bar moves. Moves of this size occur \
                 less than {:.1}% of the time, indicating a shift in sentiment.",
                last.symbol,
                direction,
                price_change_pct.abs(),
                z,
                normal_tail_pct(z)
            )
        }
        PatternType::VolatilitySurge => {
            let range_ratio = if stats.range_mean > 0.0 {
                last.range_pct() / stats.range_mean
            } else {
                1.0
            };
            format!(
                "{} experiencing elevated volatility - the current range is {:.1}x \
                 the 20-bar average. Expansion like this suggests uncertainty or \
                 positioning ahead of a significant move.",
                last.symbol, range_ratio
            )
        }
        PatternType::BreakoutHigh => format!(
            "{} broke above its 20-bar high of {:.2} on {:.1}x volume. A breakout \
             with volume confirmation often precedes sustained upward moves. \
             Closed at {:.2}.",
            last.symbol, stats.high_20, vol_ratio, last.close
        ),
        PatternType::BreakoutLow => format!(
            "{} broke below its 20-bar low of {:.2} on {:.1}x volume. A breakdown \
             with volume confirmation suggests potential further downside. \
             Closed at {:.2}.",
            last.symbol, stats.low_20, vol_ratio, last.close
        ),
    }
}

fn build_sources(last: &Bar, stats: &WindowStats) -> String {
    let vol_ratio = if stats.volume_mean > 0.0 {
        last.volume as f64 / stats.volume_mean
    } else {
        1.0
    };
    let price_change_pct = if stats.prev_close > 0.0 {
        (last.close - stats.prev_close) / stats.prev_close * 100.0
    } else {
        0.0
    };

    format!(
        "Market data feed | Price: {:.2} ({:+.2}%) | Volume: {} ({:.1}x avg) | \
         Range: {:.2} - {:.2} | 20-bar baseline",
        last.close, price_change_pct, last.volume, vol_ratio, last.low, last.high
    )
}

fn build_thought_process(
    last: &Bar,
    pattern: PatternType,
    z: f64,
    stats: &WindowStats,
) -> String {
    let fmt_check = |z: Option<f64>| match z {
        Some(z) if z.abs() >= 2.0 => format!("{z:.2} - ANOMALY DETECTED"),
        Some(z) => format!("{z:.2} - Normal range"),
        None => "n/a (flat reference)".to_string(),
    };

    let lines = [
        format!(
            "1. VOLUME: {} vs 20-bar avg {} | Z: {}",
            last.volume,
            stats.volume_mean as u64,
            fmt_check(stats.volume_z)
        ),
        format!(
            "2. PRICE: closed at {:.2} ({:+.2}% vs prior bar) | Z: {}",
            last.close,
            stats.return_current * 100.0,
            fmt_check(stats.return_z)
        ),
        format!(
            "3. RANGE: {:.2}% of close vs avg {:.2}% | Z: {}",
            last.range_pct() * 100.0,
            stats.range_mean * 100.0,
            fmt_check(stats.range_z)
        ),
        format!(
            "4. BREAKOUT: 20-bar high {:.2} {} | 20-bar low {:.2} {}",
            stats.high_20,
            if last.high > stats.high_20 { "BROKEN" } else { "intact" },
            stats.low_20,
            if last.low < stats.low_20 { "BROKEN" } else { "intact" },
        ),
        format!(
            "CONCLUSION: {} at z={:.2} ({}); chance probability < {:.1}%",
            pattern,
            z,
            Severity::from_z(z),
            normal_tail_pct(z)
        ),
    ];

    lines.join("\n")
}

/// One-tailed normal tail probability as a percentage, via the
/// Zelen-Severo polynomial approximation of the standard normal CDF.
fn normal_tail_pct(z: f64) -> f64 {
    let z = z.abs();
    let t = 1.0 / (1.0 + 0.231_641_9 * z);
    let poly = t
        * (0.319_381_530
            + t * (-0.356_563_782
                + t * (1.781_477_937 + t * (-1.821_255_978 + t * 1.330_274_429))));
    let pdf = (-z * z / 2.0).exp() / (2.0 * std::f64::consts::PI).sqrt();
    (pdf * poly * 100.0).max(0.0)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn make_bars(closes: &[f64], volumes: &[u64]) -> Vec<Bar> {
        assert_eq!(closes.len(), volumes.len());
        closes
            .iter()
            .zip(volumes)
            .enumerate()
            .map(|(i, (&close, &volume))| Bar {
                symbol: "AAPL".into(),
                ts: Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap()
                    + chrono::Duration::minutes(5 * i as i64),
                open: close,
                high: close * 1.001,
                low: close * 0.999,
                close,
                volume,
            })
            .collect()
    }

    /// 60 flat bars whose volumes sit near 1M with ~100k spread; the newest
    /// bar prints 1.6M, roughly six sigma over the reference.
    fn spike_window() -> Vec<Bar> {
        let mut volumes: Vec<u64> = (0..59)
            .map(|i| if i % 2 == 0 { 900_000 } else { 1_100_000 })
            .collect();
        volumes.push(1_600_000);
        let closes = vec![100.0; 60];
        make_bars(&closes, &volumes)
    }

    #[test]
    fn clear_volume_spike_is_critical() {
        let bars = spike_window();
        let cfg = DetectionConfig::default();
        let anomalies = detect(&bars, &cfg, &ThresholdOverrides::new()).unwrap();

        assert_eq!(anomalies.len(), 1);
        let a = &anomalies[0];
        assert_eq!(a.pattern_type, PatternType::VolumeSpike);
        assert!(a.z_score > 5.5 && a.z_score < 6.5, "z was {}", a.z_score);
        assert_eq!(a.severity, Severity::Critical);
        assert_eq!(a.volume, 1_600_000);
        assert!(a.context.contains("unusual volume"));
        assert!(a.thought_process.contains("ANOMALY DETECTED"));
    }

    #[test]
    fn constant_volume_skips_test() {
        // Reference stddev is zero: the test must be skipped, not divided.
        let bars = make_bars(&[100.0; 30], &[1_000_000; 30]);
        let cfg = DetectionConfig::default();
        let anomalies = detect(&bars, &cfg, &ThresholdOverrides::new()).unwrap();
        assert!(anomalies.is_empty());
    }

    #[test]
    fn volume_floor_suppresses_small_symbols() {
        // Same shape as the spike window but three orders of magnitude
        // smaller: the
        // z fires but the absolute floor does not.
        let mut volumes: Vec<u64> = (0..59)
            .map(|i| if i % 2 == 0 { 900 } else { 1_100 })
            .collect();
        volumes.push(1_600);
        let bars = make_bars(&vec![100.0; 60], &volumes);
        let cfg = DetectionConfig::default();
        let anomalies = detect(&bars, &cfg, &ThresholdOverrides::new()).unwrap();
        assert!(anomalies.is_empty());
    }

    #[test]
    fn short_window_emits_nothing() {
        // Ten bars is below every rule's minimum.
        let bars = make_bars(&[100.0; 10], &[1_000_000; 10]);
        let cfg = DetectionConfig::default();
        let anomalies = detect(&bars, &cfg, &ThresholdOverrides::new()).unwrap();
        assert!(anomalies.is_empty());
    }

    #[test]
    fn price_momentum_preserves_direction_in_description() {
        // Gentle alternation, then a hard 3% drop on the newest bar.
        let mut closes: Vec<f64> = (0..39)
            .map(|i| 100.0 + if i % 2 == 0 { 0.05 } else { -0.05 })
            .collect();
        closes.push(closes[38] * 0.97);
        let bars = make_bars(&closes, &[1_000_000; 40]);
        let cfg = DetectionConfig::default();
        let anomalies = detect(&bars, &cfg, &ThresholdOverrides::new()).unwrap();

        let momentum: Vec<_> = anomalies
            .iter()
            .filter(|a| a.pattern_type == PatternType::PriceMomentum)
            .collect();
        assert_eq!(momentum.len(), 1);
        assert!(momentum[0].z_score > 0.0);
        assert!(momentum[0].description.contains("down"));
    }

    #[test]
    fn volatility_surge_fires_on_range_expansion() {
        let mut bars = make_bars(&[100.0; 40], &[1_000_000; 40]);
        // Give the reference bars a small uniform range and vary it slightly
        // so the reference stddev is positive.
        for (i, bar) in bars.iter_mut().enumerate() {
            let wiggle = if i % 2 == 0 { 0.10 } else { 0.12 };
            bar.high = 100.0 + wiggle;
            bar.low = 100.0 - wiggle;
        }
        // Newest bar: range an order of magnitude wider.
        let last = bars.last_mut().unwrap();
        last.high = 102.0;
        last.low = 98.0;

        let cfg = DetectionConfig::default();
        let anomalies = detect(&bars, &cfg, &ThresholdOverrides::new()).unwrap();
        assert!(anomalies
            .iter()
            .any(|a| a.pattern_type == PatternType::VolatilitySurge));
    }

    #[test]
    fn breakout_high_requires_volume_confirmation() {
        let mut closes: Vec<f64> = (0..39)
            .map(|i| 100.0 + if i % 2 == 0 { 0.2 } else { -0.2 })
            .collect();
        closes.push(101.5);

        // Without a volume push: no breakout event.
        let bars = make_bars(&closes, &[1_000_000; 40]);
        let cfg = DetectionConfig::default();
        let anomalies = detect(&bars, &cfg, &ThresholdOverrides::new()).unwrap();
        assert!(!anomalies
            .iter()
            .any(|a| a.pattern_type == PatternType::BreakoutHigh));

        // With elevated volume (z >= 1.5 but below the spike threshold):
        // the breakout fires and carries the volume z.
        let mut volumes: Vec<u64> = (0..39)
            .map(|i| if i % 2 == 0 { 900_000 } else { 1_100_000 })
            .collect();
        volumes.push(1_200_000); // z ~= 2.0
        let bars = make_bars(&closes, &volumes);
        let anomalies = detect(&bars, &cfg, &ThresholdOverrides::new()).unwrap();

        let breakout: Vec<_> = anomalies
            .iter()
            .filter(|a| a.pattern_type == PatternType::BreakoutHigh)
            .collect();
        assert_eq!(breakout.len(), 1);
        assert!(breakout[0].z_score >= 1.5 && breakout[0].z_score < 2.5);
    }

    #[test]
    fn override_supersedes_default_threshold() {
        let bars = spike_window();
        let cfg = DetectionConfig::default();

        // Raise the volume threshold above the observed z of ~6: nothing fires.
        let mut overrides = ThresholdOverrides::new();
        overrides.insert(PatternType::VolumeSpike, 8.0);
        let anomalies = detect(&bars, &cfg, &overrides).unwrap();
        assert!(anomalies.is_empty());

        // Lower it back down: the spike fires again.
        overrides.insert(PatternType::VolumeSpike, 3.0);
        let anomalies = detect(&bars, &cfg, &overrides).unwrap();
        assert_eq!(anomalies.len(), 1);
    }

    #[test]
    fn invalid_bar_is_invariant_violation() {
        let mut bars = spike_window();
        bars[10].low = 200.0; // low above high
        let cfg = DetectionConfig::default();
        let err = detect(&bars, &cfg, &ThresholdOverrides::new()).unwrap_err();
        assert!(!err.window_hash.is_empty());
        assert!(err.reason.contains("bad OHLC"));
    }

    #[test]
    fn detector_is_deterministic_including_ids() {
        let bars = spike_window();
        let cfg = DetectionConfig::default();
        let a = detect(&bars, &cfg, &ThresholdOverrides::new()).unwrap();
        let b = detect(&bars, &cfg, &ThresholdOverrides::new()).unwrap();
        assert_eq!(a.len(), b.len());
        assert_eq!(a[0].id, b[0].id);
        assert!((a[0].z_score - b[0].z_score).abs() < f64::EPSILON);
    }

    #[test]
    fn severity_follows_z_bands_on_emitted_events() {
        // Tune the newest volume to land the z in each band.
        let base: Vec<u64> = (0..59)
            .map(|i| if i % 2 == 0 { 900_000 } else { 1_100_000 })
            .collect();
        // Reference mean ~998k, std ~100k.
        let cases = [
            (1_330_000u64, Severity::Medium),  // z ~= 3.3
            (1_450_000u64, Severity::High),    // z ~= 4.5
            (1_600_000u64, Severity::Critical) // z ~= 6.0
        ];
        let cfg = DetectionConfig::default();
        for (volume, expected) in cases {
            let mut volumes = base.clone();
            volumes.push(volume);
            let bars = make_bars(&vec![100.0; 60], &volumes);
            let anomalies = detect(&bars, &cfg, &ThresholdOverrides::new()).unwrap();
            assert_eq!(anomalies.len(), 1);
            assert_eq!(anomalies[0].severity, expected, "volume {volume}");
        }
    }

    #[test]
    fn window_hash_is_stable_and_input_sensitive() {
        let bars = spike_window();
        assert_eq!(window_hash(&bars), window_hash(&bars));

        let mut changed = bars.clone();
        changed[0].close += 0.01;
        changed[0].high += 0.01;
        assert_ne!(window_hash(&bars), window_hash(&changed));
    }

    #[test]
    fn normal_tail_shrinks_with_z() {
        assert!(normal_tail_pct(2.0) > normal_tail_pct(3.0));
        assert!(normal_tail_pct(3.0) > normal_tail_pct(5.0));
        // Z=2 one-tailed is about 2.3%.
        assert!((normal_tail_pct(2.0) - 2.275).abs() < 0.1);
    }
}
