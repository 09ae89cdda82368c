// =============================================================================
// Adaptive Thresholds — outcome-driven per-(user, pattern, symbol) z tuning
// =============================================================================
//
// Periodically scans pattern-quality rows with enough samples and adjusts
// the detection threshold override table:
//
//   accuracy < 30%                      -> raise by 0.5 (cap 5.0), fewer signals
//   accuracy > 60% and review_rate > 50% -> lower by 0.3 (floor 2.0), more signals
//
// The detector reads the override table before each evaluation, so changes
// take effect on the next cycle.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::store::Database;
use crate::types::{PatternQuality, PatternType};

/// Quality rows below this sample count are left alone.
const MIN_SAMPLES: u32 = 10;
/// Adjustment bands.
const LOW_ACCURACY: f64 = 0.30;
const HIGH_ACCURACY: f64 = 0.60;
const HIGH_REVIEW_RATE: f64 = 0.50;
const RAISE_STEP: f64 = 0.5;
const LOWER_STEP: f64 = 0.3;
const THRESHOLD_CAP: f64 = 5.0;
const THRESHOLD_FLOOR: f64 = 2.0;

/// One applied adjustment, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdAdjustment {
    pub user_id: String,
    pub pattern_type: PatternType,
    pub symbol: String,
    pub old_threshold: f64,
    pub new_threshold: f64,
    pub reason: String,
}

/// Result of one adaptation pass.
#[derive(Debug, Clone, Serialize)]
pub struct AdaptationReport {
    pub patterns_analyzed: usize,
    pub adjustments: Vec<ThresholdAdjustment>,
}

pub struct AdaptiveThresholds {
    config: Arc<RwLock<EngineConfig>>,
    store: Arc<Database>,
}

impl AdaptiveThresholds {
    pub fn new(config: Arc<RwLock<EngineConfig>>, store: Arc<Database>) -> Self {
        Self { config, store }
    }

    /// Scan every qualifying quality row and apply threshold adjustments.
    pub fn analyze_and_adapt(&self, now: DateTime<Utc>) -> Result<AdaptationReport> {
        let rows = self.store.quality_rows(MIN_SAMPLES)?;
        let mut adjustments = Vec::new();

        for row in &rows {
            let Some(adjustment) = self.suggest(row)? else {
                continue;
            };

            self.store.upsert_threshold(
                &adjustment.user_id,
                adjustment.pattern_type,
                &adjustment.symbol,
                adjustment.new_threshold,
                &adjustment.reason,
                now,
            )?;
            adjustments.push(adjustment);
        }

        if adjustments.is_empty() {
            info!(
                analyzed = rows.len(),
                "adaptive scan complete; no adjustments needed"
            );
        } else {
            info!(
                analyzed = rows.len(),
                adjustments = adjustments.len(),
                "adaptive scan applied threshold adjustments"
            );
        }

        Ok(AdaptationReport {
            patterns_analyzed: rows.len(),
            adjustments,
        })
    }

    fn suggest(&self, row: &PatternQuality) -> Result<Option<ThresholdAdjustment>> {
        // The stored override (if any) is the threshold actually in force.
        let current = match self
            .store
            .read_threshold(&row.user_id, row.pattern_type, &row.symbol)?
        {
            Some(z) => z,
            None => self.default_threshold(row.pattern_type),
        };

        if row.accuracy < LOW_ACCURACY {
            let new = (current + RAISE_STEP).min(THRESHOLD_CAP);
            if (new - current).abs() < f64::EPSILON {
                return Ok(None);
            }
            return Ok(Some(ThresholdAdjustment {
                user_id: row.user_id.clone(),
                pattern_type: row.pattern_type,
                symbol: row.symbol.clone(),
                old_threshold: current,
                new_threshold: new,
                reason: format!(
                    "low accuracy ({:.0}%) - raising threshold to reduce noise",
                    row.accuracy * 100.0
                ),
            }));
        }

        if row.accuracy > HIGH_ACCURACY && row.review_rate > HIGH_REVIEW_RATE {
            let new = (current - LOWER_STEP).max(THRESHOLD_FLOOR);
            if (new - current).abs() < f64::EPSILON {
                return Ok(None);
            }
            return Ok(Some(ThresholdAdjustment {
                user_id: row.user_id.clone(),
                pattern_type: row.pattern_type,
                symbol: row.symbol.clone(),
                old_threshold: current,
                new_threshold: new,
                reason: format!(
                    "high accuracy ({:.0}%) and engagement - lowering threshold",
                    row.accuracy * 100.0
                ),
            }));
        }

        Ok(None)
    }

    fn default_threshold(&self, pattern: PatternType) -> f64 {
        let config = self.config.read();
        match pattern {
            PatternType::VolumeSpike => config.detection.volume_spike.z_score,
            PatternType::PriceMomentum => config.detection.price_momentum.z_score,
            PatternType::VolatilitySurge => config.detection.volatility_surge.z_score,
            PatternType::BreakoutHigh | PatternType::BreakoutLow => {
                config.detection.breakout_volume_z
            }
        }
    }
}

/// Drive the adaptation pass on its configured interval until cancelled.
pub async fn run_adaptive_job(
    adaptive: Arc<AdaptiveThresholds>,
    clock: Arc<dyn crate::services::Clock>,
    cancel: CancellationToken,
) {
    let interval_secs = adaptive.config.read().adaptive_interval_secs.max(60);
    let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
    info!(interval_secs, "adaptive threshold job started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("adaptive threshold job stopped");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = adaptive.analyze_and_adapt(clock.now()) {
                    warn!(error = %e, "adaptive scan failed");
                }
            }
        }
    }
}
