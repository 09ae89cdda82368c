// =============================================================================
// Detection Engine — per-symbol cycle supervisor
// =============================================================================
//
// Drives one detection cycle over the watchlist: for each symbol, fetch a
// bar window, classify the regime, run the detector under the user's
// threshold overrides, score and decide each anomaly, persist it, and seed
// outcome tracking for every non-ignore decision.
//
// Per-symbol tasks run concurrently under a semaphore so external provider
// rate limits are respected. A symbol that fails — fetch exhaustion,
// invariant violation, even a panic — is skipped for the cycle without
// taking the others down. `save_anomaly` strictly precedes the follow-up
// enqueue; a crash in between is healed by the tracker's recovery scan.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::decision::DecisionInputs;
use crate::detect::{self, Anomaly};
use crate::market::FetchPeriod;
use crate::regime;
use crate::services::Services;
use crate::tracking::OutcomeTracker;
use crate::types::{DecisionState, PatternType};

/// Aggregate result of one detection cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub symbols_scanned: usize,
    pub symbols_skipped: usize,
    pub anomalies_found: usize,
    pub follow_ups_started: usize,
}

/// Per-symbol result inside a cycle.
enum SymbolOutcome {
    Completed { anomalies: usize, tracked: usize },
    Skipped,
}

pub struct DetectionEngine {
    services: Arc<Services>,
    tracker: Arc<OutcomeTracker>,
}

impl DetectionEngine {
    pub fn new(services: Arc<Services>, tracker: Arc<OutcomeTracker>) -> Self {
        Self { services, tracker }
    }

    /// Run one full cycle over the configured watchlist. Returns early (with
    /// partial stats) when cancelled.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleStats {
        let (symbols, max_parallel) = {
            let config = self.services.config.read();
            (config.symbols.clone(), config.max_parallel_symbols.max(1))
        };

        info!(
            symbols = symbols.len(),
            max_parallel, "detection cycle starting"
        );

        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let mut handles = Vec::with_capacity(symbols.len());

        for symbol in symbols {
            let services = self.services.clone();
            let tracker = self.tracker.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return SymbolOutcome::Skipped;
                };

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => SymbolOutcome::Skipped,
                    outcome = analyze_symbol(&services, &tracker, &symbol) => {
                        match outcome {
                            Ok(result) => result,
                            Err(e) => {
                                warn!(symbol = %symbol, error = %e, "symbol skipped this cycle");
                                SymbolOutcome::Skipped
                            }
                        }
                    }
                }
            }));
        }

        let mut stats = CycleStats::default();
        for handle in handles {
            match handle.await {
                Ok(SymbolOutcome::Completed { anomalies, tracked }) => {
                    stats.symbols_scanned += 1;
                    stats.anomalies_found += anomalies;
                    stats.follow_ups_started += tracked;
                }
                Ok(SymbolOutcome::Skipped) => {
                    stats.symbols_skipped += 1;
                }
                Err(e) => {
                    // A panicked symbol task is contained here.
                    error!(error = %e, "symbol task crashed — contained");
                    stats.symbols_skipped += 1;
                }
            }
        }

        self.services.agent.log_stats();
        self.log_regime_insights();
        info!(
            scanned = stats.symbols_scanned,
            skipped = stats.symbols_skipped,
            anomalies = stats.anomalies_found,
            follow_ups = stats.follow_ups_started,
            "detection cycle complete"
        );

        stats
    }

    /// End-of-cycle diagnostics: what the learner currently believes about
    /// each pattern across regimes.
    fn log_regime_insights(&self) {
        let now = self.services.clock.now();
        for pattern in PatternType::ALL {
            let insights = self.services.learner.regime_insights(pattern, now);
            for (regime, insight) in insights {
                debug!(
                    pattern = %pattern,
                    regime = %regime,
                    success_rate = format!("{:.2}", insight.success_rate),
                    samples = insight.sample_size,
                    recommendation = %insight.recommendation,
                    "regime insight"
                );
            }
        }
    }
}

/// The full per-symbol pipeline: fetch, classify, detect, decide, persist,
/// seed follow-up.
async fn analyze_symbol(
    services: &Arc<Services>,
    tracker: &Arc<OutcomeTracker>,
    symbol: &str,
) -> Result<SymbolOutcome> {
    let (user_id, lookback_days, bar_interval, min_bars, detection, market_offset) = {
        let config = services.config.read();
        (
            config.user_id.clone(),
            config.lookback_days,
            config.bar_interval,
            config.min_bars,
            config.detection.clone(),
            config.market_offset(),
        )
    };

    // ── 1. Bars ─────────────────────────────────────────────────────────
    let window = match services
        .market
        .fetch_bars(symbol, FetchPeriod::days(lookback_days), bar_interval)
        .await
    {
        Ok(result) => result,
        Err(e) => {
            info!(symbol, error = %e, "no market data this cycle");
            return Ok(SymbolOutcome::Skipped);
        }
    };

    if window.bars.len() < min_bars {
        info!(
            symbol,
            bars = window.bars.len(),
            min_bars,
            "insufficient data — skipping detection"
        );
        return Ok(SymbolOutcome::Skipped);
    }

    // ── 2. Regime context ───────────────────────────────────────────────
    let context = regime::classify(&window.bars, bar_interval, market_offset);

    // ── 3. Detector under the user's threshold overrides ────────────────
    let overrides = services
        .store
        .thresholds_for(&user_id, symbol)
        .context("failed to read threshold overrides")?;

    let anomalies = detect::detect(&window.bars, &detection, &overrides).map_err(|e| {
        error!(symbol, error = %e, "invariant violation in bar window");
        anyhow::anyhow!(e)
    })?;

    if anomalies.is_empty() {
        return Ok(SymbolOutcome::Completed {
            anomalies: 0,
            tracked: 0,
        });
    }

    // ── 4. Decide, persist, and seed follow-ups per anomaly ─────────────
    let mut tracked = 0;
    for anomaly in &anomalies {
        info!(
            anomaly_id = %anomaly.id,
            symbol,
            pattern = %anomaly.pattern_type,
            severity = %anomaly.severity,
            z = format!("{:.2}", anomaly.z_score),
            regime = %context.regime,
            "anomaly emitted"
        );

        let history = services
            .store
            .read_pattern_quality(&user_id, anomaly.pattern_type, symbol)
            .context("failed to read pattern quality")?;

        let causal =
            services
                .learner
                .assess(anomaly.pattern_type, &context, services.clock.now());

        let decision = services.agent.decide(
            &DecisionInputs {
                anomaly,
                context: &context,
                history: history.as_ref(),
                causal: &causal,
                data_points: window.bars.len(),
                conflicting_signals: conflicting_count(&anomalies, anomaly),
            },
            services.clock.now(),
        );

        // Anomaly + decision land atomically before any follow-up exists.
        services
            .store
            .save_anomaly(anomaly, &decision)
            .context("failed to persist anomaly")?;

        if decision.state != DecisionState::Ignore
            && tracker.enqueue(anomaly, &decision, &context)?
        {
            tracked += 1;
        }
    }

    Ok(SymbolOutcome::Completed {
        anomalies: anomalies.len(),
        tracked,
    })
}

/// Count batch-mates pointing the opposite way (a high and a low breakout
/// from one wide bar contradict each other).
fn conflicting_count(batch: &[Anomaly], current: &Anomaly) -> usize {
    let opposite = match current.pattern_type {
        PatternType::BreakoutHigh => PatternType::BreakoutLow,
        PatternType::BreakoutLow => PatternType::BreakoutHigh,
        _ => return 0,
    };
    batch.iter().filter(|a| a.pattern_type == opposite).count()
}

/// Run detection cycles on the configured interval until cancelled.
pub async fn run_detection_loop(engine: Arc<DetectionEngine>, cancel: CancellationToken) {
    let scan_secs = engine.services.config.read().scan_interval_secs.max(1);
    let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(scan_secs));
    info!(scan_secs, "detection loop started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("detection loop stopped");
                return;
            }
            _ = ticker.tick() => {
                engine.run_cycle(&cancel).await;
            }
        }
    }
}
