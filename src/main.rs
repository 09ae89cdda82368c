// =============================================================================
// FinSight Engine — Main Entry Point
// =============================================================================
//
// Market-anomaly detection and decision service: detects statistical
// anomalies over a watchlist, decides through a context-aware agent with
// real authority, tracks forward outcomes durably, and feeds every outcome
// back into per-pattern quality and causal context statistics.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod agent;
mod config;
mod detect;
mod engine;
mod learning;
mod market;
mod regime;
mod services;
mod store;
mod tracking;
mod types;

use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::agent::DecisionAgent;
use crate::config::EngineConfig;
use crate::engine::DetectionEngine;
use crate::learning::{AdaptiveThresholds, CausalLearner};
use crate::market::{MarketDataProvider, MarketDataService, TwelveDataProvider, YahooChartProvider};
use crate::services::{Clock, Services, SystemClock};
use crate::store::Database;
use crate::tracking::OutcomeTracker;

const CONFIG_PATH: &str = "finsight_config.json";

/// Days of causal history replayed into the learner at boot.
const CAUSAL_WARMUP_DAYS: i64 = 90;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        FinSight Engine — Starting Up                     ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    // Env overrides for containerized deployments.
    if let Ok(symbols) = std::env::var("FINSIGHT_SYMBOLS") {
        config.symbols = symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Ok(user) = std::env::var("FINSIGHT_USER") {
        config.user_id = user;
    }
    if let Ok(db_path) = std::env::var("FINSIGHT_DB") {
        config.db_path = db_path;
    }
    if let Ok(key) = std::env::var("TWELVE_DATA_KEY") {
        if !key.is_empty() {
            config.twelve_data_key = Some(key);
        }
    }

    info!(
        user_id = %config.user_id,
        symbols = ?config.symbols,
        scan_interval_secs = config.scan_interval_secs,
        "watchlist configured"
    );

    // ── 2. Persistence ───────────────────────────────────────────────────
    let store = Arc::new(Database::open(&config.db_path)?);

    // ── 3. Market data providers (priority order, keyed fallback last) ──
    let mut providers: Vec<Arc<dyn MarketDataProvider>> = vec![Arc::new(YahooChartProvider::new())];
    if let Some(key) = &config.twelve_data_key {
        providers.push(Arc::new(TwelveDataProvider::new(key.clone())));
        info!("twelve data fallback provider registered");
    }
    let market = Arc::new(MarketDataService::new(
        providers,
        std::time::Duration::from_secs(config.cache_ttl_secs),
        std::time::Duration::from_secs(config.fetch_timeout_secs),
    ));

    // ── 4. Learner, warmed from persisted observations ───────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let learner = Arc::new(CausalLearner::new(
        config.causal_half_life_days,
        config.causal_min_samples,
    ));
    match store.load_causal_observations(CAUSAL_WARMUP_DAYS, clock.now()) {
        Ok(observations) => {
            let count = observations.len();
            learner.load(&observations);
            info!(count, "causal learner warmed from persisted observations");
        }
        Err(e) => warn!(error = %e, "causal warm-up failed — starting cold"),
    }

    // ── 5. Services bundle ───────────────────────────────────────────────
    let config = Arc::new(RwLock::new(config));
    let services = Arc::new(Services {
        config: config.clone(),
        store: store.clone(),
        market: market.clone(),
        learner: learner.clone(),
        agent: Arc::new(DecisionAgent::new()),
        clock: clock.clone(),
    });

    // ── 6. Outcome tracker + crash recovery ──────────────────────────────
    let tracker = Arc::new(OutcomeTracker::new(
        config.clone(),
        store.clone(),
        market.clone(),
        learner.clone(),
        clock.clone(),
    ));
    match tracker.recover() {
        Ok(0) => {}
        Ok(count) => info!(count, "orphaned follow-ups re-enqueued"),
        Err(e) => warn!(error = %e, "follow-up recovery scan failed"),
    }

    // ── 7. Background loops ──────────────────────────────────────────────
    let cancel = CancellationToken::new();

    let scheduler_handle = tokio::spawn(tracking::run_outcome_scheduler(
        tracker.clone(),
        cancel.clone(),
    ));

    let adaptive = Arc::new(AdaptiveThresholds::new(config.clone(), store.clone()));
    let adaptive_handle = tokio::spawn(learning::run_adaptive_job(
        adaptive,
        clock.clone(),
        cancel.clone(),
    ));

    let detection_engine = Arc::new(DetectionEngine::new(services, tracker));
    let detection_handle = tokio::spawn(engine::run_detection_loop(
        detection_engine,
        cancel.clone(),
    ));

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");
    cancel.cancel();

    for (name, handle) in [
        ("detection", detection_handle),
        ("outcome_scheduler", scheduler_handle),
        ("adaptive", adaptive_handle),
    ] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "background task did not stop cleanly");
        }
    }

    if let Err(e) = config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("FinSight engine shut down complete.");
    Ok(())
}
