// =============================================================================
// Engine Configuration — Hot-reloadable settings with atomic save
// =============================================================================
//
// Central configuration hub for the FinSight engine. Every tunable parameter
// lives here so a deployment can be re-tuned without a rebuild.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::market::BarInterval;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_user_id() -> String {
    "default".to_string()
}

fn default_symbols() -> Vec<String> {
    vec![
        "AAPL".to_string(),
        "MSFT".to_string(),
        "GOOGL".to_string(),
        "AMZN".to_string(),
        "NVDA".to_string(),
    ]
}

fn default_scan_interval_secs() -> u64 {
    300
}

fn default_max_parallel_symbols() -> usize {
    8
}

fn default_lookback_days() -> u32 {
    5
}

fn default_min_bars() -> usize {
    20
}

fn default_market_utc_offset_minutes() -> i32 {
    -300
}

fn default_z_threshold() -> f64 {
    2.5
}

fn default_min_volume() -> u64 {
    100_000
}

fn default_min_change() -> f64 {
    0.005
}

fn default_min_data_points() -> usize {
    20
}

fn default_breakout_volume_z() -> f64 {
    1.5
}

fn default_outcome_intervals() -> Vec<OutcomeInterval> {
    vec![
        OutcomeInterval::new("15m", 900),
        OutcomeInterval::new("1h", 3_600),
        OutcomeInterval::new("4h", 14_400),
        OutcomeInterval::new("1d", 86_400),
    ]
}

fn default_profit_threshold() -> f64 {
    0.005
}

fn default_action_timeout_secs() -> u64 {
    3_600
}

fn default_causal_half_life_days() -> f64 {
    30.0
}

fn default_causal_min_samples() -> usize {
    3
}

fn default_outcome_poll_secs() -> u64 {
    5
}

fn default_outcome_stale_after_secs() -> u64 {
    300
}

fn default_adaptive_interval_secs() -> u64 {
    3_600
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_db_path() -> String {
    "finsight.db".to_string()
}

// =============================================================================
// Per-pattern detection thresholds
// =============================================================================

/// Volume-spike detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeThresholds {
    /// Z-score at or above which a spike is emitted.
    #[serde(default = "default_z_threshold")]
    pub z_score: f64,

    /// Minimum absolute volume before the test is considered at all.
    #[serde(default = "default_min_volume")]
    pub min_volume: u64,

    /// Minimum bars in the window for the test to run.
    #[serde(default = "default_min_data_points")]
    pub min_data_points: usize,
}

impl Default for VolumeThresholds {
    fn default() -> Self {
        Self {
            z_score: default_z_threshold(),
            min_volume: default_min_volume(),
            min_data_points: default_min_data_points(),
        }
    }
}

/// Price-momentum detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentumThresholds {
    #[serde(default = "default_z_threshold")]
    pub z_score: f64,

    /// Minimum absolute simple return before the test fires.
    #[serde(default = "default_min_change")]
    pub min_change: f64,

    #[serde(default = "default_min_data_points")]
    pub min_data_points: usize,
}

impl Default for MomentumThresholds {
    fn default() -> Self {
        Self {
            z_score: default_z_threshold(),
            min_change: default_min_change(),
            min_data_points: default_min_data_points(),
        }
    }
}

/// Volatility-surge (intraday range) detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeThresholds {
    #[serde(default = "default_z_threshold")]
    pub z_score: f64,

    #[serde(default = "default_min_data_points")]
    pub min_data_points: usize,
}

impl Default for RangeThresholds {
    fn default() -> Self {
        Self {
            z_score: default_z_threshold(),
            min_data_points: default_min_data_points(),
        }
    }
}

/// Full detector configuration. Thresholds are read per evaluation; the
/// per-(user, pattern, symbol) override table supersedes these defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(default)]
    pub volume_spike: VolumeThresholds,

    #[serde(default)]
    pub price_momentum: MomentumThresholds,

    #[serde(default)]
    pub volatility_surge: RangeThresholds,

    /// Volume z confirmation required for breakout patterns.
    #[serde(default = "default_breakout_volume_z")]
    pub breakout_volume_z: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            volume_spike: VolumeThresholds::default(),
            price_momentum: MomentumThresholds::default(),
            volatility_surge: RangeThresholds::default(),
            breakout_volume_z: default_breakout_volume_z(),
        }
    }
}

// =============================================================================
// Outcome intervals
// =============================================================================

/// One forward-return sampling offset for the outcome tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeInterval {
    pub label: String,
    pub seconds: u64,
}

impl OutcomeInterval {
    pub fn new(label: impl Into<String>, seconds: u64) -> Self {
        Self {
            label: label.into(),
            seconds,
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level runtime configuration for the FinSight engine.
///
/// Every field has a serde default so older JSON files missing new fields
/// still deserialize correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Identity & watchlist -----------------------------------------------
    /// User the detection cycle runs on behalf of. Watchlists and quality
    /// history are scoped to this id.
    #[serde(default = "default_user_id")]
    pub user_id: String,

    /// Symbols scanned each cycle.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    // --- Cycle scheduling ---------------------------------------------------
    /// Seconds between detection cycles.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// Maximum symbols analyzed concurrently within one cycle.
    #[serde(default = "default_max_parallel_symbols")]
    pub max_parallel_symbols: usize,

    // --- Bar window ---------------------------------------------------------
    /// Look-back period fetched per symbol, in trading days.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,

    /// Bar interval fetched per symbol.
    #[serde(default)]
    pub bar_interval: BarInterval,

    /// Fewer bars than this and the symbol is skipped as insufficient data.
    #[serde(default = "default_min_bars")]
    pub min_bars: usize,

    /// Minutes east of UTC for the market's local session clock. Session
    /// phases (open/mid/close/after-hours) are bucketed on this clock, not
    /// UTC. -300 = US Eastern standard; 330 = India.
    #[serde(default = "default_market_utc_offset_minutes")]
    pub market_utc_offset_minutes: i32,

    // --- Detection ----------------------------------------------------------
    #[serde(default)]
    pub detection: DetectionConfig,

    // --- Outcome tracking ---------------------------------------------------
    /// Ordered forward-return sampling offsets.
    #[serde(default = "default_outcome_intervals")]
    pub outcome_intervals: Vec<OutcomeInterval>,

    /// Best forward return at or above this fraction counts as profitable.
    #[serde(default = "default_profit_threshold")]
    pub profit_threshold: f64,

    /// Seconds after which a missing user action is recorded as "ignored".
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,

    /// Seconds between pending-outcome scheduler polls.
    #[serde(default = "default_outcome_poll_secs")]
    pub outcome_poll_secs: u64,

    /// A due interval older than this records null instead of sampling a
    /// price from the wrong time (restart recovery).
    #[serde(default = "default_outcome_stale_after_secs")]
    pub outcome_stale_after_secs: u64,

    // --- Causal learning ----------------------------------------------------
    /// Half-life of the temporal decay applied to causal observations.
    #[serde(default = "default_causal_half_life_days")]
    pub causal_half_life_days: f64,

    /// Minimum observations per causal key before it contributes.
    #[serde(default = "default_causal_min_samples")]
    pub causal_min_samples: usize,

    /// Seconds between adaptive threshold scans.
    #[serde(default = "default_adaptive_interval_secs")]
    pub adaptive_interval_secs: u64,

    // --- Market data --------------------------------------------------------
    /// Hard upper bound on any single provider fetch.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// TTL of the bar-window response cache.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Twelve Data API key; the fallback provider is only registered when set.
    #[serde(default)]
    pub twelve_data_key: Option<String>,

    // --- Persistence --------------------------------------------------------
    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
            symbols: default_symbols(),
            scan_interval_secs: default_scan_interval_secs(),
            max_parallel_symbols: default_max_parallel_symbols(),
            lookback_days: default_lookback_days(),
            bar_interval: BarInterval::default(),
            min_bars: default_min_bars(),
            market_utc_offset_minutes: default_market_utc_offset_minutes(),
            detection: DetectionConfig::default(),
            outcome_intervals: default_outcome_intervals(),
            profit_threshold: default_profit_threshold(),
            action_timeout_secs: default_action_timeout_secs(),
            outcome_poll_secs: default_outcome_poll_secs(),
            outcome_stale_after_secs: default_outcome_stale_after_secs(),
            causal_half_life_days: default_causal_half_life_days(),
            causal_min_samples: default_causal_min_samples(),
            adaptive_interval_secs: default_adaptive_interval_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            twelve_data_key: None,
            db_path: default_db_path(),
        }
    }
}

impl EngineConfig {
    /// The market's local session clock as a fixed offset. Falls back to
    /// UTC if the configured minutes are out of range.
    pub fn market_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.market_utc_offset_minutes * 60)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"))
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            user_id = %config.user_id,
            symbols = ?config.symbols,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialize engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}
