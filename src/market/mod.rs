// =============================================================================
// Market Data Adapter — vendor fallback chain with retry, cache, and budgets
// =============================================================================
//
// Fetches OHLCV bar windows and spot prices from external providers. Vendors
// sit behind the `MarketDataProvider` trait; the `MarketDataService` walks
// them in priority order, retrying transient failures with exponential
// backoff and skipping providers whose daily call budget is exhausted.
//
// Guarantees to the caller:
//   - Bars are sorted ascending by timestamp with no duplicate timestamps.
//   - Absence of data is signalled in-band (`FetchError::NoData`), never by
//     panics or empty successes.
//   - Cached responses are flagged (`BarsResult::from_cache`) and expire
//     after a short TTL.
// =============================================================================

pub mod twelve_data;
pub mod yahoo;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::Bar;

pub use twelve_data::TwelveDataProvider;
pub use yahoo::YahooChartProvider;

// =============================================================================
// Intervals & periods
// =============================================================================

/// Supported bar intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BarInterval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "1d")]
    D1,
}

impl BarInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::D1 => "1d",
        }
    }

    pub fn seconds(&self) -> u64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::H1 => 3_600,
            Self::D1 => 86_400,
        }
    }
}

impl Default for BarInterval {
    fn default() -> Self {
        Self::M5
    }
}

impl std::fmt::Display for BarInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hard cap on the fetch period so a window always fits in memory.
const MAX_PERIOD_DAYS: u32 = 60;

/// A bounded look-back period expressed in trading days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchPeriod {
    days: u32,
}

impl FetchPeriod {
    /// Build a period, clamping to the in-memory bound.
    pub fn days(days: u32) -> Self {
        Self {
            days: days.clamp(1, MAX_PERIOD_DAYS),
        }
    }

    pub fn as_days(&self) -> u32 {
        self.days
    }
}

// =============================================================================
// Failure taxonomy
// =============================================================================

/// In-band fetch failures. Exceptions never cross the adapter boundary; a
/// provider that cannot serve the request reports one of these and the chain
/// moves on.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network hiccup, HTTP 5xx, timeout — worth retrying.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// The provider told us to slow down (HTTP 429 or equivalent).
    #[error("provider rate limited")]
    RateLimited,

    /// The vendor does not know this symbol.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    /// The request succeeded but no bars (or no price) came back.
    #[error("no data available")]
    NoData,
}

impl FetchError {
    /// Whether retrying the same provider could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited)
    }
}

// =============================================================================
// Provider trait
// =============================================================================

/// A single market-data vendor. Implementations perform their own HTTP I/O
/// and translate vendor-specific failures into the `FetchError` taxonomy.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Short vendor name for logs and budget accounting.
    fn name(&self) -> &'static str;

    /// Daily request budget, if the vendor enforces one.
    fn daily_budget(&self) -> Option<u32> {
        None
    }

    /// Fetch an ordered bar window for `symbol`.
    async fn fetch_bars(
        &self,
        symbol: &str,
        period: FetchPeriod,
        interval: BarInterval,
    ) -> Result<Vec<Bar>, FetchError>;

    /// Current spot price for `symbol` (used by the outcome tracker).
    async fn spot_price(&self, symbol: &str) -> Result<f64, FetchError>;
}

// =============================================================================
// MarketDataService — the fallback chain
// =============================================================================

/// Result of a bar fetch, flagging whether it was served from the TTL cache.
#[derive(Debug, Clone)]
pub struct BarsResult {
    pub bars: Vec<Bar>,
    pub from_cache: bool,
}

#[derive(Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    symbol: String,
    interval: BarInterval,
    period_days: u32,
}

struct CacheEntry {
    bars: Vec<Bar>,
    stored_at: Instant,
}

/// Per-provider daily call counter, reset when the UTC date rolls over.
struct CallBudget {
    calls_today: u32,
    date: NaiveDate,
}

/// Maximum attempts per provider before falling through to the next one.
const MAX_ATTEMPTS_PER_PROVIDER: u32 = 2;
/// Base backoff between retries; doubles per attempt.
const RETRY_BACKOFF_MS: u64 = 500;

/// Walks a priority-ordered list of providers with retry, backoff, budget
/// accounting, and a short-TTL response cache.
pub struct MarketDataService {
    providers: Vec<Arc<dyn MarketDataProvider>>,
    cache: RwLock<HashMap<CacheKey, CacheEntry>>,
    budgets: RwLock<HashMap<&'static str, CallBudget>>,
    cache_ttl: Duration,
    fetch_timeout: Duration,
}

impl MarketDataService {
    pub fn new(
        providers: Vec<Arc<dyn MarketDataProvider>>,
        cache_ttl: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            providers,
            cache: RwLock::new(HashMap::new()),
            budgets: RwLock::new(HashMap::new()),
            cache_ttl,
            fetch_timeout,
        }
    }

    /// Fetch an ordered, deduplicated bar window for `symbol`, trying each
    /// provider in turn. Returns `FetchError::NoData` once every provider is
    /// exhausted.
    pub async fn fetch_bars(
        &self,
        symbol: &str,
        period: FetchPeriod,
        interval: BarInterval,
    ) -> Result<BarsResult, FetchError> {
        let key = CacheKey {
            symbol: symbol.to_string(),
            interval,
            period_days: period.as_days(),
        };

        if let Some(bars) = self.cache_lookup(&key) {
            debug!(symbol, interval = %interval, "bar window served from cache");
            return Ok(BarsResult {
                bars,
                from_cache: true,
            });
        }

        for provider in &self.providers {
            if !self.budget_allows(provider.as_ref()) {
                warn!(
                    provider = provider.name(),
                    symbol, "daily call budget exhausted — skipping provider"
                );
                continue;
            }

            match self
                .fetch_with_retry(provider.as_ref(), symbol, period, interval)
                .await
            {
                Ok(bars) => {
                    let bars = normalize_bars(bars);
                    if bars.is_empty() {
                        debug!(provider = provider.name(), symbol, "provider returned zero bars");
                        continue;
                    }
                    info!(
                        provider = provider.name(),
                        symbol,
                        interval = %interval,
                        count = bars.len(),
                        "bars fetched"
                    );
                    self.cache_store(key, &bars);
                    return Ok(BarsResult {
                        bars,
                        from_cache: false,
                    });
                }
                Err(e) => {
                    warn!(
                        provider = provider.name(),
                        symbol,
                        error = %e,
                        "provider failed — falling through"
                    );
                }
            }
        }

        Err(FetchError::NoData)
    }

    /// Current spot price for `symbol` across the provider chain. Never
    /// cached: the outcome tracker needs a fresh observation.
    pub async fn spot_price(&self, symbol: &str) -> Result<f64, FetchError> {
        for provider in &self.providers {
            if !self.budget_allows(provider.as_ref()) {
                continue;
            }

            let mut attempt = 0;
            loop {
                self.record_call(provider.name());
                let result = tokio::time::timeout(self.fetch_timeout, provider.spot_price(symbol))
                    .await
                    .unwrap_or_else(|_| {
                        Err(FetchError::Transient("spot price fetch timed out".into()))
                    });

                match result {
                    Ok(price) if price.is_finite() && price > 0.0 => return Ok(price),
                    Ok(price) => {
                        warn!(provider = provider.name(), symbol, price, "implausible spot price");
                        break;
                    }
                    Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS_PER_PROVIDER => {
                        attempt += 1;
                        tokio::time::sleep(Duration::from_millis(
                            RETRY_BACKOFF_MS << (attempt - 1),
                        ))
                        .await;
                    }
                    Err(e) => {
                        debug!(provider = provider.name(), symbol, error = %e, "spot price failed");
                        break;
                    }
                }
            }
        }

        Err(FetchError::NoData)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn fetch_with_retry(
        &self,
        provider: &dyn MarketDataProvider,
        symbol: &str,
        period: FetchPeriod,
        interval: BarInterval,
    ) -> Result<Vec<Bar>, FetchError> {
        let mut attempt = 0;
        loop {
            self.record_call(provider.name());

            let result = tokio::time::timeout(
                self.fetch_timeout,
                provider.fetch_bars(symbol, period, interval),
            )
            .await
            .unwrap_or_else(|_| Err(FetchError::Transient("bar fetch timed out".into())));

            match result {
                Ok(bars) => return Ok(bars),
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS_PER_PROVIDER => {
                    attempt += 1;
                    let backoff = Duration::from_millis(RETRY_BACKOFF_MS << (attempt - 1));
                    debug!(
                        provider = provider.name(),
                        symbol,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn cache_lookup(&self, key: &CacheKey) -> Option<Vec<Bar>> {
        let cache = self.cache.read();
        let entry = cache.get(key)?;
        if entry.stored_at.elapsed() <= self.cache_ttl {
            Some(entry.bars.clone())
        } else {
            None
        }
    }

    fn cache_store(&self, key: CacheKey, bars: &[Bar]) {
        let mut cache = self.cache.write();
        cache.insert(
            key,
            CacheEntry {
                bars: bars.to_vec(),
                stored_at: Instant::now(),
            },
        );
        // Opportunistic eviction of anything stale.
        let ttl = self.cache_ttl;
        cache.retain(|_, e| e.stored_at.elapsed() <= ttl);
    }

    fn budget_allows(&self, provider: &dyn MarketDataProvider) -> bool {
        let Some(limit) = provider.daily_budget() else {
            return true;
        };
        let today = Utc::now().date_naive();
        let budgets = self.budgets.read();
        match budgets.get(provider.name()) {
            Some(b) if b.date == today => b.calls_today < limit,
            _ => true,
        }
    }

    fn record_call(&self, name: &'static str) {
        let today = Utc::now().date_naive();
        let mut budgets = self.budgets.write();
        let entry = budgets.entry(name).or_insert(CallBudget {
            calls_today: 0,
            date: today,
        });
        if entry.date != today {
            entry.calls_today = 0;
            entry.date = today;
        }
        entry.calls_today += 1;
    }
}

/// Sort ascending by timestamp and drop duplicate timestamps (last wins).
fn normalize_bars(mut bars: Vec<Bar>) -> Vec<Bar> {
    bars.sort_by_key(|b| b.ts);
    let mut out: Vec<Bar> = Vec::with_capacity(bars.len());
    for bar in bars {
        match out.last() {
            Some(prev) if prev.ts == bar.ts => {
                *out.last_mut().expect("non-empty") = bar;
            }
            _ => out.push(bar),
        }
    }
    out
}
