// =============================================================================
// Yahoo Chart Provider — primary keyless OHLCV vendor
// =============================================================================
//
// Talks to the v8 chart endpoint. Timestamps arrive as one array with the
// quote arrays indexed in parallel; entries may be null for halted periods,
// so every index is parsed defensively and incomplete rows are skipped.
// =============================================================================

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tracing::{debug, instrument, warn};

use crate::market::{BarInterval, FetchError, FetchPeriod, MarketDataProvider};
use crate::types::Bar;

/// Yahoo-style chart API provider. Keyless; used as the primary vendor.
pub struct YahooChartProvider {
    client: reqwest::Client,
    base_url: String,
}

impl YahooChartProvider {
    pub fn new() -> Self {
        Self::with_base_url("https://query1.finance.yahoo.com")
    }

    /// Base URL override, used by tests pointing at a local stub.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .user_agent("finsight-engine/1.0")
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn fetch_chart(
        &self,
        symbol: &str,
        range: &str,
        interval: &str,
    ) -> Result<serde_json::Value, FetchError> {
        let url = format!(
            "{}/v8/finance/chart/{}?range={}&interval={}",
            self.base_url, symbol, range, interval
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("chart request failed: {e}")))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(FetchError::RateLimited);
        }
        if status.as_u16() == 404 {
            return Err(FetchError::UnknownSymbol(symbol.to_string()));
        }
        if status.is_server_error() {
            return Err(FetchError::Transient(format!("chart returned {status}")));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| FetchError::Transient(format!("chart response not JSON: {e}")))?;

        // The chart envelope reports vendor-side errors in-band.
        if let Some(err) = body["chart"]["error"].as_object() {
            let code = err.get("code").and_then(|v| v.as_str()).unwrap_or("");
            return if code.eq_ignore_ascii_case("not found") {
                Err(FetchError::UnknownSymbol(symbol.to_string()))
            } else {
                Err(FetchError::Transient(format!("chart error: {code}")))
            };
        }

        Ok(body)
    }
}

impl Default for YahooChartProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataProvider for YahooChartProvider {
    fn name(&self) -> &'static str {
        "yahoo"
    }

    #[instrument(skip(self), name = "yahoo::fetch_bars")]
    async fn fetch_bars(
        &self,
        symbol: &str,
        period: FetchPeriod,
        interval: BarInterval,
    ) -> Result<Vec<Bar>, FetchError> {
        let range = format!("{}d", period.as_days());
        let body = self.fetch_chart(symbol, &range, interval.as_str()).await?;

        let bars = parse_chart_bars(symbol, &body)?;
        debug!(symbol, count = bars.len(), "chart bars parsed");
        Ok(bars)
    }

    #[instrument(skip(self), name = "yahoo::spot_price")]
    async fn spot_price(&self, symbol: &str) -> Result<f64, FetchError> {
        let body = self.fetch_chart(symbol, "1d", "1m").await?;
        extract_spot_price(&body).ok_or(FetchError::NoData)
    }
}

/// Parse the chart envelope into bars. Rows with null fields are skipped.
fn parse_chart_bars(symbol: &str, body: &serde_json::Value) -> Result<Vec<Bar>, FetchError> {
    let result = body["chart"]["result"]
        .as_array()
        .and_then(|arr| arr.first())
        .ok_or(FetchError::NoData)?;

    let timestamps = result["timestamp"].as_array().ok_or(FetchError::NoData)?;
    let quote = &result["indicators"]["quote"]
        .as_array()
        .and_then(|arr| arr.first())
        .ok_or(FetchError::NoData)?;

    let opens = quote["open"].as_array().ok_or(FetchError::NoData)?;
    let highs = quote["high"].as_array().ok_or(FetchError::NoData)?;
    let lows = quote["low"].as_array().ok_or(FetchError::NoData)?;
    let closes = quote["close"].as_array().ok_or(FetchError::NoData)?;
    let volumes = quote["volume"].as_array().ok_or(FetchError::NoData)?;

    let mut bars = Vec::with_capacity(timestamps.len());

    for (i, ts_val) in timestamps.iter().enumerate() {
        let Some(secs) = ts_val.as_i64() else {
            continue;
        };
        let Some(ts) = Utc.timestamp_opt(secs, 0).single() else {
            warn!(symbol, secs, "timestamp out of range — skipping bar");
            continue;
        };

        let (Some(open), Some(high), Some(low), Some(close)) = (
            opens.get(i).and_then(|v| v.as_f64()),
            highs.get(i).and_then(|v| v.as_f64()),
            lows.get(i).and_then(|v| v.as_f64()),
            closes.get(i).and_then(|v| v.as_f64()),
        ) else {
            // Null row — a halted or missing period. Gaps are allowed.
            continue;
        };

        let Some(volume) = volumes.get(i).and_then(|v| v.as_i64()).filter(|v| *v >= 0) else {
            continue;
        };

        bars.push(Bar {
            symbol: symbol.to_string(),
            ts,
            open,
            high,
            low,
            close,
            volume: volume as u64,
        });
    }

    if bars.is_empty() {
        return Err(FetchError::NoData);
    }
    Ok(bars)
}

/// Extract the live quote from the chart metadata.
fn extract_spot_price(body: &serde_json::Value) -> Option<f64> {
    body["chart"]["result"]
        .as_array()
        .and_then(|arr| arr.first())
        .and_then(|r| r["meta"]["regularMarketPrice"].as_f64())
        .filter(|p| p.is_finite() && *p > 0.0)
}
