// =============================================================================
// Twelve Data Provider — keyed fallback vendor with a daily call budget
// =============================================================================

use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeZone, Utc};
use tracing::{debug, instrument};

use crate::market::{BarInterval, FetchError, FetchPeriod, MarketDataProvider};
use crate::types::Bar;

/// Free-tier daily request allowance.
const DAILY_BUDGET: u32 = 800;

/// Twelve Data time-series provider. Used only when a key is configured.
pub struct TwelveDataProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl TwelveDataProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, "https://api.twelvedata.com")
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn interval_param(interval: BarInterval) -> &'static str {
        match interval {
            BarInterval::M1 => "1min",
            BarInterval::M5 => "5min",
            BarInterval::M15 => "15min",
            BarInterval::H1 => "1h",
            BarInterval::D1 => "1day",
        }
    }

    async fn get_json(&self, url: &str, symbol: &str) -> Result<serde_json::Value, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("request failed: {e}")))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(FetchError::RateLimited);
        }
        if status.is_server_error() {
            return Err(FetchError::Transient(format!("returned {status}")));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| FetchError::Transient(format!("response not JSON: {e}")))?;

        // Twelve Data reports failures inside a 200 body.
        if body["status"].as_str() == Some("error") {
            let code = body["code"].as_i64().unwrap_or(0);
            let message = body["message"].as_str().unwrap_or("");
            return match code {
                429 => Err(FetchError::RateLimited),
                400 | 404 => Err(FetchError::UnknownSymbol(symbol.to_string())),
                _ => Err(FetchError::Transient(format!("api error {code}: {message}"))),
            };
        }

        Ok(body)
    }
}

#[async_trait]
impl MarketDataProvider for TwelveDataProvider {
    fn name(&self) -> &'static str {
        "twelve_data"
    }

    fn daily_budget(&self) -> Option<u32> {
        Some(DAILY_BUDGET)
    }

    #[instrument(skip(self), name = "twelve_data::fetch_bars")]
    async fn fetch_bars(
        &self,
        symbol: &str,
        period: FetchPeriod,
        interval: BarInterval,
    ) -> Result<Vec<Bar>, FetchError> {
        // Rough bar count for the requested window; the service trims by age.
        let bars_per_day = (86_400 / interval.seconds()).min(500);
        let outputsize = (period.as_days() as u64 * bars_per_day).clamp(30, 5_000);

        let url = format!(
            "{}/time_series?symbol={}&interval={}&outputsize={}&apikey={}",
            self.base_url,
            symbol,
            Self::interval_param(interval),
            outputsize,
            self.api_key
        );

        let body = self.get_json(&url, symbol).await?;
        let bars = parse_time_series(symbol, &body)?;
        debug!(symbol, count = bars.len(), "time series parsed");
        Ok(bars)
    }

    #[instrument(skip(self), name = "twelve_data::spot_price")]
    async fn spot_price(&self, symbol: &str) -> Result<f64, FetchError> {
        let url = format!(
            "{}/price?symbol={}&apikey={}",
            self.base_url, symbol, self.api_key
        );
        let body = self.get_json(&url, symbol).await?;

        body["price"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .or_else(|| body["price"].as_f64())
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or(FetchError::NoData)
    }
}

/// Parse the `values` array. Numeric fields arrive as strings.
fn parse_time_series(symbol: &str, body: &serde_json::Value) -> Result<Vec<Bar>, FetchError> {
    let values = body["values"].as_array().ok_or(FetchError::NoData)?;

    let mut bars = Vec::with_capacity(values.len());
    for row in values {
        let Some(dt) = row["datetime"].as_str() else {
            continue;
        };
        // Intraday rows carry "YYYY-MM-DD HH:MM:SS"; daily rows just the date.
        let naive = NaiveDateTime::parse_from_str(dt, "%Y-%m-%d %H:%M:%S")
            .or_else(|_| {
                chrono::NaiveDate::parse_from_str(dt, "%Y-%m-%d")
                    .map(|d| d.and_hms_opt(0, 0, 0).expect("midnight is valid"))
            })
            .ok();
        let Some(naive) = naive else {
            continue;
        };
        let ts = Utc.from_utc_datetime(&naive);

        let (Some(open), Some(high), Some(low), Some(close)) = (
            parse_field(&row["open"]),
            parse_field(&row["high"]),
            parse_field(&row["low"]),
            parse_field(&row["close"]),
        ) else {
            continue;
        };

        let volume = parse_field(&row["volume"])
            .filter(|v| *v >= 0.0)
            .map(|v| v as u64)
            .unwrap_or(0);

        bars.push(Bar {
            symbol: symbol.to_string(),
            ts,
            open,
            high,
            low,
            close,
            volume,
        });
    }

    if bars.is_empty() {
        return Err(FetchError::NoData);
    }
    Ok(bars)
}

/// Numeric field that may be a JSON string or number.
fn parse_field(val: &serde_json::Value) -> Option<f64> {
    match val {
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}
