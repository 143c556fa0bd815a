// =============================================================================
// Backend REST Client — market data, portfolio, decisions and events
// =============================================================================
//
// Every trader loop owns one client instance. All calls use a 30-second
// timeout (60 seconds for multi-year chart fetches); timeouts surface as
// errors the caller treats as data-unavailable, never as loop-fatal.
// =============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::types::{Bar, PortfolioState};

/// Default request timeout.
const TIMEOUT_SECS: u64 = 30;
/// Timeout for multi-year chart fetches.
const LONG_TIMEOUT_SECS: u64 = 60;

/// OHLCV series plus the convenience fields the engine consumes.
#[derive(Debug, Clone)]
pub struct MarketData {
    pub symbol: String,
    pub bars: Vec<Bar>,
    pub current_price: f64,
    pub volume: f64,
}

/// Sentiment verdict from the backend's combined news endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct SentimentResponse {
    #[serde(default)]
    pub sentiment: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub news_count: u32,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Price forecast from the ML service.
#[derive(Debug, Clone, Deserialize)]
pub struct MlPrediction {
    #[serde(default)]
    pub prediction: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub model: Option<String>,
}

/// Trade execution request posted to the backend.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteRequest {
    pub symbol: String,
    pub action: String,
    pub quantity: f64,
    pub price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub reasoning: String,
}

/// REST client for the main backend and the ML forecast service.
#[derive(Clone)]
pub struct BackendClient {
    base_url: String,
    ml_service_url: String,
    client: reqwest::Client,
    long_client: reqwest::Client,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, ml_service_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");
        let long_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(LONG_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");
        Self {
            base_url: base_url.into(),
            ml_service_url: ml_service_url.into(),
            client,
            long_client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// GET /api/yahoo/chart/{symbol}?period=..&interval=1d, parsing the
    /// conventional nested `chart.result[0]` shape. Rows with null opens or
    /// closes are skipped.
    #[instrument(skip(self), name = "backend::fetch_chart")]
    pub async fn fetch_chart(&self, symbol: &str, period: &str) -> Result<Vec<Bar>> {
        let encoded = urlencode(symbol);
        let url = format!(
            "{}/api/yahoo/chart/{}?period={}&interval=1d",
            self.base_url, encoded, period
        );
        // Multi-year fetches are slow on the backend side.
        let client = if period == "5y" || period == "2y" {
            &self.long_client
        } else {
            &self.client
        };

        let resp = client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET chart for {symbol} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("chart endpoint returned {status} for {symbol}");
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse chart response")?;

        Ok(parse_chart_bars(&body))
    }

    /// Fetch one year of daily bars plus the latest close, as the trading
    /// loop consumes it. Returns `None` when no usable rows came back.
    #[instrument(skip(self), name = "backend::fetch_market_data")]
    pub async fn fetch_market_data(&self, symbol: &str) -> Result<Option<MarketData>> {
        let bars = self.fetch_chart(symbol, "1y").await?;
        let last = match bars.last() {
            Some(last) => *last,
            None => return Ok(None),
        };
        Ok(Some(MarketData {
            symbol: symbol.to_string(),
            current_price: last.close,
            volume: last.volume,
            bars,
        }))
    }

    /// Current VIX level via the chart endpoint (the quote endpoint does not
    /// resolve index symbols).
    #[instrument(skip(self), name = "backend::fetch_vix")]
    pub async fn fetch_vix(&self) -> Result<f64> {
        let url = format!(
            "{}/api/yahoo/chart/{}?period=1d&interval=1d",
            self.base_url,
            urlencode("^VIX")
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET VIX chart failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("VIX endpoint returned {}", resp.status());
        }
        let body: serde_json::Value = resp.json().await.context("failed to parse VIX response")?;
        body.pointer("/chart/result/0/meta/regularMarketPrice")
            .and_then(|v| v.as_f64())
            .context("VIX response missing regularMarketPrice")
    }

    // -------------------------------------------------------------------------
    // Trader state
    // -------------------------------------------------------------------------

    /// GET /api/ai-traders — the full trader list (used for resume-on-boot).
    #[instrument(skip(self), name = "backend::fetch_traders")]
    pub async fn fetch_traders(&self) -> Result<Vec<serde_json::Value>> {
        let url = format!("{}/api/ai-traders", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET ai-traders failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("ai-traders endpoint returned {}", resp.status());
        }
        resp.json().await.context("failed to parse traders list")
    }

    /// GET /api/ai-traders/{id}/portfolio.
    #[instrument(skip(self), name = "backend::fetch_portfolio")]
    pub async fn fetch_portfolio(&self, trader_id: i64) -> Result<PortfolioState> {
        let url = format!("{}/api/ai-traders/{}/portfolio", self.base_url, trader_id);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET portfolio for trader {trader_id} failed"))?;
        if !resp.status().is_success() {
            anyhow::bail!("portfolio endpoint returned {}", resp.status());
        }
        resp.json().await.context("failed to parse portfolio")
    }

    /// GET /api/ml/sentiment/{symbol} on the backend's combined endpoint.
    #[instrument(skip(self), name = "backend::fetch_sentiment")]
    pub async fn fetch_sentiment(&self, symbol: &str) -> Result<SentimentResponse> {
        let url = format!("{}/api/ml/sentiment/{}", self.base_url, urlencode(symbol));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET sentiment for {symbol} failed"))?;
        if !resp.status().is_success() {
            anyhow::bail!("sentiment endpoint returned {}", resp.status());
        }
        resp.json().await.context("failed to parse sentiment")
    }

    // -------------------------------------------------------------------------
    // Decisions & execution
    // -------------------------------------------------------------------------

    /// POST /api/ai-traders/{id}/decisions — log the full reasoning tree.
    #[instrument(skip(self, payload), name = "backend::post_decision")]
    pub async fn post_decision(&self, trader_id: i64, payload: &serde_json::Value) -> Result<()> {
        let url = format!("{}/api/ai-traders/{}/decisions", self.base_url, trader_id);
        let resp = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .context("POST decision failed")?;
        if !resp.status().is_success() {
            warn!(trader_id, status = %resp.status(), "failed to log decision");
        }
        Ok(())
    }

    /// PATCH /api/ai-traders/{id}/decisions/mark-executed.
    #[instrument(skip(self), name = "backend::mark_executed")]
    pub async fn mark_decision_executed(
        &self,
        trader_id: i64,
        symbol: &str,
        decision_type: &str,
        timestamp: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/api/ai-traders/{}/decisions/mark-executed",
            self.base_url, trader_id
        );
        let resp = self
            .client
            .patch(&url)
            .json(&serde_json::json!({
                "symbol": symbol,
                "decision_type": decision_type,
                "timestamp": timestamp,
            }))
            .send()
            .await
            .context("PATCH mark-executed failed")?;
        if !resp.status().is_success() {
            warn!(trader_id, status = %resp.status(), "failed to mark decision executed");
        }
        Ok(())
    }

    /// POST /api/ai-traders/{id}/execute. Returns whether the backend
    /// accepted the order.
    #[instrument(skip(self, request), name = "backend::execute")]
    pub async fn execute_trade(&self, trader_id: i64, request: &ExecuteRequest) -> Result<bool> {
        let url = format!("{}/api/ai-traders/{}/execute", self.base_url, trader_id);
        let resp = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .context("POST execute failed")?;
        let ok = resp.status().is_success();
        if ok {
            debug!(
                trader_id,
                symbol = %request.symbol,
                action = %request.action,
                quantity = request.quantity,
                "trade executed"
            );
        } else {
            warn!(trader_id, status = %resp.status(), "trade execution rejected");
        }
        Ok(ok)
    }

    /// POST /api/ai-traders/{id}/events — best-effort notification.
    #[instrument(skip(self, data), name = "backend::post_event")]
    pub async fn post_event(
        &self,
        trader_id: i64,
        event_type: &str,
        message: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        let url = format!("{}/api/ai-traders/{}/events", self.base_url, trader_id);
        self.client
            .post(&url)
            .json(&serde_json::json!({
                "event_type": event_type,
                "message": message,
                "data": data,
            }))
            .send()
            .await
            .context("POST event failed")?;
        Ok(())
    }

    /// POST /api/ai-traders/{id}/training-history.
    #[instrument(skip(self, record), name = "backend::post_training_history")]
    pub async fn post_training_history(
        &self,
        trader_id: i64,
        record: &serde_json::Value,
    ) -> Result<()> {
        let url = format!(
            "{}/api/ai-traders/{}/training-history",
            self.base_url, trader_id
        );
        let resp = self
            .client
            .post(&url)
            .json(record)
            .send()
            .await
            .context("POST training-history failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("training-history endpoint returned {}", resp.status());
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // ML forecast service
    // -------------------------------------------------------------------------

    /// POST {ml_service}/api/ml/predict with the last 100 bars.
    #[instrument(skip(self, bars), name = "backend::ml_predict")]
    pub async fn ml_predict(&self, symbol: &str, bars: &[Bar]) -> Result<MlPrediction> {
        let tail = if bars.len() > 100 {
            &bars[bars.len() - 100..]
        } else {
            bars
        };
        let url = format!("{}/api/ml/predict", self.ml_service_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "symbol": symbol,
                "prices": tail,
            }))
            .send()
            .await
            .with_context(|| format!("POST ml predict for {symbol} failed"))?;
        if !resp.status().is_success() {
            anyhow::bail!("ml predict returned {}", resp.status());
        }
        resp.json().await.context("failed to parse ml prediction")
    }
}

/// Parse bars out of the nested `chart.result[0]` payload.
pub fn parse_chart_bars(body: &serde_json::Value) -> Vec<Bar> {
    let result = match body.pointer("/chart/result/0") {
        Some(r) => r,
        None => return Vec::new(),
    };
    let timestamps: Vec<i64> = result
        .get("timestamp")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|t| t.as_i64()).collect())
        .unwrap_or_default();
    let quote = match result.pointer("/indicators/quote/0") {
        Some(q) => q,
        None => return Vec::new(),
    };

    let series = |key: &str| -> Vec<Option<f64>> {
        quote
            .get(key)
            .and_then(|v| v.as_array())
            .map(|a| a.iter().map(|x| x.as_f64()).collect())
            .unwrap_or_default()
    };
    let opens = series("open");
    let highs = series("high");
    let lows = series("low");
    let closes = series("close");
    let volumes = series("volume");

    let mut bars = Vec::with_capacity(timestamps.len());
    for (i, &ts) in timestamps.iter().enumerate() {
        let open = opens.get(i).copied().flatten();
        let close = closes.get(i).copied().flatten();
        // Null rows (market holidays, partial data) are skipped.
        let (open, close) = match (open, close) {
            (Some(o), Some(c)) => (o, c),
            _ => continue,
        };
        bars.push(Bar {
            timestamp: ts * 1000,
            open,
            high: highs.get(i).copied().flatten().unwrap_or(close),
            low: lows.get(i).copied().flatten().unwrap_or(close),
            close,
            volume: volumes.get(i).copied().flatten().unwrap_or(0.0),
        });
    }
    bars
}

/// Percent-encode a path segment (enough for ticker symbols like `^VIX`).
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_escapes_vix_symbol() {
        assert_eq!(urlencode("^VIX"), "%5EVIX");
        assert_eq!(urlencode("AAPL"), "AAPL");
        assert_eq!(urlencode("BRK.B"), "BRK.B");
    }

    #[test]
    fn parse_chart_bars_happy_path() {
        let body = serde_json::json!({
            "chart": { "result": [{
                "timestamp": [1000, 2000, 3000],
                "indicators": { "quote": [{
                    "open":   [10.0, 11.0, 12.0],
                    "high":   [10.5, 11.5, 12.5],
                    "low":    [9.5, 10.5, 11.5],
                    "close":  [10.2, 11.2, 12.2],
                    "volume": [100.0, 200.0, 300.0]
                }]}
            }]}
        });
        let bars = parse_chart_bars(&body);
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].timestamp, 1_000_000);
        assert!((bars[2].close - 12.2).abs() < 1e-12);
    }

    #[test]
    fn parse_chart_bars_skips_null_rows() {
        let body = serde_json::json!({
            "chart": { "result": [{
                "timestamp": [1000, 2000, 3000],
                "indicators": { "quote": [{
                    "open":   [10.0, null, 12.0],
                    "high":   [10.5, null, 12.5],
                    "low":    [9.5, null, 11.5],
                    "close":  [10.2, null, 12.2],
                    "volume": [100.0, null, 300.0]
                }]}
            }]}
        });
        let bars = parse_chart_bars(&body);
        assert_eq!(bars.len(), 2);
    }

    #[test]
    fn parse_chart_bars_handles_missing_shape() {
        assert!(parse_chart_bars(&serde_json::json!({})).is_empty());
        assert!(parse_chart_bars(&serde_json::json!({"chart": {"result": []}})).is_empty());
    }

    #[test]
    fn parse_chart_bars_fills_missing_volume_with_zero() {
        let body = serde_json::json!({
            "chart": { "result": [{
                "timestamp": [1000],
                "indicators": { "quote": [{
                    "open":   [10.0],
                    "high":   [10.5],
                    "low":    [9.5],
                    "close":  [10.2],
                    "volume": [null]
                }]}
            }]}
        });
        let bars = parse_chart_bars(&body);
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].volume, 0.0);
    }
}
