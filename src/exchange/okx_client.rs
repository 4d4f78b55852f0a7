// =============================================================================
// OKX REST Client — public market data (tickers, candles)
// =============================================================================
//
// Only unauthenticated endpoints are used; request signing is out of scope.
// Every call carries the client-wide timeout, and a timed-out call surfaces as
// `MirrorError::Timeout` so the reconciler can classify it as transient.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::MarketDataSource;
use crate::error::{MirrorError, MirrorResult};
use crate::market_data::Candle;
use crate::types::TickerSnapshot;

/// OKX error codes that mean "this instrument / bar does not exist".
const INVALID_INSTRUMENT_CODES: &[&str] = &["51000", "51001", "51014"];

/// OKX caps `limit` on the candles endpoint.
const MAX_CANDLES_PER_REQUEST: usize = 300;

#[derive(Clone)]
pub struct OkxClient {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

/// Standard `{ code, msg, data }` envelope of every OKX v5 response.
#[derive(Debug, Deserialize)]
struct OkxResponse<T> {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OkxTicker {
    pub inst_id: String,
    pub last: String,
    #[serde(default)]
    pub ask_px: String,
    #[serde(default)]
    pub ask_sz: String,
    #[serde(default)]
    pub bid_px: String,
    #[serde(default)]
    pub bid_sz: String,
    #[serde(default)]
    pub high24h: String,
    #[serde(default)]
    pub low24h: String,
    #[serde(default)]
    pub vol24h: String,
    pub ts: String,
}

impl OkxTicker {
    pub(crate) fn into_snapshot(self) -> MirrorResult<TickerSnapshot> {
        Ok(TickerSnapshot {
            last: parse_f64(&self.last, "last")?,
            high_24h: parse_f64_or_zero(&self.high24h),
            low_24h: parse_f64_or_zero(&self.low24h),
            volume_24h: parse_f64_or_zero(&self.vol24h),
            bid: parse_f64_or_zero(&self.bid_px),
            bid_size: parse_f64_or_zero(&self.bid_sz),
            ask: parse_f64_or_zero(&self.ask_px),
            ask_size: parse_f64_or_zero(&self.ask_sz),
            timestamp: self
                .ts
                .parse::<i64>()
                .map_err(|e| MirrorError::Decode(format!("ts '{}': {e}", self.ts)))?,
            symbol: self.inst_id,
        })
    }
}

impl OkxClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;

        let base_url = base_url.into();
        debug!(base_url = %base_url, "OkxClient initialised");

        Ok(Self {
            base_url,
            timeout,
            client,
        })
    }

    /// GET a v5 endpoint and unwrap its envelope, mapping exchange error
    /// codes onto the transient/permanent split.
    async fn get_data<T: for<'de> Deserialize<'de>>(&self, path_and_query: &str) -> MirrorResult<Vec<T>> {
        let url = format!("{}{}", self.base_url, path_and_query);

        let resp = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                MirrorError::Timeout(self.timeout.as_millis() as u64)
            } else {
                MirrorError::from(e)
            }
        })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(MirrorError::Transport(format!("GET {path_and_query} returned {status}")));
        }

        let body: OkxResponse<T> = resp.json().await?;
        if body.code != "0" {
            return Err(classify_code(&body.code, &body.msg));
        }
        Ok(body.data)
    }
}

#[async_trait]
impl MarketDataSource for OkxClient {
    /// GET /api/v5/market/ticker
    #[instrument(skip(self), name = "okx::fetch_ticker")]
    async fn fetch_ticker(&self, symbol: &str) -> MirrorResult<TickerSnapshot> {
        let data: Vec<OkxTicker> = self
            .get_data(&format!("/api/v5/market/ticker?instId={symbol}"))
            .await?;

        let ticker = data
            .into_iter()
            .next()
            .ok_or_else(|| MirrorError::InvalidSymbol(symbol.to_string()))?;

        let snapshot = ticker.into_snapshot()?;
        debug!(symbol, last = snapshot.last, "ticker fetched");
        Ok(snapshot)
    }

    /// GET /api/v5/market/candles
    ///
    /// Rows are `[ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm]`,
    /// newest first; the result is reversed to ascending order.
    #[instrument(skip(self), name = "okx::fetch_candles")]
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> MirrorResult<Vec<Candle>> {
        let limit = limit.clamp(1, MAX_CANDLES_PER_REQUEST);
        let rows: Vec<Vec<String>> = self
            .get_data(&format!(
                "/api/v5/market/candles?instId={symbol}&bar={interval}&limit={limit}"
            ))
            .await?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in &rows {
            match parse_candle_row(symbol, interval, row) {
                Ok(c) => candles.push(c),
                Err(e) => warn!(symbol, interval, error = %e, "skipping malformed candle row"),
            }
        }
        candles.sort_by_key(|c| c.open_time);

        debug!(symbol, interval, count = candles.len(), "candles fetched");
        Ok(candles)
    }
}

impl std::fmt::Debug for OkxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxClient")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Parsing helpers (shared with the stream codec)
// -----------------------------------------------------------------------------

pub(crate) fn classify_code(code: &str, msg: &str) -> MirrorError {
    if INVALID_INSTRUMENT_CODES.contains(&code) {
        MirrorError::InvalidSymbol(msg.to_string())
    } else if code == "50011" {
        // Too many requests.
        MirrorError::Transport(format!("rate limited: {msg}"))
    } else {
        MirrorError::Rejected {
            code: code.to_string(),
            message: msg.to_string(),
        }
    }
}

pub(crate) fn parse_f64(raw: &str, name: &str) -> MirrorResult<f64> {
    raw.parse::<f64>()
        .map_err(|e| MirrorError::Decode(format!("{name} '{raw}': {e}")))
}

fn parse_f64_or_zero(raw: &str) -> f64 {
    raw.parse::<f64>().unwrap_or(0.0)
}

/// Milliseconds spanned by an OKX bar token ("1m", "4H", "1D", "1W"), used to
/// derive the close time the exchange does not send.
pub(crate) fn interval_millis(interval: &str) -> Option<i64> {
    let token = interval.trim_end_matches("utc");
    let split = token.find(|c: char| !c.is_ascii_digit())?;
    let (count, unit) = token.split_at(split);
    let count: i64 = count.parse().ok()?;
    let unit_ms = match unit {
        "s" => 1_000,
        "m" => 60_000,
        "H" => 3_600_000,
        "D" => 86_400_000,
        "W" => 7 * 86_400_000,
        "M" => 30 * 86_400_000,
        _ => return None,
    };
    Some(count * unit_ms)
}

pub(crate) fn parse_candle_row(symbol: &str, interval: &str, row: &[String]) -> MirrorResult<Candle> {
    if row.len() < 6 {
        return Err(MirrorError::Decode(format!(
            "candle row has {} fields",
            row.len()
        )));
    }
    let open_time = row[0]
        .parse::<i64>()
        .map_err(|e| MirrorError::Decode(format!("ts '{}': {e}", row[0])))?;
    let span = interval_millis(interval).unwrap_or(0);

    Ok(Candle {
        symbol: symbol.to_string(),
        interval: interval.to_string(),
        open_time,
        close_time: open_time + span.saturating_sub(1),
        open: parse_f64(&row[1], "o")?,
        high: parse_f64(&row[2], "h")?,
        low: parse_f64(&row[3], "l")?,
        close: parse_f64(&row[4], "c")?,
        volume: parse_f64(&row[5], "vol")?,
        quote_volume: row.get(7).map(|s| parse_f64_or_zero(s)).unwrap_or(0.0),
        // OKX candles carry no trade count.
        trade_count: 0,
        confirmed: row.get(8).is_some_and(|s| s == "1"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ticker_envelope() {
        let json = r#"{"code":"0","msg":"","data":[{"instType":"SPOT","instId":"BTC-USDT","last":"29123.5","lastSz":"0.001","askPx":"29124","askSz":"0.5","bidPx":"29123","bidSz":"0.7","open24h":"30000","high24h":"31000","low24h":"28000","volCcy24h":"123","vol24h":"456","ts":"1700000000000"}]}"#;
        let resp: OkxResponse<OkxTicker> = serde_json::from_str(json).unwrap();
        assert_eq!(resp.code, "0");
        let snap = resp.data.into_iter().next().unwrap().into_snapshot().unwrap();
        assert_eq!(snap.symbol, "BTC-USDT");
        assert_eq!(snap.timestamp, 1_700_000_000_000);
        assert!((snap.bid_size - 0.7).abs() < f64::EPSILON);
        assert!((snap.high_24h - 31000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn error_codes_are_classified() {
        assert!(matches!(classify_code("51001", "Instrument ID does not exist"), MirrorError::InvalidSymbol(_)));
        assert!(classify_code("50011", "Too Many Requests").is_transient());
        assert!(!classify_code("50000", "Body can not be empty").is_transient());
    }

    #[test]
    fn interval_spans() {
        assert_eq!(interval_millis("1m"), Some(60_000));
        assert_eq!(interval_millis("1H"), Some(3_600_000));
        assert_eq!(interval_millis("1Dutc"), Some(86_400_000));
        assert_eq!(interval_millis("bogus"), None);
    }

    #[test]
    fn parses_candle_row() {
        let row: Vec<String> = ["1597026383085", "8533.02", "8553.74", "8527.17", "8548.26", "45247", "529.5858061", "5.29", "1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let c = parse_candle_row("BTC-USDT", "1m", &row).unwrap();
        assert_eq!(c.open_time, 1_597_026_383_085);
        assert_eq!(c.close_time, 1_597_026_383_085 + 59_999);
        assert!((c.close - 8548.26).abs() < f64::EPSILON);
        assert!((c.quote_volume - 5.29).abs() < f64::EPSILON);
        assert!(c.confirmed);
    }

    #[test]
    fn short_candle_row_is_rejected() {
        let row = vec!["1".to_string(), "2".to_string()];
        assert!(parse_candle_row("BTC-USDT", "1m", &row).is_err());
    }
}
