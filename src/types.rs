// =============================================================================
// Shared types used across the market mirror
// =============================================================================

use serde::{Deserialize, Serialize};

/// Exchange instrument identifier, e.g. "BTC-USDT".
pub type Symbol = String;

/// Candle granularity token, e.g. "1m", "1H", "1D". Compared by exact match.
pub type Interval = String;

/// One desired stream: a ticker (no interval) or a candle series (interval).
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subscription {
    pub symbol: Symbol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<Interval>,
}

impl Subscription {
    pub fn ticker(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: None,
        }
    }

    pub fn candle(symbol: impl Into<Symbol>, interval: impl Into<Interval>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: Some(interval.into()),
        }
    }

    pub fn is_ticker(&self) -> bool {
        self.interval.is_none()
    }
}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.interval {
            Some(iv) => write!(f, "{}@candle{}", self.symbol, iv),
            None => write!(f, "{}@ticker", self.symbol),
        }
    }
}

/// Streaming session category.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelClass {
    Public,
    Private,
}

impl std::fmt::Display for ChannelClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Public => write!(f, "PUBLIC"),
            Self::Private => write!(f, "PRIVATE"),
        }
    }
}

/// Lifecycle of one streaming session. Owned by the stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
        }
    }
}

/// Latest best-bid/ask/last-trade snapshot for a symbol.
///
/// `timestamp` is the exchange timestamp in milliseconds; the cache never lets
/// it go backwards for a given symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub symbol: Symbol,
    pub last: f64,
    #[serde(default)]
    pub high_24h: f64,
    #[serde(default)]
    pub low_24h: f64,
    #[serde(default)]
    pub volume_24h: f64,
    #[serde(default)]
    pub bid: f64,
    #[serde(default)]
    pub bid_size: f64,
    #[serde(default)]
    pub ask: f64,
    #[serde(default)]
    pub ask_size: f64,
    pub timestamp: i64,
}

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_display() {
        assert_eq!(Subscription::ticker("BTC-USDT").to_string(), "BTC-USDT@ticker");
        assert_eq!(
            Subscription::candle("ETH-USDT", "1H").to_string(),
            "ETH-USDT@candle1H"
        );
    }

    #[test]
    fn ticker_subscription_omits_interval_in_json() {
        let json = serde_json::to_string(&Subscription::ticker("BTC-USDT")).unwrap();
        assert_eq!(json, r#"{"symbol":"BTC-USDT"}"#);
        let back: Subscription = serde_json::from_str(&json).unwrap();
        assert!(back.is_ticker());
    }
}
