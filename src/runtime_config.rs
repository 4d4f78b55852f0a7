// =============================================================================
// Runtime Configuration — mirror settings with atomic save
// =============================================================================
//
// Every tunable of the mirror lives here: default subscription set, cache
// capacity, timeouts, backoff, polling cadence and endpoints.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTC-USDT".to_string(),
        "ETH-USDT".to_string(),
        "SOL-USDT".to_string(),
    ]
}

fn default_candle_intervals() -> Vec<String> {
    vec!["1m".to_string(), "1H".to_string()]
}

fn default_candle_capacity() -> usize {
    500
}

fn default_ack_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}

fn default_reconnect_failure_limit() -> u32 {
    10
}

fn default_poll_interval_ms() -> u64 {
    15_000
}

fn default_staleness_ms() -> u64 {
    30_000
}

fn default_inter_call_delay_ms() -> u64 {
    200
}

fn default_lanes() -> usize {
    8
}

fn default_ping_interval_ms() -> u64 {
    25_000
}

fn default_public_ws_url() -> String {
    "wss://ws.okx.com:8443/ws/v5/public".to_string()
}

fn default_private_ws_url() -> String {
    "wss://ws.okx.com:8443/ws/v5/private".to_string()
}

fn default_rest_base_url() -> String {
    "https://www.okx.com".to_string()
}

fn default_store_path() -> String {
    "mirror_store.json".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the market mirror.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Default subscription set ------------------------------------------

    /// Ticker symbols seeded into an empty registry.
    #[serde(default = "default_symbols")]
    pub default_symbols: Vec<String>,

    /// Candle intervals seeded for every default symbol.
    #[serde(default = "default_candle_intervals")]
    pub default_candle_intervals: Vec<String>,

    /// Candles retained per (symbol, interval) window.
    #[serde(default = "default_candle_capacity")]
    pub candle_capacity: usize,

    // --- Timeouts & retries -------------------------------------------------

    /// Wait for a subscribe/unsubscribe acknowledgement.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Direct REST pull timeout.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Retries for transient subscription failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    // --- Reconnect ------------------------------------------------------------

    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Backoff ceiling; retries continue at this delay once reached.
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Consecutive reconnect failures before a fatal connectivity alert.
    #[serde(default = "default_reconnect_failure_limit")]
    pub reconnect_failure_limit: u32,

    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    // --- Polling fallback -----------------------------------------------------

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Cached data older than this is pulled directly.
    #[serde(default = "default_staleness_ms")]
    pub staleness_ms: u64,

    /// Pause between successive direct REST calls (exchange rate limits).
    #[serde(default = "default_inter_call_delay_ms")]
    pub inter_call_delay_ms: u64,

    // --- Dispatch ---------------------------------------------------------------

    /// Number of per-symbol execution lanes on the event bus.
    #[serde(default = "default_lanes")]
    pub lanes: usize,

    // --- Endpoints --------------------------------------------------------------

    #[serde(default = "default_public_ws_url")]
    pub public_ws_url: String,

    #[serde(default = "default_private_ws_url")]
    pub private_ws_url: String,

    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    /// Path of the file-backed registry store.
    #[serde(default = "default_store_path")]
    pub store_path: String,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_symbols: default_symbols(),
            default_candle_intervals: default_candle_intervals(),
            candle_capacity: default_candle_capacity(),
            ack_timeout_ms: default_ack_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_failure_limit: default_reconnect_failure_limit(),
            ping_interval_ms: default_ping_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            staleness_ms: default_staleness_ms(),
            inter_call_delay_ms: default_inter_call_delay_ms(),
            lanes: default_lanes(),
            public_ws_url: default_public_ws_url(),
            private_ws_url: default_private_ws_url(),
            rest_base_url: default_rest_base_url(),
            store_path: default_store_path(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.default_symbols,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `MIRROR_*` environment overrides on top of the loaded values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(syms) = std::env::var("MIRROR_SYMBOLS") {
            self.default_symbols = parse_symbol_list(&syms);
        }
        if let Ok(addr) = std::env::var("MIRROR_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(path) = std::env::var("MIRROR_STORE_PATH") {
            self.store_path = path;
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn inter_call_delay(&self) -> Duration {
        Duration::from_millis(self.inter_call_delay_ms)
    }
}

/// Split a comma-separated symbol list, trimming and upper-casing entries.
fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}
