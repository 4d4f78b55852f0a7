// =============================================================================
// Persistent key-value store — registry and cache mirror backing
// =============================================================================
//
// Key layout:
//   subscribed-tickers            -> JSON array of symbols
//   subscribed-candles:{symbol}   -> JSON array of intervals
//   ticker:{symbol}               -> JSON TickerSnapshot
//   candles:{symbol}:{interval}   -> JSON array of Candle (ascending)
// =============================================================================

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::MirrorResult;

pub const SUBSCRIBED_TICKERS_KEY: &str = "subscribed-tickers";
pub const SUBSCRIBED_CANDLES_PREFIX: &str = "subscribed-candles:";

pub fn subscribed_candles_key(symbol: &str) -> String {
    format!("{SUBSCRIBED_CANDLES_PREFIX}{symbol}")
}

pub fn ticker_key(symbol: &str) -> String {
    format!("ticker:{symbol}")
}

pub fn candles_key(symbol: &str, interval: &str) -> String {
    format!("candles:{symbol}:{interval}")
}

/// External persistent key-value service. Writes are durable once the call
/// returns `Ok`.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> MirrorResult<Option<String>>;
    fn put(&self, key: &str, value: String) -> MirrorResult<()>;
    fn delete(&self, key: &str) -> MirrorResult<()>;
    fn keys_with_prefix(&self, prefix: &str) -> MirrorResult<Vec<String>>;

    /// Write several entries as one unit. Stores with a per-write cost
    /// override this.
    fn put_many(&self, entries: Vec<(String, String)>) -> MirrorResult<()> {
        for (key, value) in entries {
            self.put(&key, value)?;
        }
        Ok(())
    }
}
