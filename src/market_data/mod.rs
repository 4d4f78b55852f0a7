// =============================================================================
// Market Data Cache — latest tickers and bounded candle windows
// =============================================================================
//
// Pure data structure: no network awareness. Writers are the stream session
// task, the reconciler and the polling fallback; readers are REST handlers
// and anything consuming the mirror.
// =============================================================================

pub mod candle_buffer;
pub mod ticker_store;

pub use candle_buffer::{Candle, CandleBuffer, CandleKey, CandleWrite};
pub use ticker_store::TickerStore;

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::error::MirrorResult;
use crate::store::{self, KvStore};
use crate::types::{Subscription, TickerSnapshot};

pub struct MarketDataCache {
    tickers: TickerStore,
    candles: CandleBuffer,
    stale_rejections: AtomicU64,
    dropped_candles: AtomicU64,
}

impl MarketDataCache {
    pub fn new(candle_capacity: usize) -> Self {
        Self {
            tickers: TickerStore::new(),
            candles: CandleBuffer::new(candle_capacity),
            stale_rejections: AtomicU64::new(0),
            dropped_candles: AtomicU64::new(0),
        }
    }

    /// Store `snapshot` unless an equal-or-newer one is already cached.
    /// Stale writes are silently ignored.
    pub fn upsert_ticker(&self, snapshot: TickerSnapshot) -> bool {
        let symbol = snapshot.symbol.clone();
        let ts = snapshot.timestamp;
        let accepted = self.tickers.upsert(snapshot);
        if !accepted {
            self.stale_rejections.fetch_add(1, Ordering::Relaxed);
            debug!(symbol = %symbol, timestamp = ts, "stale ticker rejected");
        }
        accepted
    }

    pub fn append_candle(&self, candle: Candle) -> CandleWrite {
        let outcome = self.candles.append(candle);
        if outcome == CandleWrite::Dropped {
            self.dropped_candles.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    pub fn get_ticker(&self, symbol: &str) -> Option<TickerSnapshot> {
        self.tickers.get(symbol)
    }

    pub fn get_candles(&self, symbol: &str, interval: &str, limit: usize) -> Option<Vec<Candle>> {
        self.candles.get(&CandleKey::new(symbol, interval), limit)
    }

    pub fn ticker_count(&self) -> usize {
        self.tickers.len()
    }

    pub fn candle_capacity(&self) -> usize {
        self.candles.capacity()
    }

    /// Freshness marker for a subscription: the ticker's exchange timestamp,
    /// or the wall-clock ms of the last write into a candle window.
    pub fn freshness(&self, sub: &Subscription) -> Option<i64> {
        match &sub.interval {
            None => self.tickers.get(&sub.symbol).map(|t| t.timestamp),
            Some(iv) => self.candles.updated_at(&CandleKey::new(sub.symbol.as_str(), iv.as_str())),
        }
    }

    /// Forget everything cached for a subscription.
    pub fn evict(&self, sub: &Subscription) {
        match &sub.interval {
            None => {
                self.tickers.remove(&sub.symbol);
            }
            Some(iv) => {
                self.candles.remove(&CandleKey::new(sub.symbol.as_str(), iv.as_str()));
            }
        }
    }

    pub fn stale_rejections(&self) -> u64 {
        self.stale_rejections.load(Ordering::Relaxed)
    }

    pub fn dropped_candles(&self) -> u64 {
        self.dropped_candles.load(Ordering::Relaxed)
    }

    /// Write the cached value of each subscription to the external store
    /// (`ticker:{symbol}` / `candles:{symbol}:{interval}`).
    /// The whole pass goes to the store in a single `put_many`.
    pub fn persist_to(&self, kv: &dyn KvStore, subs: &[Subscription]) -> MirrorResult<usize> {
        let mut batch = Vec::with_capacity(subs.len());
        for sub in subs {
            match &sub.interval {
                None => {
                    if let Some(t) = self.tickers.get(&sub.symbol) {
                        batch.push((store::ticker_key(&sub.symbol), serde_json::to_string(&t)?));
                    }
                }
                Some(iv) => {
                    if let Some(window) = self.get_candles(&sub.symbol, iv, usize::MAX) {
                        batch.push((store::candles_key(&sub.symbol, iv), serde_json::to_string(&window)?));
                    }
                }
            }
        }
        let written = batch.len();
        kv.put_many(batch)?;
        Ok(written)
    }

    /// Remove a subscription's mirrored entry from the external store.
    pub fn unpersist(&self, kv: &dyn KvStore, sub: &Subscription) -> MirrorResult<()> {
        match &sub.interval {
            None => kv.delete(&store::ticker_key(&sub.symbol)),
            Some(iv) => kv.delete(&store::candles_key(&sub.symbol, iv)),
        }
    }
}
