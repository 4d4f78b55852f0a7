// =============================================================================
// Ticker Store — latest snapshot per symbol with stale-write rejection
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::TickerSnapshot;

/// Manages the latest ticker snapshot for multiple symbols.
pub struct TickerStore {
    tickers: RwLock<HashMap<String, TickerSnapshot>>,
}

impl TickerStore {
    pub fn new() -> Self {
        Self {
            tickers: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the cached snapshot iff `snapshot.timestamp` is not older than
    /// the cached one. Returns `false` for a rejected (stale) write.
    pub fn upsert(&self, snapshot: TickerSnapshot) -> bool {
        let mut map = self.tickers.write();
        match map.get(&snapshot.symbol) {
            Some(cached) if snapshot.timestamp < cached.timestamp => false,
            _ => {
                map.insert(snapshot.symbol.clone(), snapshot);
                true
            }
        }
    }

    pub fn get(&self, symbol: &str) -> Option<TickerSnapshot> {
        self.tickers.read().get(symbol).cloned()
    }

    pub fn remove(&self, symbol: &str) -> bool {
        self.tickers.write().remove(symbol).is_some()
    }

    pub fn len(&self) -> usize {
        self.tickers.read().len()
    }
}

impl Default for TickerStore {
    fn default() -> Self {
        Self::new()
    }
}
