// =============================================================================
// Subscription Registry — durable record of the desired subscription set
// =============================================================================
//
// In-memory view: ticker symbols plus a symbol -> intervals map, both hashed
// for O(1) membership.  Every add/remove is written through to the external
// store before the in-memory view changes, so a failed write leaves both
// sides as they were.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::MirrorResult;
use crate::store::{self, KvStore};
use crate::types::{Interval, Subscription, Symbol};

#[derive(Default)]
struct RegistryState {
    tickers: HashSet<Symbol>,
    candles: HashMap<Symbol, HashSet<Interval>>,
}

impl RegistryState {
    fn contains(&self, sub: &Subscription) -> bool {
        match &sub.interval {
            None => self.tickers.contains(&sub.symbol),
            Some(iv) => self
                .candles
                .get(&sub.symbol)
                .is_some_and(|set| set.contains(iv)),
        }
    }

    fn len(&self) -> usize {
        self.tickers.len() + self.candles.values().map(HashSet::len).sum::<usize>()
    }

    fn is_empty(&self) -> bool {
        self.tickers.is_empty() && self.candles.values().all(HashSet::is_empty)
    }
}

pub struct SubscriptionRegistry {
    store: Arc<dyn KvStore>,
    state: RwLock<RegistryState>,
    /// Serialises read-modify-write cycles against the store.
    write_guard: Mutex<()>,
}

impl SubscriptionRegistry {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            state: RwLock::new(RegistryState::default()),
            write_guard: Mutex::new(()),
        }
    }

    /// Populate the in-memory view from the store. An empty store is seeded
    /// with `defaults`; once seeded the store is non-empty, so repeated calls
    /// simply reload it.
    pub fn load(&self, defaults: &[Subscription]) -> MirrorResult<usize> {
        let loaded = self.read_store()?;

        if loaded.is_empty() && self.is_empty() {
            info!(count = defaults.len(), "registry store empty — seeding defaults");
            for sub in defaults {
                self.add(sub)?;
            }
        } else {
            *self.state.write() = loaded;
        }

        let count = self.len();
        info!(count, "subscription registry loaded");
        Ok(count)
    }

    fn read_store(&self) -> MirrorResult<RegistryState> {
        let mut state = RegistryState::default();

        if let Some(raw) = self.store.get(store::SUBSCRIBED_TICKERS_KEY)? {
            let symbols: Vec<Symbol> = serde_json::from_str(&raw)?;
            state.tickers.extend(symbols);
        }

        for key in self.store.keys_with_prefix(store::SUBSCRIBED_CANDLES_PREFIX)? {
            let symbol = key[store::SUBSCRIBED_CANDLES_PREFIX.len()..].to_string();
            let Some(raw) = self.store.get(&key)? else {
                continue;
            };
            let intervals: Vec<Interval> = serde_json::from_str(&raw)?;
            if intervals.is_empty() {
                continue;
            }
            state.candles.entry(symbol).or_default().extend(intervals);
        }

        Ok(state)
    }

    /// Record `sub` as desired. Returns `Ok(false)` when it was already
    /// present (no store write).
    pub fn add(&self, sub: &Subscription) -> MirrorResult<bool> {
        let _guard = self.write_guard.lock();
        if self.state.read().contains(sub) {
            debug!(subscription = %sub, "registry add: already present");
            return Ok(false);
        }

        match &sub.interval {
            None => {
                let mut next: Vec<Symbol> = self.state.read().tickers.iter().cloned().collect();
                next.push(sub.symbol.clone());
                next.sort();
                self.store
                    .put(store::SUBSCRIBED_TICKERS_KEY, serde_json::to_string(&next)?)?;
                self.state.write().tickers.insert(sub.symbol.clone());
            }
            Some(iv) => {
                let mut next: Vec<Interval> = self
                    .state
                    .read()
                    .candles
                    .get(&sub.symbol)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                next.push(iv.clone());
                next.sort();
                self.store.put(
                    &store::subscribed_candles_key(&sub.symbol),
                    serde_json::to_string(&next)?,
                )?;
                self.state
                    .write()
                    .candles
                    .entry(sub.symbol.clone())
                    .or_default()
                    .insert(iv.clone());
            }
        }

        debug!(subscription = %sub, "registry add persisted");
        Ok(true)
    }

    /// Forget `sub`. Returns `Ok(false)` when it was not present.
    pub fn remove(&self, sub: &Subscription) -> MirrorResult<bool> {
        let _guard = self.write_guard.lock();
        if !self.state.read().contains(sub) {
            debug!(subscription = %sub, "registry remove: not present");
            return Ok(false);
        }

        match &sub.interval {
            None => {
                let mut next: Vec<Symbol> = self
                    .state
                    .read()
                    .tickers
                    .iter()
                    .filter(|s| **s != sub.symbol)
                    .cloned()
                    .collect();
                next.sort();
                self.store
                    .put(store::SUBSCRIBED_TICKERS_KEY, serde_json::to_string(&next)?)?;
                self.state.write().tickers.remove(&sub.symbol);
            }
            Some(iv) => {
                let mut next: Vec<Interval> = self
                    .state
                    .read()
                    .candles
                    .get(&sub.symbol)
                    .map(|set| set.iter().filter(|i| *i != iv).cloned().collect())
                    .unwrap_or_default();
                next.sort();
                let key = store::subscribed_candles_key(&sub.symbol);
                if next.is_empty() {
                    self.store.delete(&key)?;
                } else {
                    self.store.put(&key, serde_json::to_string(&next)?)?;
                }

                let mut state = self.state.write();
                if let Some(set) = state.candles.get_mut(&sub.symbol) {
                    set.remove(iv);
                    if set.is_empty() {
                        state.candles.remove(&sub.symbol);
                    }
                }
            }
        }

        debug!(subscription = %sub, "registry remove persisted");
        Ok(true)
    }

    pub fn contains(&self, sub: &Subscription) -> bool {
        self.state.read().contains(sub)
    }

    /// Point-in-time copy of the desired set, sorted for stable iteration.
    pub fn list(&self) -> Vec<Subscription> {
        let state = self.state.read();
        let mut subs: Vec<Subscription> = state
            .tickers
            .iter()
            .map(|s| Subscription::ticker(s.as_str()))
            .chain(state.candles.iter().flat_map(|(sym, ivs)| {
                ivs.iter().map(move |iv| Subscription::candle(sym.as_str(), iv.as_str()))
            }))
            .collect();
        drop(state);
        subs.sort();
        subs
    }

    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("SubscriptionRegistry")
            .field("tickers", &state.tickers.len())
            .field("candle_symbols", &state.candles.len())
            .finish()
    }
}
