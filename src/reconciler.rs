// =============================================================================
// Subscription Reconciler — converges the wire onto the desired set
// =============================================================================
//
// Handles, per event:
//
//   Change(Subscribe S)    wire already has S  -> no-op (logged)
//                          otherwise           -> wire subscribe, registry add,
//                                                 prime the cache
//   Change(Unsubscribe S)  wire lacks S        -> no-op on the wire, registry
//                                                 entry dropped if present
//                          otherwise           -> wire unsubscribe, registry
//                                                 remove, cache eviction
//   Reconnected(PUBLIC)    publish Resubscribe for every registry entry, then
//                          hand a forced refresh to the fallback's own task
//   Resubscribe S          skipped unless S is still registered
//
// Transient failures retry with exponential backoff up to `max_retries`;
// permanent failures are logged and the event dropped with the registry
// untouched. Nothing propagates back to the publisher.
// =============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use crate::error::MirrorResult;
use crate::events::{ChangeEvent, EventBus, EventHandler, EventKind, MarketEvent, ReconnectNotification};
use crate::exchange::MarketDataSource;
use crate::fallback::PollingFallback;
use crate::health::EngineCounters;
use crate::market_data::MarketDataCache;
use crate::registry::SubscriptionRegistry;
use crate::runtime_config::RuntimeConfig;
use crate::store::KvStore;
use crate::stream::connection::backoff_delay;
use crate::stream::StreamControl;
use crate::types::{ChannelClass, Subscription};

/// Retry backoff ceiling as a multiple of the base delay.
const RETRY_CEILING_FACTOR: u32 = 32;

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl ReconcilerSettings {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }
}

pub struct SubscriptionReconciler {
    registry: Arc<SubscriptionRegistry>,
    stream: Arc<dyn StreamControl>,
    source: Arc<dyn MarketDataSource>,
    cache: Arc<MarketDataCache>,
    store: Arc<dyn KvStore>,
    fallback: Arc<PollingFallback>,
    bus: EventBus,
    counters: Arc<EngineCounters>,
    settings: ReconcilerSettings,
}

impl SubscriptionReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        stream: Arc<dyn StreamControl>,
        source: Arc<dyn MarketDataSource>,
        cache: Arc<MarketDataCache>,
        store: Arc<dyn KvStore>,
        fallback: Arc<PollingFallback>,
        bus: EventBus,
        counters: Arc<EngineCounters>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            registry,
            stream,
            source,
            cache,
            store,
            fallback,
            bus,
            counters,
            settings,
        }
    }

    /// Register for every event kind on the bus.
    pub fn attach(self: &Arc<Self>) {
        for kind in [EventKind::Change, EventKind::Reconnected, EventKind::Resubscribe] {
            self.bus.register(kind, self.clone());
        }
    }

    // -------------------------------------------------------------------------
    // Change events
    // -------------------------------------------------------------------------

    #[instrument(skip(self), fields(seq = event.seq()))]
    async fn apply_change(&self, event: &ChangeEvent) {
        match event {
            ChangeEvent::Subscribe { subscription, .. } => self.apply_subscribe(subscription).await,
            ChangeEvent::Unsubscribe { subscription, .. } => self.apply_unsubscribe(subscription).await,
        }
    }

    async fn apply_subscribe(&self, sub: &Subscription) {
        if self.stream.is_subscribed(sub) {
            self.counters.record_idempotent_skip();
            info!(subscription = %sub, "already subscribed on the wire — no-op");
            self.record_desired(sub);
            return;
        }

        let outcome = self
            .with_retry("subscribe", sub, || self.stream.subscribe(sub))
            .await;
        if !self.settle(sub, outcome) {
            return;
        }
        self.counters.record_wire_subscribe();

        if let Err(e) = self.registry.add(sub) {
            self.counters.record_permanent_drop();
            error!(subscription = %sub, error = %e, "wire subscribed but registry write failed");
            return;
        }
        info!(subscription = %sub, "subscribed");

        if let Err(e) = self.prime(sub).await {
            warn!(subscription = %sub, error = %e, "initial pull failed — waiting for push or poll");
        }
    }

    async fn apply_unsubscribe(&self, sub: &Subscription) {
        if !self.stream.is_subscribed(sub) {
            self.counters.record_idempotent_skip();
            info!(subscription = %sub, "not subscribed on the wire — no-op");
            if self.registry.contains(sub) {
                self.forget(sub);
            }
            return;
        }

        let outcome = self
            .with_retry("unsubscribe", sub, || self.stream.unsubscribe(sub))
            .await;
        if !self.settle(sub, outcome) {
            return;
        }
        self.counters.record_wire_unsubscribe();
        self.forget(sub);
        info!(subscription = %sub, "unsubscribed");
    }

    /// Registry add for a subscription the wire already carries.
    fn record_desired(&self, sub: &Subscription) {
        match self.registry.add(sub) {
            Ok(true) => debug!(subscription = %sub, "registry entry restored"),
            Ok(false) => {}
            Err(e) => warn!(subscription = %sub, error = %e, "registry write failed"),
        }
    }

    /// Drop a subscription from the registry, the cache and the store mirror.
    fn forget(&self, sub: &Subscription) {
        if let Err(e) = self.registry.remove(sub) {
            self.counters.record_permanent_drop();
            error!(subscription = %sub, error = %e, "registry remove failed");
            return;
        }
        self.cache.evict(sub);
        if let Err(e) = self.cache.unpersist(self.store.as_ref(), sub) {
            warn!(subscription = %sub, error = %e, "failed to drop mirrored cache entry");
        }
    }

    /// Fill the cache right after a subscribe: one ticker snapshot, or the
    /// last `capacity` candles of the series.
    async fn prime(&self, sub: &Subscription) -> MirrorResult<()> {
        match &sub.interval {
            None => {
                let snapshot = self.source.fetch_ticker(&sub.symbol).await?;
                self.cache.upsert_ticker(snapshot);
            }
            Some(iv) => {
                let candles = self
                    .source
                    .fetch_candles(&sub.symbol, iv, self.cache.candle_capacity())
                    .await?;
                let count = candles.len();
                for c in candles {
                    self.cache.append_candle(c);
                }
                debug!(subscription = %sub, count, "candle window backfilled");
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Failure handling
    // -------------------------------------------------------------------------

    async fn with_retry<F, Fut>(&self, action: &'static str, sub: &Subscription, mut call: F) -> MirrorResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MirrorResult<()>>,
    {
        let base = self.settings.retry_base_delay;
        let ceiling = base.saturating_mul(RETRY_CEILING_FACTOR);
        let mut attempt = 0u32;

        loop {
            match call().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.settings.max_retries => {
                    self.counters.record_transient_retry();
                    let delay = backoff_delay(attempt, base, ceiling);
                    attempt += 1;
                    debug!(
                        action,
                        subscription = %sub,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure — retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Log and count a failed outcome. Returns true on success.
    fn settle(&self, sub: &Subscription, outcome: MirrorResult<()>) -> bool {
        match outcome {
            Ok(()) => true,
            Err(e) if e.is_transient() => {
                self.counters.record_exhausted_drop();
                warn!(
                    subscription = %sub,
                    retries = self.settings.max_retries,
                    error = %e,
                    "retries exhausted — event dropped"
                );
                false
            }
            Err(e) => {
                self.counters.record_permanent_drop();
                error!(subscription = %sub, error = %e, "exchange rejected subscription — event dropped");
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Reconnect
    // -------------------------------------------------------------------------

    fn apply_reconnect(&self, note: &ReconnectNotification) {
        self.counters.record_reconnect();
        if note.class == ChannelClass::Private {
            info!(class = %note.class, "private channel reconnected — nothing to resubscribe");
            return;
        }

        let snapshot = self.registry.list();
        info!(class = %note.class, entries = snapshot.len(), "reconnected — resubscribing registry");
        for sub in snapshot {
            self.bus.publish(MarketEvent::resubscribe(sub));
        }

        self.fallback.request_refresh();
    }

    async fn apply_resubscribe(&self, sub: &Subscription) {
        if !self.registry.contains(sub) {
            debug!(subscription = %sub, "resubscribe skipped — no longer registered");
            return;
        }
        if self.stream.is_subscribed(sub) {
            self.counters.record_idempotent_skip();
            debug!(subscription = %sub, "resubscribe skipped — already on the wire");
            return;
        }

        let outcome = self
            .with_retry("resubscribe", sub, || self.stream.subscribe(sub))
            .await;
        if self.settle(sub, outcome) {
            self.counters.record_resubscribe();
            debug!(subscription = %sub, "resubscribed");
        }
    }
}

#[async_trait]
impl EventHandler for SubscriptionReconciler {
    fn name(&self) -> &'static str {
        "subscription-reconciler"
    }

    async fn handle(&self, event: &MarketEvent) -> anyhow::Result<()> {
        match event {
            MarketEvent::Change(change) => self.apply_change(change).await,
            MarketEvent::Reconnected(note) => self.apply_reconnect(note),
            MarketEvent::Resubscribe { subscription, .. } => self.apply_resubscribe(subscription).await,
        }
        Ok(())
    }
}

impl std::fmt::Debug for SubscriptionReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionReconciler")
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::MirrorError;
    use crate::fallback::tests::FakeExchange;
    use crate::fallback::FallbackSettings;
    use crate::store::MemoryStore;
    use crate::stream::SubscriptionStatusProvider;
    use crate::types::{now_ms, ConnectionState};
    use std::time::Instant;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Stream double: acks instantly, counts wire calls, rejects listed
    /// symbols permanently and fails the next `flaky` calls transiently.
    #[derive(Default)]
    pub(crate) struct FakeStream {
        pub acked: Mutex<HashSet<Subscription>>,
        pub subscribe_calls: AtomicUsize,
        pub unsubscribe_calls: AtomicUsize,
        pub rejected: Mutex<HashSet<String>>,
        pub flaky: AtomicUsize,
    }

    impl FakeStream {
        /// Simulated socket loss.
        pub(crate) fn drop_all(&self) {
            self.acked.lock().clear();
        }

        fn check(&self, sub: &Subscription) -> MirrorResult<()> {
            if self.rejected.lock().contains(&sub.symbol) {
                return Err(MirrorError::InvalidSymbol(sub.symbol.clone()));
            }
            let flaky = self.flaky.load(Ordering::SeqCst);
            if flaky > 0 {
                self.flaky.store(flaky - 1, Ordering::SeqCst);
                return Err(MirrorError::Timeout(5));
            }
            Ok(())
        }
    }

    impl SubscriptionStatusProvider for FakeStream {
        fn is_subscribed(&self, sub: &Subscription) -> bool {
            self.acked.lock().contains(sub)
        }
    }

    #[async_trait]
    impl StreamControl for FakeStream {
        async fn subscribe(&self, sub: &Subscription) -> MirrorResult<()> {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            self.check(sub)?;
            self.acked.lock().insert(sub.clone());
            Ok(())
        }

        async fn unsubscribe(&self, sub: &Subscription) -> MirrorResult<()> {
            self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
            self.check(sub)?;
            self.acked.lock().remove(sub);
            Ok(())
        }

        fn state(&self) -> ConnectionState {
            ConnectionState::Connected
        }
    }

    pub(crate) struct Harness {
        pub bus: EventBus,
        pub stream: Arc<FakeStream>,
        pub source: Arc<FakeExchange>,
        pub registry: Arc<SubscriptionRegistry>,
        pub cache: Arc<MarketDataCache>,
        pub store: Arc<MemoryStore>,
        pub counters: Arc<EngineCounters>,
        pub fallback: Arc<PollingFallback>,
    }

    pub(crate) fn harness() -> Harness {
        harness_with(4, Duration::from_millis(1))
    }

    pub(crate) fn harness_with(lanes: usize, inter_call_delay: Duration) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(SubscriptionRegistry::new(store.clone()));
        let stream = Arc::new(FakeStream::default());
        let source = Arc::new(FakeExchange::new());
        let cache = Arc::new(MarketDataCache::new(20));
        let counters = Arc::new(EngineCounters::new());
        let bus = EventBus::new(lanes);
        let fallback = Arc::new(PollingFallback::new(
            registry.clone(),
            source.clone(),
            cache.clone(),
            store.clone(),
            counters.clone(),
            FallbackSettings {
                poll_interval: Duration::from_secs(60),
                staleness_ms: 30_000,
                inter_call_delay,
            },
        ));
        let reconciler = Arc::new(SubscriptionReconciler::new(
            registry.clone(),
            stream.clone(),
            source.clone(),
            cache.clone(),
            store.clone(),
            fallback.clone(),
            bus.clone(),
            counters.clone(),
            ReconcilerSettings {
                max_retries: 2,
                retry_base_delay: Duration::from_millis(1),
            },
        ));
        reconciler.attach();

        Harness {
            bus,
            stream,
            source,
            registry,
            cache,
            store,
            counters,
            fallback,
        }
    }

    fn subscribe(h: &Harness, symbol: &str, interval: Option<&str>) {
        h.bus.publish(MarketEvent::Change(ChangeEvent::subscribe(symbol, interval.map(str::to_string))));
    }

    fn unsubscribe(h: &Harness, symbol: &str, interval: Option<&str>) {
        h.bus.publish(MarketEvent::Change(ChangeEvent::unsubscribe(symbol, interval.map(str::to_string))));
    }

    #[tokio::test]
    async fn subscribe_then_duplicate_is_idempotent() {
        let h = harness();
        subscribe(&h, "BTC-USDT", None);
        h.bus.wait_idle().await;

        assert_eq!(h.registry.list(), vec![Subscription::ticker("BTC-USDT")]);
        assert!(h.cache.get_ticker("BTC-USDT").is_some());
        assert_eq!(h.stream.subscribe_calls.load(Ordering::SeqCst), 1);
        let writes = h.store.write_count();

        subscribe(&h, "BTC-USDT", None);
        h.bus.wait_idle().await;

        assert_eq!(h.registry.list(), vec![Subscription::ticker("BTC-USDT")]);
        assert_eq!(h.stream.subscribe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.write_count(), writes);
        assert_eq!(h.counters.idempotent_skips(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_of_absent_is_a_no_op() {
        let h = harness();
        unsubscribe(&h, "ETH-USDT", None);
        h.bus.wait_idle().await;

        assert!(h.registry.is_empty());
        assert_eq!(h.stream.unsubscribe_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.write_count(), 0);
    }

    #[tokio::test]
    async fn same_symbol_subscribe_then_unsubscribe_ends_absent() {
        let h = harness();
        for _ in 0..10 {
            subscribe(&h, "SOL-USDT", Some("1m"));
            unsubscribe(&h, "SOL-USDT", Some("1m"));
        }
        h.bus.wait_idle().await;

        let sub = Subscription::candle("SOL-USDT", "1m");
        assert!(!h.registry.contains(&sub));
        assert!(!h.stream.is_subscribed(&sub));
        assert!(h.cache.get_candles("SOL-USDT", "1m", 10).is_none());
    }

    #[tokio::test]
    async fn candle_subscribe_backfills_window() {
        let h = harness();
        subscribe(&h, "ETH-USDT", Some("1H"));
        h.bus.wait_idle().await;

        assert!(h.registry.contains(&Subscription::candle("ETH-USDT", "1H")));
        assert_eq!(h.cache.get_candles("ETH-USDT", "1H", 100).unwrap().len(), 3);
        assert_eq!(h.source.candle_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permanent_rejection_leaves_registry_unchanged() {
        let h = harness();
        h.stream.rejected.lock().insert("FOO-BAR".into());
        subscribe(&h, "FOO-BAR", None);
        h.bus.wait_idle().await;

        assert!(h.registry.is_empty());
        assert_eq!(h.stream.subscribe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.counters.permanent_drops(), 1);
        assert!(h.cache.get_ticker("FOO-BAR").is_none());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let h = harness();
        h.stream.flaky.store(2, Ordering::SeqCst);
        subscribe(&h, "BTC-USDT", None);
        h.bus.wait_idle().await;

        assert!(h.registry.contains(&Subscription::ticker("BTC-USDT")));
        assert_eq!(h.stream.subscribe_calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.counters.transient_retries(), 2);
    }

    #[tokio::test]
    async fn transient_exhaustion_drops_event() {
        let h = harness();
        h.stream.flaky.store(10, Ordering::SeqCst);
        subscribe(&h, "BTC-USDT", None);
        h.bus.wait_idle().await;

        assert!(h.registry.is_empty());
        // One attempt plus max_retries.
        assert_eq!(h.stream.subscribe_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn reconnect_restores_wire_and_cache() {
        let h = harness();
        for sym in ["A-USDT", "B-USDT", "C-USDT"] {
            subscribe(&h, sym, None);
        }
        h.bus.wait_idle().await;
        assert_eq!(h.stream.subscribe_calls.load(Ordering::SeqCst), 3);

        h.stream.drop_all();
        let reconnect_at = now_ms();
        h.bus.publish(MarketEvent::Reconnected(ReconnectNotification {
            class: ChannelClass::Public,
            at: reconnect_at,
        }));
        h.bus.wait_idle().await;
        h.fallback.wait_refresh().await.unwrap();

        for sym in ["A-USDT", "B-USDT", "C-USDT"] {
            let sub = Subscription::ticker(sym);
            assert!(h.stream.is_subscribed(&sub), "{sym} not resubscribed");
            let ts = h.cache.get_ticker(sym).unwrap().timestamp;
            assert!(ts >= reconnect_at, "{sym} cache older than reconnect");
        }
        assert_eq!(h.stream.subscribe_calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn reconnect_refresh_does_not_hold_up_other_symbols() {
        // One lane: everything shares the reconnect handler's queue.
        let h = harness_with(1, Duration::from_millis(200));
        for i in 0..10 {
            h.registry.add(&Subscription::ticker(format!("X{i}-USDT"))).unwrap();
        }

        h.bus.publish(MarketEvent::Reconnected(ReconnectNotification {
            class: ChannelClass::Public,
            at: now_ms(),
        }));
        let started = Instant::now();
        subscribe(&h, "NEW-USDT", None);

        let target = Subscription::ticker("NEW-USDT");
        while !h.registry.contains(&target) {
            assert!(started.elapsed() < Duration::from_millis(500), "subscribe stalled behind refresh");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.bus.wait_idle().await;
        assert!(started.elapsed() < Duration::from_millis(1_000));

        let report = h.fallback.wait_refresh().await.unwrap();
        assert!(report.refreshed >= 10);
    }

    #[tokio::test]
    async fn private_reconnect_is_logged_only() {
        let h = harness();
        subscribe(&h, "A-USDT", None);
        h.bus.wait_idle().await;
        h.stream.drop_all();

        h.bus.publish(MarketEvent::Reconnected(ReconnectNotification {
            class: ChannelClass::Private,
            at: now_ms(),
        }));
        h.bus.wait_idle().await;
        assert_eq!(h.stream.subscribe_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resubscribe_skips_unregistered_entries() {
        let h = harness();
        h.bus.publish(MarketEvent::resubscribe(Subscription::ticker("GONE-USDT")));
        h.bus.wait_idle().await;
        assert_eq!(h.stream.subscribe_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsubscribe_while_wire_down_still_forgets_entry() {
        let h = harness();
        subscribe(&h, "BTC-USDT", None);
        h.bus.wait_idle().await;
        h.stream.drop_all();

        unsubscribe(&h, "BTC-USDT", None);
        h.bus.wait_idle().await;

        assert!(h.registry.is_empty());
        assert_eq!(h.stream.unsubscribe_calls.load(Ordering::SeqCst), 0);
        assert!(h.cache.get_ticker("BTC-USDT").is_none());
    }
}
