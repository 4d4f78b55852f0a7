// =============================================================================
// Polling Fallback — direct pulls for stale entries and post-reconnect repair
// =============================================================================
//
// One background loop:
//   1. sleep for the poll interval (woken early by `stop`);
//   2. check the running flag — exit cleanly if cleared;
//   3. pull every registry entry whose cache freshness is older than the
//      staleness threshold (or missing), pacing calls with the inter-call
//      delay;
//   4. mirror the cache into the external store.
//
// `force_refresh_all` ignores staleness and pulls every registered entry.
// `request_refresh` runs the same pass on a task of its own and returns at
// once; requests that arrive while a pass is still queued fold into it. All
// paths share one pacing lock, so the exchange never sees them interleaved.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::MirrorResult;
use crate::exchange::MarketDataSource;
use crate::health::EngineCounters;
use crate::market_data::MarketDataCache;
use crate::registry::SubscriptionRegistry;
use crate::runtime_config::RuntimeConfig;
use crate::store::KvStore;
use crate::types::{now_ms, Subscription};

#[derive(Debug, Clone)]
pub struct FallbackSettings {
    pub poll_interval: Duration,
    pub staleness_ms: i64,
    pub inter_call_delay: Duration,
}

impl FallbackSettings {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            staleness_ms: config.staleness_ms as i64,
            inter_call_delay: config.inter_call_delay(),
        }
    }
}

/// Outcome of one refresh pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub failed: usize,
    pub skipped_fresh: usize,
}

pub struct PollingFallback {
    registry: Arc<SubscriptionRegistry>,
    source: Arc<dyn MarketDataSource>,
    cache: Arc<MarketDataCache>,
    store: Arc<dyn KvStore>,
    counters: Arc<EngineCounters>,
    settings: FallbackSettings,
    running: AtomicBool,
    wake: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
    /// A spawned forced pass is waiting for the pacing lock.
    refresh_queued: AtomicBool,
    refresh_task: Mutex<Option<JoinHandle<RefreshReport>>>,
    pacing: tokio::sync::Mutex<()>,
}

impl PollingFallback {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        source: Arc<dyn MarketDataSource>,
        cache: Arc<MarketDataCache>,
        store: Arc<dyn KvStore>,
        counters: Arc<EngineCounters>,
        settings: FallbackSettings,
    ) -> Self {
        Self {
            registry,
            source,
            cache,
            store,
            counters,
            settings,
            running: AtomicBool::new(false),
            wake: Notify::new(),
            task: Mutex::new(None),
            refresh_queued: AtomicBool::new(false),
            refresh_task: Mutex::new(None),
            pacing: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the polling loop. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("polling fallback already running");
            return;
        }
        let this = self.clone();
        *self.task.lock() = Some(tokio::spawn(async move { this.run().await }));
        info!(
            interval_ms = self.settings.poll_interval.as_millis() as u64,
            staleness_ms = self.settings.staleness_ms,
            "polling fallback started"
        );
    }

    /// Clear the running flag, wake the loop and wait for it to exit. An
    /// in-progress pass finishes its current call first; a requested forced
    /// pass runs to completion.
    pub async fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            self.wake.notify_one();
            let handle = self.task.lock().take();
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    warn!(error = %e, "polling fallback join failed");
                }
            }
            info!("polling fallback stopped");
        }
        self.wait_refresh().await;
    }

    async fn run(&self) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = self.wake.notified() => {}
            }
            if !self.is_running() {
                break;
            }

            let report = self.refresh_stale().await;
            if report.refreshed + report.failed > 0 {
                debug!(
                    refreshed = report.refreshed,
                    failed = report.failed,
                    fresh = report.skipped_fresh,
                    "fallback poll pass complete"
                );
            }

            let subs = self.registry.list();
            if let Err(e) = self.cache.persist_to(self.store.as_ref(), &subs) {
                warn!(error = %e, "failed to mirror cache to store");
            }
        }
        debug!("polling fallback loop exited");
    }

    fn is_stale(&self, sub: &Subscription, now: i64) -> bool {
        match self.cache.freshness(sub) {
            None => true,
            Some(ts) => now - ts > self.settings.staleness_ms,
        }
    }

    /// One pass over the registry, pulling only stale or missing entries.
    pub async fn refresh_stale(&self) -> RefreshReport {
        let _pace = self.pacing.lock().await;
        let now = now_ms();
        let mut report = RefreshReport::default();
        let mut first = true;

        for sub in self.registry.list() {
            if !self.is_running() {
                break;
            }
            if !self.is_stale(&sub, now) {
                report.skipped_fresh += 1;
                continue;
            }
            if !first {
                tokio::time::sleep(self.settings.inter_call_delay).await;
            }
            first = false;
            self.pull_into(&sub, &mut report).await;
        }
        report
    }

    /// Pull every registered ticker, then every registered candle window,
    /// regardless of staleness.
    pub async fn force_refresh_all(&self) -> RefreshReport {
        let _pace = self.pacing.lock().await;
        self.force_pass().await
    }

    /// Schedule a forced pass on its own task and return immediately.
    pub fn request_refresh(self: &Arc<Self>) {
        if self.refresh_queued.swap(true, Ordering::AcqRel) {
            debug!("forced refresh already queued");
            return;
        }
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let _pace = this.pacing.lock().await;
            this.refresh_queued.store(false, Ordering::Release);
            this.force_pass().await
        });
        // Passes serialise on the pacing lock, so the newest handle finishes last.
        *self.refresh_task.lock() = Some(handle);
    }

    /// Wait for the most recently requested forced pass, if any.
    pub async fn wait_refresh(&self) -> Option<RefreshReport> {
        let handle = self.refresh_task.lock().take()?;
        match handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "forced refresh task failed");
                None
            }
        }
    }

    async fn force_pass(&self) -> RefreshReport {
        let (tickers, candles): (Vec<_>, Vec<_>) =
            self.registry.list().into_iter().partition(Subscription::is_ticker);
        let mut report = RefreshReport::default();

        info!(
            tickers = tickers.len(),
            candle_series = candles.len(),
            "forced refresh of all registered entries"
        );

        for (i, sub) in tickers.iter().chain(candles.iter()).enumerate() {
            if i > 0 {
                tokio::time::sleep(self.settings.inter_call_delay).await;
            }
            self.pull_into(sub, &mut report).await;
        }

        info!(refreshed = report.refreshed, failed = report.failed, "forced refresh complete");
        report
    }

    async fn pull_into(&self, sub: &Subscription, report: &mut RefreshReport) {
        self.counters.record_poll();
        match self.pull(sub).await {
            Ok(()) => report.refreshed += 1,
            Err(e) => {
                self.counters.record_poll_failure();
                report.failed += 1;
                warn!(subscription = %sub, error = %e, "direct pull failed");
            }
        }
    }

    async fn pull(&self, sub: &Subscription) -> MirrorResult<()> {
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
                for c in candles {
                    self.cache.append_candle(c);
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for PollingFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingFallback")
            .field("running", &self.is_running())
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
    use crate::market_data::Candle;
    use crate::store::MemoryStore;
    use crate::types::TickerSnapshot;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    /// Exchange double: serves current-time tickers and three candles, counts
    /// calls, fails transiently for listed symbols.
    #[derive(Default)]
    pub(crate) struct FakeExchange {
        pub ticker_calls: AtomicUsize,
        pub candle_calls: AtomicUsize,
        pub failing: parking_lot::Mutex<HashSet<String>>,
    }

    impl FakeExchange {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn fail_for(&self, symbol: &str) {
            self.failing.lock().insert(symbol.to_string());
        }
    }

    pub(crate) fn candle(symbol: &str, interval: &str, open_time: i64) -> Candle {
        Candle {
            symbol: symbol.into(),
            interval: interval.into(),
            open_time,
            close_time: open_time + 59_999,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            quote_volume: 15.0,
            trade_count: 0,
            confirmed: true,
        }
    }

    #[async_trait]
    impl MarketDataSource for FakeExchange {
        async fn fetch_ticker(&self, symbol: &str) -> MirrorResult<TickerSnapshot> {
            self.ticker_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.lock().contains(symbol) {
                return Err(MirrorError::Timeout(10));
            }
            Ok(TickerSnapshot {
                symbol: symbol.to_string(),
                last: 100.0,
                high_24h: 110.0,
                low_24h: 90.0,
                volume_24h: 1.0,
                bid: 99.5,
                bid_size: 1.0,
                ask: 100.5,
                ask_size: 1.0,
                timestamp: now_ms(),
            })
        }

        async fn fetch_candles(&self, symbol: &str, interval: &str, limit: usize) -> MirrorResult<Vec<Candle>> {
            self.candle_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.lock().contains(symbol) {
                return Err(MirrorError::Transport("reset".into()));
            }
            Ok((0..limit.min(3) as i64)
                .map(|i| candle(symbol, interval, i * 60_000))
                .collect())
        }
    }

    fn settings() -> FallbackSettings {
        FallbackSettings {
            poll_interval: Duration::from_millis(20),
            staleness_ms: 30_000,
            inter_call_delay: Duration::from_millis(1),
        }
    }

    fn fallback(subs: &[Subscription]) -> (Arc<PollingFallback>, Arc<FakeExchange>, Arc<MarketDataCache>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(SubscriptionRegistry::new(store.clone()));
        for sub in subs {
            registry.add(sub).unwrap();
        }
        let source = Arc::new(FakeExchange::new());
        let cache = Arc::new(MarketDataCache::new(50));
        let fb = Arc::new(PollingFallback::new(
            registry,
            source.clone(),
            cache.clone(),
            store.clone(),
            Arc::new(EngineCounters::new()),
            settings(),
        ));
        (fb, source, cache, store)
    }

    #[tokio::test]
    async fn force_refresh_pulls_everything_regardless_of_staleness() {
        let subs = [
            Subscription::ticker("A-USDT"),
            Subscription::ticker("B-USDT"),
            Subscription::candle("A-USDT", "1m"),
        ];
        let (fb, source, cache, _) = fallback(&subs);

        let first = fb.force_refresh_all().await;
        assert_eq!(first.refreshed, 3);
        let second = fb.force_refresh_all().await;
        assert_eq!(second.refreshed, 3);

        assert_eq!(source.ticker_calls.load(Ordering::SeqCst), 4);
        assert_eq!(source.candle_calls.load(Ordering::SeqCst), 2);
        assert!(cache.get_ticker("B-USDT").is_some());
        assert_eq!(cache.get_candles("A-USDT", "1m", 10).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn stale_pass_skips_fresh_entries() {
        let subs = [Subscription::ticker("A-USDT"), Subscription::ticker("B-USDT")];
        let (fb, source, cache, _) = fallback(&subs);
        fb.running.store(true, Ordering::Release);

        cache.upsert_ticker(TickerSnapshot {
            symbol: "A-USDT".into(),
            last: 1.0,
            high_24h: 0.0,
            low_24h: 0.0,
            volume_24h: 0.0,
            bid: 0.0,
            bid_size: 0.0,
            ask: 0.0,
            ask_size: 0.0,
            timestamp: now_ms(),
        });

        let report = fb.refresh_stale().await;
        assert_eq!(report.skipped_fresh, 1);
        assert_eq!(report.refreshed, 1);
        assert_eq!(source.ticker_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn requested_refresh_runs_in_background() {
        let subs = [Subscription::ticker("A-USDT"), Subscription::candle("A-USDT", "1m")];
        let (fb, source, cache, _) = fallback(&subs);

        fb.request_refresh();
        fb.request_refresh();
        let report = fb.wait_refresh().await.unwrap();
        assert_eq!(report.refreshed, 2);
        assert!(cache.get_ticker("A-USDT").is_some());
        assert!(source.ticker_calls.load(Ordering::SeqCst) >= 1);
        assert!(fb.wait_refresh().await.is_none());
    }

    #[tokio::test]
    async fn failures_are_counted_not_propagated() {
        let subs = [Subscription::ticker("A-USDT"), Subscription::ticker("BAD-USDT")];
        let (fb, source, _, _) = fallback(&subs);
        source.fail_for("BAD-USDT");
        let report = fb.force_refresh_all().await;
        assert_eq!(report, RefreshReport { refreshed: 1, failed: 1, skipped_fresh: 0 });
    }

    #[tokio::test]
    async fn loop_polls_persists_and_stops_cooperatively() {
        let subs = [Subscription::ticker("A-USDT")];
        let (fb, source, _, store) = fallback(&subs);

        fb.start();
        assert!(fb.is_running());
        for _ in 0..100 {
            if store.get("ticker:A-USDT").unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(source.ticker_calls.load(Ordering::SeqCst) >= 1);
        assert!(store.get("ticker:A-USDT").unwrap().is_some());

        fb.stop().await;
        assert!(!fb.is_running());
        let calls = source.ticker_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(source.ticker_calls.load(Ordering::SeqCst), calls);
    }
}
