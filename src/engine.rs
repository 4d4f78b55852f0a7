// =============================================================================
// Market Mirror — explicit wiring and startup sequence
// =============================================================================
//
// initialize():
//   1. load the registry (seeding defaults into an empty store)
//   2. start the polling fallback
//   3. start the public stream connection; its reconnect callback publishes
//      onto the bus
//   4. publish a resubscribe for every registered entry, paced by the
//      inter-call delay
//
// Collaborators talk to the mirror only through `request_*` (fire-and-forget)
// and the synchronous `cached_*` reads.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::events::{ChangeEvent, EventBus, MarketEvent, ReconnectNotification};
use crate::exchange::MarketDataSource;
use crate::fallback::{FallbackSettings, PollingFallback, RefreshReport};
use crate::health::{EngineCounters, ExternalGauges, HealthSnapshot};
use crate::market_data::{Candle, MarketDataCache};
use crate::reconciler::{ReconcilerSettings, SubscriptionReconciler};
use crate::registry::SubscriptionRegistry;
use crate::runtime_config::RuntimeConfig;
use crate::store::KvStore;
use crate::stream::{
    ReconnectCallback, StreamConnection, StreamControl, StreamSettings, SubscriptionStatusProvider,
};
use crate::types::{ChannelClass, Interval, Subscription, Symbol, TickerSnapshot};

pub struct MarketMirror {
    registry: Arc<SubscriptionRegistry>,
    cache: Arc<MarketDataCache>,
    stream: Arc<StreamConnection>,
    fallback: Arc<PollingFallback>,
    bus: EventBus,
    counters: Arc<EngineCounters>,
    defaults: Vec<Subscription>,
    inter_call_delay: Duration,
}

/// The configured default set: every symbol's ticker plus one candle series
/// per (symbol, interval).
pub fn default_subscriptions(config: &RuntimeConfig) -> Vec<Subscription> {
    config
        .default_symbols
        .iter()
        .map(|s| Subscription::ticker(s.as_str()))
        .chain(config.default_symbols.iter().flat_map(|s| {
            config
                .default_candle_intervals
                .iter()
                .map(move |iv| Subscription::candle(s.as_str(), iv.as_str()))
        }))
        .collect()
}

impl MarketMirror {
    /// Wire every component. Must be called inside a Tokio runtime.
    pub fn new(config: &RuntimeConfig, store: Arc<dyn KvStore>, source: Arc<dyn MarketDataSource>) -> Self {
        let cache = Arc::new(MarketDataCache::new(config.candle_capacity));
        let stream = Arc::new(StreamConnection::new(
            StreamSettings::from_config(config, ChannelClass::Public),
            cache.clone(),
        ));
        let registry = Arc::new(SubscriptionRegistry::new(store.clone()));
        let counters = Arc::new(EngineCounters::new());
        let bus = EventBus::new(config.lanes);

        let fallback = Arc::new(PollingFallback::new(
            registry.clone(),
            source.clone(),
            cache.clone(),
            store.clone(),
            counters.clone(),
            FallbackSettings::from_config(config),
        ));

        let stream_control: Arc<dyn StreamControl> = stream.clone();
        let reconciler = Arc::new(SubscriptionReconciler::new(
            registry.clone(),
            stream_control,
            source,
            cache.clone(),
            store,
            fallback.clone(),
            bus.clone(),
            counters.clone(),
            ReconcilerSettings::from_config(config),
        ));
        reconciler.attach();

        let publisher = bus.clone();
        let on_reconnect: ReconnectCallback = Arc::new(move |note: ReconnectNotification| {
            publisher.publish(MarketEvent::Reconnected(note));
        });
        stream.on_reconnect(on_reconnect);

        Self {
            registry,
            cache,
            stream,
            fallback,
            bus,
            counters,
            defaults: default_subscriptions(config),
            inter_call_delay: config.inter_call_delay(),
        }
    }

    /// Ordered startup: registry → fallback → stream → paced resubscribe.
    pub async fn initialize(&self) -> Result<()> {
        let loaded = self
            .registry
            .load(&self.defaults)
            .context("failed to load subscription registry")?;

        self.fallback.start();
        self.stream.start();

        let entries = self.registry.list();
        info!(loaded, entries = entries.len(), "subscribing registered entries");
        for (i, sub) in entries.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.inter_call_delay).await;
            }
            self.bus.publish(MarketEvent::resubscribe(sub));
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("market mirror shutting down");
        self.fallback.stop().await;
        self.stream.disconnect().await;
        self.bus.wait_idle().await;
    }

    // -------------------------------------------------------------------------
    // Inbound triggers
    // -------------------------------------------------------------------------

    pub fn request_subscribe(&self, symbol: impl Into<Symbol>, interval: Option<Interval>) {
        self.bus
            .publish(MarketEvent::Change(ChangeEvent::subscribe(symbol, interval)));
    }

    pub fn request_unsubscribe(&self, symbol: impl Into<Symbol>, interval: Option<Interval>) {
        self.bus
            .publish(MarketEvent::Change(ChangeEvent::unsubscribe(symbol, interval)));
    }

    /// Operator-triggered pull of every registered entry.
    pub async fn force_refresh(&self) -> RefreshReport {
        self.fallback.force_refresh_all().await
    }

    pub fn cached_ticker(&self, symbol: &str) -> Option<TickerSnapshot> {
        self.cache.get_ticker(symbol)
    }

    pub fn cached_candles(&self, symbol: &str, interval: &str, limit: usize) -> Option<Vec<Candle>> {
        self.cache.get_candles(symbol, interval, limit)
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.registry.list()
    }

    pub fn is_live(&self, sub: &Subscription) -> bool {
        self.stream.is_subscribed(sub)
    }

    pub fn health(&self) -> HealthSnapshot {
        self.counters.snapshot(ExternalGauges {
            connection: self.stream.state(),
            registered: self.registry.len(),
            stream_sessions: self.stream.sessions(),
            consecutive_connect_failures: self.stream.consecutive_failures(),
            fatal_connectivity_alerts: self.stream.fatal_alerts(),
            cached_tickers: self.cache.ticker_count(),
            stale_ticker_rejections: self.cache.stale_rejections(),
            dropped_candles: self.cache.dropped_candles(),
            handler_failures: self.bus.handler_failures(),
        })
    }

    pub fn candle_capacity(&self) -> usize {
        self.cache.candle_capacity()
    }

    /// Wait for all published events to be handled.
    #[cfg(test)]
    pub async fn settle(&self) {
        self.bus.wait_idle().await;
    }
}

impl std::fmt::Debug for MarketMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketMirror")
            .field("registry", &self.registry)
            .field("stream", &self.stream)
            .field("fallback", &self.fallback)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::tests::FakeExchange;
    use crate::store::MemoryStore;
    use crate::stream::connection::tests::{spawn_exchange, ExchangeBehaviour};
    use crate::types::ConnectionState;

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            default_symbols: vec!["BTC-USDT".into(), "ETH-USDT".into()],
            default_candle_intervals: vec!["1m".into()],
            inter_call_delay_ms: 1,
            // Nothing listens here; the stream just keeps reconnecting.
            public_ws_url: "ws://127.0.0.1:9".into(),
            reconnect_base_delay_ms: 10,
            reconnect_max_delay_ms: 20,
            ack_timeout_ms: 50,
            max_retries: 0,
            poll_interval_ms: 60_000,
            ..RuntimeConfig::default()
        }
    }

    #[test]
    fn defaults_cover_tickers_and_candles() {
        let subs = default_subscriptions(&config());
        assert_eq!(subs.len(), 4);
        assert!(subs.contains(&Subscription::ticker("ETH-USDT")));
        assert!(subs.contains(&Subscription::candle("BTC-USDT", "1m")));
    }

    #[tokio::test]
    async fn initialize_seeds_registry_and_starts_components() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(FakeExchange::new());
        let mirror = MarketMirror::new(&config(), store.clone(), source);

        mirror.initialize().await.unwrap();
        assert_eq!(mirror.subscriptions().len(), 4);
        assert!(store.get("subscribed-tickers").unwrap().is_some());
        assert_ne!(mirror.health().connection, ConnectionState::Disconnected);

        mirror.settle().await;
        mirror.shutdown().await;
        assert_eq!(mirror.health().connection, ConnectionState::Disconnected);
        // Seeded entries survive failed wire subscribes.
        assert_eq!(mirror.subscriptions().len(), 4);
    }

    #[tokio::test]
    async fn request_before_initialize_is_replayed_once_connected() {
        let url = spawn_exchange(ExchangeBehaviour::default()).await;
        let config = RuntimeConfig {
            default_symbols: Vec::new(),
            default_candle_intervals: Vec::new(),
            public_ws_url: url,
            ack_timeout_ms: 2_000,
            ..config()
        };
        let mirror = MarketMirror::new(&config, Arc::new(MemoryStore::new()), Arc::new(FakeExchange::new()));

        mirror.request_subscribe("SOL-USDT", None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(mirror.subscriptions().is_empty());
        assert_eq!(mirror.health().connection, ConnectionState::Disconnected);

        mirror.initialize().await.unwrap();
        mirror.settle().await;

        let sol = Subscription::ticker("SOL-USDT");
        assert_eq!(mirror.subscriptions(), vec![sol.clone()]);
        assert!(mirror.is_live(&sol));
        assert!(mirror.cached_ticker("SOL-USDT").is_some());
        assert_eq!(mirror.health().exhausted_drops, 0);
        mirror.shutdown().await;
    }
}
