// =============================================================================
// Event Bus — asynchronous dispatch of subscription changes and reconnects
// =============================================================================
//
// Scheduling model:
//   - a fixed pool of lanes, each a Tokio task draining an unbounded queue;
//   - events carrying a symbol are hashed onto one lane, so two events for
//     the same symbol reach every handler in publish order;
//   - symbol-less events (reconnect notifications) are spread round-robin.
//
// `publish` never blocks and never sees a handler's failure: errors and
// panics are logged and counted inside the lane.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, warn};

use crate::types::{ChannelClass, Interval, Subscription, Symbol};

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_seq() -> u64 {
    NEXT_SEQ.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A request to change the desired subscription set. `seq` is assigned at
/// creation from a process-wide monotonic counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ChangeEvent {
    Subscribe { subscription: Subscription, seq: u64 },
    Unsubscribe { subscription: Subscription, seq: u64 },
}

impl ChangeEvent {
    pub fn subscribe(symbol: impl Into<Symbol>, interval: Option<Interval>) -> Self {
        Self::Subscribe {
            subscription: Subscription {
                symbol: symbol.into(),
                interval,
            },
            seq: next_seq(),
        }
    }

    pub fn unsubscribe(symbol: impl Into<Symbol>, interval: Option<Interval>) -> Self {
        Self::Unsubscribe {
            subscription: Subscription {
                symbol: symbol.into(),
                interval,
            },
            seq: next_seq(),
        }
    }

    pub fn subscription(&self) -> &Subscription {
        match self {
            Self::Subscribe { subscription, .. } | Self::Unsubscribe { subscription, .. } => {
                subscription
            }
        }
    }

    pub fn seq(&self) -> u64 {
        match self {
            Self::Subscribe { seq, .. } | Self::Unsubscribe { seq, .. } => *seq,
        }
    }
}

/// Emitted once each time a session reaches CONNECTED from any other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconnectNotification {
    pub class: ChannelClass,
    /// Wall-clock ms of the transition.
    pub at: i64,
}

/// Everything that travels over the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketEvent {
    Change(ChangeEvent),
    Reconnected(ReconnectNotification),
    /// Re-establish one registry entry on a fresh socket. Carried on the
    /// symbol's lane so it cannot overtake a pending unsubscribe.
    Resubscribe { subscription: Subscription, seq: u64 },
}

impl MarketEvent {
    pub fn resubscribe(subscription: Subscription) -> Self {
        Self::Resubscribe {
            subscription,
            seq: next_seq(),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Change(_) => EventKind::Change,
            Self::Reconnected(_) => EventKind::Reconnected,
            Self::Resubscribe { .. } => EventKind::Resubscribe,
        }
    }

    /// Symbol used for lane routing, if any.
    pub fn lane_key(&self) -> Option<&str> {
        match self {
            Self::Change(c) => Some(&c.subscription().symbol),
            Self::Resubscribe { subscription, .. } => Some(&subscription.symbol),
            Self::Reconnected(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum EventKind {
    Change,
    Reconnected,
    Resubscribe,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &MarketEvent) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

struct Dispatch {
    handlers: RwLock<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
    in_flight: AtomicUsize,
    idle: Notify,
    handler_failures: AtomicU64,
}

impl Dispatch {
    fn handlers_for(&self, kind: EventKind) -> Vec<Arc<dyn EventHandler>> {
        self.handlers.read().get(&kind).cloned().unwrap_or_default()
    }

    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    lanes: Arc<Vec<mpsc::UnboundedSender<MarketEvent>>>,
    dispatch: Arc<Dispatch>,
    round_robin: Arc<AtomicUsize>,
}

impl EventBus {
    /// Spawn `lanes` worker tasks. Must be called inside a Tokio runtime.
    pub fn new(lanes: usize) -> Self {
        let dispatch = Arc::new(Dispatch {
            handlers: RwLock::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            handler_failures: AtomicU64::new(0),
        });

        let senders = (0..lanes.max(1))
            .map(|lane| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_lane(lane, rx, dispatch.clone()));
                tx
            })
            .collect();

        Self {
            lanes: Arc::new(senders),
            dispatch,
            round_robin: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register `handler` for every event of `kind`.
    pub fn register(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        debug!(kind = ?kind, handler = handler.name(), "event handler registered");
        self.dispatch
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push(handler);
    }

    fn lane_for(&self, event: &MarketEvent) -> usize {
        let n = self.lanes.len();
        match event.lane_key() {
            Some(symbol) => {
                let mut hasher = DefaultHasher::new();
                symbol.hash(&mut hasher);
                (hasher.finish() % n as u64) as usize
            }
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % n,
        }
    }

    /// Enqueue `event` and return immediately.
    pub fn publish(&self, event: MarketEvent) {
        let lane = self.lane_for(&event);
        self.dispatch.in_flight.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.lanes[lane].send(event) {
            self.dispatch.finish_one();
            warn!(lane, event = ?e.0, "event lane closed — event dropped");
        }
    }

    /// Events published but not yet fully handled.
    pub fn in_flight(&self) -> usize {
        self.dispatch.in_flight.load(Ordering::Acquire)
    }

    pub fn handler_failures(&self) -> u64 {
        self.dispatch.handler_failures.load(Ordering::Relaxed)
    }

    /// Wait until every published event (including events published by
    /// handlers while draining) has been handled.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.dispatch.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn run_lane(
    lane: usize,
    mut rx: mpsc::UnboundedReceiver<MarketEvent>,
    dispatch: Arc<Dispatch>,
) {
    while let Some(event) = rx.recv().await {
        for handler in dispatch.handlers_for(event.kind()) {
            match AssertUnwindSafe(handler.handle(&event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    dispatch.handler_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(lane, handler = handler.name(), error = %e, "event handler failed");
                }
                Err(_) => {
                    dispatch.handler_failures.fetch_add(1, Ordering::Relaxed);
                    error!(lane, handler = handler.name(), event = ?event, "event handler panicked");
                }
            }
        }
        dispatch.finish_one();
    }
    debug!(lane, "event lane stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Records (symbol, seq) in handling order, sleeping to shake scheduling.
    struct Recorder {
        seen: Mutex<Vec<(String, u64)>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn handle(&self, event: &MarketEvent) -> anyhow::Result<()> {
            if let MarketEvent::Change(c) = event {
                if c.seq() % 3 == 0 {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                self.seen
                    .lock()
                    .push((c.subscription().symbol.clone(), c.seq()));
            }
            Ok(())
        }
    }

    struct Faulty;

    #[async_trait]
    impl EventHandler for Faulty {
        fn name(&self) -> &'static str {
            "faulty"
        }

        async fn handle(&self, event: &MarketEvent) -> anyhow::Result<()> {
            match event {
                MarketEvent::Change(ChangeEvent::Subscribe { .. }) => anyhow::bail!("boom"),
                _ => panic!("handler panic"),
            }
        }
    }

    #[test]
    fn seq_is_monotonic() {
        let a = ChangeEvent::subscribe("BTC-USDT", None);
        let b = ChangeEvent::unsubscribe("BTC-USDT", None);
        assert!(b.seq() > a.seq());
        assert_eq!(a.subscription(), b.subscription());
    }

    #[tokio::test]
    async fn same_symbol_events_keep_publish_order() {
        let bus = EventBus::new(4);
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        bus.register(EventKind::Change, recorder.clone());

        let symbols = ["BTC-USDT", "ETH-USDT", "SOL-USDT"];
        for i in 0..30 {
            let sym = symbols[i % symbols.len()];
            let event = if i % 2 == 0 {
                ChangeEvent::subscribe(sym, None)
            } else {
                ChangeEvent::unsubscribe(sym, None)
            };
            bus.publish(MarketEvent::Change(event));
        }
        bus.wait_idle().await;

        let seen = recorder.seen.lock().clone();
        assert_eq!(seen.len(), 30);
        for sym in symbols {
            let seqs: Vec<u64> = seen.iter().filter(|(s, _)| s == sym).map(|(_, q)| *q).collect();
            let mut sorted = seqs.clone();
            sorted.sort();
            assert_eq!(seqs, sorted, "lane order broken for {sym}");
        }
    }

    #[tokio::test]
    async fn handler_failures_do_not_reach_publisher() {
        let bus = EventBus::new(2);
        bus.register(EventKind::Change, Arc::new(Faulty));
        bus.register(EventKind::Reconnected, Arc::new(Faulty));

        bus.publish(MarketEvent::Change(ChangeEvent::subscribe("BTC-USDT", None)));
        bus.publish(MarketEvent::Reconnected(ReconnectNotification {
            class: ChannelClass::Public,
            at: 0,
        }));
        bus.wait_idle().await;

        assert_eq!(bus.handler_failures(), 2);
        assert_eq!(bus.in_flight(), 0);

        // Lanes survive a panicking handler.
        bus.publish(MarketEvent::Change(ChangeEvent::subscribe("BTC-USDT", None)));
        bus.wait_idle().await;
        assert_eq!(bus.handler_failures(), 3);
    }

    #[tokio::test]
    async fn unregistered_kinds_are_drained() {
        let bus = EventBus::new(1);
        bus.publish(MarketEvent::resubscribe(Subscription::ticker("BTC-USDT")));
        bus.wait_idle().await;
        assert_eq!(bus.in_flight(), 0);
    }
}
