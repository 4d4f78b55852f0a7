// =============================================================================
// Engine Counters — lock-free tallies of reconciler and fallback activity
// =============================================================================
//
// Any task may bump a counter; readers take a `HealthSnapshot` for the health
// endpoint. Nothing here gates behaviour.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::types::ConnectionState;

#[derive(Debug, Default)]
pub struct EngineCounters {
    wire_subscribes: AtomicU64,
    wire_unsubscribes: AtomicU64,
    idempotent_skips: AtomicU64,
    transient_retries: AtomicU64,
    exhausted_drops: AtomicU64,
    permanent_drops: AtomicU64,
    reconnects: AtomicU64,
    resubscribes: AtomicU64,
    polls: AtomicU64,
    poll_failures: AtomicU64,
}

/// Point-in-time copy of [`EngineCounters`] plus connection and cache state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub connection: ConnectionState,
    pub registered: usize,
    pub wire_subscribes: u64,
    pub wire_unsubscribes: u64,
    pub idempotent_skips: u64,
    pub transient_retries: u64,
    pub exhausted_drops: u64,
    pub permanent_drops: u64,
    pub reconnects: u64,
    pub resubscribes: u64,
    pub polls: u64,
    pub poll_failures: u64,
    pub stream_sessions: u64,
    pub consecutive_connect_failures: u32,
    pub fatal_connectivity_alerts: u64,
    pub cached_tickers: usize,
    pub stale_ticker_rejections: u64,
    pub dropped_candles: u64,
    pub handler_failures: u64,
}

/// Values owned by other components, gathered by the caller.
#[derive(Debug, Clone, Copy)]
pub struct ExternalGauges {
    pub connection: ConnectionState,
    pub registered: usize,
    pub stream_sessions: u64,
    pub consecutive_connect_failures: u32,
    pub fatal_connectivity_alerts: u64,
    pub cached_tickers: usize,
    pub stale_ticker_rejections: u64,
    pub dropped_candles: u64,
    pub handler_failures: u64,
}

macro_rules! bump {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl EngineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    bump! {
        record_wire_subscribe => wire_subscribes,
        record_wire_unsubscribe => wire_unsubscribes,
        record_idempotent_skip => idempotent_skips,
        record_transient_retry => transient_retries,
        record_exhausted_drop => exhausted_drops,
        record_permanent_drop => permanent_drops,
        record_reconnect => reconnects,
        record_resubscribe => resubscribes,
        record_poll => polls,
        record_poll_failure => poll_failures,
    }

    pub fn snapshot(&self, gauges: ExternalGauges) -> HealthSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        HealthSnapshot {
            connection: gauges.connection,
            registered: gauges.registered,
            wire_subscribes: load(&self.wire_subscribes),
            wire_unsubscribes: load(&self.wire_unsubscribes),
            idempotent_skips: load(&self.idempotent_skips),
            transient_retries: load(&self.transient_retries),
            exhausted_drops: load(&self.exhausted_drops),
            permanent_drops: load(&self.permanent_drops),
            reconnects: load(&self.reconnects),
            resubscribes: load(&self.resubscribes),
            polls: load(&self.polls),
            poll_failures: load(&self.poll_failures),
            stream_sessions: gauges.stream_sessions,
            consecutive_connect_failures: gauges.consecutive_connect_failures,
            fatal_connectivity_alerts: gauges.fatal_connectivity_alerts,
            cached_tickers: gauges.cached_tickers,
            stale_ticker_rejections: gauges.stale_ticker_rejections,
            dropped_candles: gauges.dropped_candles,
            handler_failures: gauges.handler_failures,
        }
    }
}

#[cfg(test)]
impl EngineCounters {
    pub fn idempotent_skips(&self) -> u64 {
        self.idempotent_skips.load(Ordering::Relaxed)
    }

    pub fn permanent_drops(&self) -> u64 {
        self.permanent_drops.load(Ordering::Relaxed)
    }

    pub fn transient_retries(&self) -> u64 {
        self.transient_retries.load(Ordering::Relaxed)
    }
}
