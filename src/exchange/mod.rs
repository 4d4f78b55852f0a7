// =============================================================================
// Exchange collaborator — direct REST pulls used by the reconciler and the
// polling fallback
// =============================================================================

pub mod okx_client;

pub use okx_client::OkxClient;

use async_trait::async_trait;

use crate::error::MirrorResult;
use crate::market_data::Candle;
use crate::types::TickerSnapshot;

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_ticker(&self, symbol: &str) -> MirrorResult<TickerSnapshot>;

    /// Most recent `limit` candles, ascending by open time.
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> MirrorResult<Vec<Candle>>;
}
