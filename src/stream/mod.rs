// =============================================================================
// Streaming connection — one live socket per channel class
// =============================================================================

pub mod codec;
pub mod connection;

pub use connection::{ReconnectCallback, StreamConnection, StreamSettings};

use async_trait::async_trait;

use crate::error::MirrorResult;
use crate::types::{ConnectionState, Subscription};

/// Answers "is this subscription live on the current socket?".
///
/// Only an acknowledgement sets an entry; the set is cleared whenever the
/// socket is lost, so a fresh connection always starts empty.
pub trait SubscriptionStatusProvider: Send + Sync {
    fn is_subscribed(&self, sub: &Subscription) -> bool;
}

/// Wire-level subscribe/unsubscribe against the streaming session.
///
/// Both calls resolve once the exchange acknowledges (or rejects) the request,
/// or fail with a timeout. They never touch the desired-set registry.
#[async_trait]
pub trait StreamControl: SubscriptionStatusProvider {
    async fn subscribe(&self, sub: &Subscription) -> MirrorResult<()>;

    async fn unsubscribe(&self, sub: &Subscription) -> MirrorResult<()>;

    fn state(&self) -> ConnectionState;
}
