// =============================================================================
// Error classification for exchange, stream and store calls
// =============================================================================
//
// Every failure the reconciler sees is sorted into one of two buckets:
//   - transient (timeout, connection not ready, transport) -> bounded retry
//   - permanent (rejected / invalid symbol, decode, store) -> drop the event
// =============================================================================

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MirrorError {
    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("connection not ready")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("exchange rejected request (code {code}): {message}")]
    Rejected { code: String, message: String },

    #[error("invalid symbol or interval: {0}")]
    InvalidSymbol(String),

    #[error("failed to decode payload: {0}")]
    Decode(String),

    #[error("persistent store error: {0}")]
    Store(String),
}

impl MirrorError {
    /// Whether the failed call may succeed if retried unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::NotConnected | Self::Transport(_)
        )
    }
}

impl From<reqwest::Error> for MirrorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(0)
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MirrorError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

pub type MirrorResult<T> = std::result::Result<T, MirrorError>;
