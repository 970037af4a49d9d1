use thiserror::Error;

/// Failure taxonomy shared by every component of the feed core.
///
/// Kept `Clone` so errors can ride inside `StreamEvent`s and status snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    /// Transient transport failure (socket drop, handshake failure, timeout).
    #[error("connection error: {0}")]
    Connection(String),

    /// A single malformed or unexpected wire message.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("sequence gap on {key}: expected {expected}, got {actual}")]
    SequenceGap { key: String, expected: u64, actual: u64 },

    /// Reconnect budget exhausted; the caller should degrade to polling.
    #[error("reconnect attempts exhausted after {attempts} tries")]
    PermanentFailure { attempts: u32 },

    #[error("storage error: {0}")]
    Storage(String),
}

impl FeedError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FeedError::Connection(_) | FeedError::Protocol(_) | FeedError::SequenceGap { .. })
    }
}

pub type FeedResult<T> = Result<T, FeedError>;

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::Protocol(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        FeedError::Connection(e.to_string())
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        FeedError::Connection(e.to_string())
    }
}
