//! Typed errors for the data plane.
//!
//! The ingestor state machine is driven by explicit matches on these
//! variants; nothing in the feed path uses panics or stringly-typed errors
//! for control flow.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    /// Broker or network unreachable. Retried locally with capped backoff,
    /// never propagated to clients.
    #[error("transport: {0}")]
    Transport(String),

    /// Malformed wire frame. The frame is dropped and counted; the stream
    /// continues.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Venue socket closed. Propagates up to the ingestor, which reconnects.
    #[error("disconnect: {0}")]
    Disconnect(String),

    /// Book update-id discontinuity. Forces a resnapshot.
    #[error("sequence gap: expected prev {expected}, got {got}")]
    SequenceGap { expected: i64, got: i64 },

    /// A post-apply book invariant failed (e.g. crossed book). Logged with
    /// context and handled like a gap.
    #[error("book invariant violated: {0}")]
    Invariant(String),

    /// Malformed environment or configuration at startup. Fatal, exit 2.
    #[error("config: {0}")]
    Config(String),
}

impl From<redis::RedisError> for FeedError {
    fn from(e: redis::RedisError) -> Self {
        FeedError::Transport(e.to_string())
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        FeedError::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        FeedError::Disconnect(e.to_string())
    }
}

pub type FeedResult<T> = Result<T, FeedError>;
