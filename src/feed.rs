//! Errors shared by the external data feeds.

use thiserror::Error;

/// A feed request that did not produce usable data. Always recoverable: the
/// caller falls back to stale or empty data for the cycle.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeedError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("malformed payload: {0}")]
    Shape(String),
}

impl FeedError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FeedError::Timeout
        } else if err.is_decode() {
            FeedError::Shape(err.to_string())
        } else {
            FeedError::Transport(err.to_string())
        }
    }
}
