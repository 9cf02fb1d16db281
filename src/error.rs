use std::time::Duration;

use thiserror::Error;

/// Failure returned by any call across the session boundary.
///
/// Transports classify their raw failures into these variants before the
/// core sees them, so the fetcher, monitor and send paths only ever branch on
/// the tag.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("rate limited, retry after {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("url error: {0}")]
    Url(#[from] url::ParseError),
    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
    /// The update stream could not be opened. Never a per-event problem.
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("api error: {description} ({code})")]
    Api { code: i32, description: String },
}

impl SessionError {
    pub fn rate_limit_wait(&self) -> Option<Duration> {
        match self {
            SessionError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SessionError::NotFound(_))
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, SessionError::Forbidden(_))
    }
}
