//! Typed error definitions for the BTS feed.
//!
//! Provides [`BtsError`] for domain-specific errors that are more informative
//! than plain `anyhow::Error` strings. All variants implement `std::error::Error`
//! via `thiserror`, so they integrate seamlessly with `anyhow::Result`.

use thiserror::Error;

/// Domain-specific errors for the BTS feed.
#[derive(Debug, Error)]
pub enum BtsError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Snapshot store registration error (e.g. a key claimed by two sources).
    #[error("store error: {0}")]
    Store(String),

    /// WebSocket connection, handshake, or communication error.
    #[error("websocket error: {0}")]
    WebSocket(String),
}
