//! Error taxonomy for the feed client.
//!
//! Everything the connection loop can recover from is handled locally (see
//! `feed::connection`); these variants cover the failures that reach the
//! caller or the `on_error` callback.

use thiserror::Error;

/// Errors surfaced by the feed client.
#[derive(Debug, Error)]
pub enum FeedError {
    /// The feed address could not be resolved to a `ws`/`wss` URL.
    #[error("invalid feed address: {0}")]
    Address(String),

    /// An outbound payload could not be serialized to JSON text.
    #[error("failed to serialize outbound payload: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A transport-level failure (handshake, read or write).
    ///
    /// Reported through `on_error` and non-fatal on its own: connection
    /// state only changes when the transport actually closes.
    #[error("feed transport error: {0}")]
    Transport(String),
}
