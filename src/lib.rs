//! Self-healing WebSocket client for live dashboard feeds.
//!
//! The Volterm dashboard keeps a single logical connection open to its
//! live-data endpoint. This crate owns that connection: it resolves the feed
//! address, establishes the socket, delivers inbound frames to a consumer
//! callback in arrival order, and re-establishes the connection a bounded
//! number of times after an unexpected drop, with a fixed delay between
//! attempts.
//!
//! The same API is available on native hosts (tokio + tokio-tungstenite) and
//! in the browser (wasm32 + `web_sys::WebSocket`); the platform split lives
//! in `feed::connection`.

pub mod error;
pub mod feed;
pub mod logging;

pub use error::FeedError;
pub use feed::{
    resolve_address, ConnectionState, FeedConnection, FeedHandle, FeedOptions, Inbound, Origin,
    ReconnectConfig,
};
