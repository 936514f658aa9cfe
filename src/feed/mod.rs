//! Live-data feed over a reconnecting WebSocket.
//!
//! One [`FeedConnection`] owns one logical connection: a background task
//! holds the transport, the outbound channel and the retry timer, so at most
//! one of each exists per client. Consumers interact through callbacks
//! ([`FeedOptions`]) and a cloneable [`FeedHandle`] for sending.
//!
//! ```rust,ignore
//! let feed = FeedConnection::open(
//!     "/live",
//!     FeedOptions::new()
//!         .origin(Origin::parse("https://terminal.example.com")?)
//!         .on_message(|msg| match msg {
//!             Inbound::Parsed(value) => update_surface(value),
//!             Inbound::Raw(text) => log_warn!("unparsed frame: {text}"),
//!         }),
//! )?;
//!
//! feed.send(&serde_json::json!({ "subscribe": "vol-surface" }))?;
//! // dropping `feed` (or calling `feed.close()`) tears the connection down
//! // and cancels any pending reconnect
//! ```
//!
//! The connection is created by whichever scope owns the live view and
//! dropped when that scope goes away; there is no process-global client.

mod address;
mod connection;
mod message;

pub use address::{resolve_address, Origin};
pub use connection::{
    ConnectionState, ErrorFn, FeedConnection, FeedHandle, FeedOptions, LifecycleFn, MessageFn,
    ReconnectConfig,
};
pub use message::Inbound;
