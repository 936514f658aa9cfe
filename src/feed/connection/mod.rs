//! Feed connection with state tracking and bounded auto-reconnect.
//!
//! This module holds the shared types and conditionally includes the
//! platform-specific connection loop (tokio-tungstenite on native targets,
//! `web_sys::WebSocket` on wasm32).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_channel::mpsc::UnboundedSender;
use serde::Serialize;

use crate::error::FeedError;
use crate::feed::address::Origin;
use crate::feed::message::Inbound;
use crate::log_warn;

/// Connection state of a feed socket.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the retry delay (or mid-handshake) after an unexpected
    /// closure; `attempt` counts retries since the last successful
    /// connection.
    Reconnecting { attempt: u32 },
    /// The reconnect budget is spent; no further attempts will be made.
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        )
    }
}

/// Configuration for auto-reconnect behavior.
///
/// The delay is constant across attempts. The feed is a low-criticality
/// dashboard stream, so there is no backoff growth and no jitter.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum automatic reconnect attempts after unexpected closures,
    /// counted since the last successful connection.
    pub max_attempts: u32,
    /// Fixed delay before each reconnect attempt.
    pub retry_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(3),
        }
    }
}

/// Consumer callback invoked once per inbound frame, in arrival order.
#[cfg(not(target_arch = "wasm32"))]
pub type MessageFn = Arc<dyn Fn(Inbound) + Send + Sync>;
/// Consumer callback for connection lifecycle events.
#[cfg(not(target_arch = "wasm32"))]
pub type LifecycleFn = Arc<dyn Fn() + Send + Sync>;
/// Consumer callback for transport-level errors.
#[cfg(not(target_arch = "wasm32"))]
pub type ErrorFn = Arc<dyn Fn(FeedError) + Send + Sync>;

/// Consumer callback invoked once per inbound frame, in arrival order.
#[cfg(target_arch = "wasm32")]
pub type MessageFn = std::rc::Rc<dyn Fn(Inbound)>;
/// Consumer callback for connection lifecycle events.
#[cfg(target_arch = "wasm32")]
pub type LifecycleFn = std::rc::Rc<dyn Fn()>;
/// Consumer callback for transport-level errors.
#[cfg(target_arch = "wasm32")]
pub type ErrorFn = std::rc::Rc<dyn Fn(FeedError)>;

/// The consumer's event callbacks. All optional; absent ones are no-ops.
#[derive(Clone, Default)]
pub(crate) struct Callbacks {
    pub on_message: Option<MessageFn>,
    pub on_open: Option<LifecycleFn>,
    pub on_close: Option<LifecycleFn>,
    pub on_error: Option<ErrorFn>,
}

impl Callbacks {
    pub(crate) fn message(&self, inbound: Inbound) {
        if let Some(f) = &self.on_message {
            f(inbound);
        }
    }

    pub(crate) fn opened(&self) {
        if let Some(f) = &self.on_open {
            f();
        }
    }

    pub(crate) fn closed(&self) {
        if let Some(f) = &self.on_close {
            f();
        }
    }

    pub(crate) fn error(&self, err: FeedError) {
        if let Some(f) = &self.on_error {
            f(err);
        }
    }
}

/// Options for [`FeedConnection::open`].
#[derive(Default)]
pub struct FeedOptions {
    /// Origin used to resolve relative feed paths. On wasm32 this defaults
    /// to the page's own origin when not set.
    pub origin: Option<Origin>,
    /// Reconnect policy; see [`ReconnectConfig`].
    pub reconnect: ReconnectConfig,
    pub(crate) callbacks: Callbacks,
}

impl FeedOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl FeedOptions {
    /// Invoked once per inbound frame, in arrival order.
    pub fn on_message(mut self, f: impl Fn(Inbound) + Send + Sync + 'static) -> Self {
        self.callbacks.on_message = Some(Arc::new(f));
        self
    }

    /// Invoked once per successful connection establishment, before any
    /// message of that connection.
    pub fn on_open(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Invoked once per connection termination, including the final one
    /// when the reconnect budget is exhausted.
    pub fn on_close(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Invoked on transport-level errors. Does not itself change the
    /// connection state; the transport's close governs that.
    pub fn on_error(mut self, f: impl Fn(FeedError) + Send + Sync + 'static) -> Self {
        self.callbacks.on_error = Some(Arc::new(f));
        self
    }
}

#[cfg(target_arch = "wasm32")]
impl FeedOptions {
    /// Invoked once per inbound frame, in arrival order.
    pub fn on_message(mut self, f: impl Fn(Inbound) + 'static) -> Self {
        self.callbacks.on_message = Some(std::rc::Rc::new(f));
        self
    }

    /// Invoked once per successful connection establishment, before any
    /// message of that connection.
    pub fn on_open(mut self, f: impl Fn() + 'static) -> Self {
        self.callbacks.on_open = Some(std::rc::Rc::new(f));
        self
    }

    /// Invoked once per connection termination, including the final one
    /// when the reconnect budget is exhausted.
    pub fn on_close(mut self, f: impl Fn() + 'static) -> Self {
        self.callbacks.on_close = Some(std::rc::Rc::new(f));
        self
    }

    /// Invoked on transport-level errors. Does not itself change the
    /// connection state; the transport's close governs that.
    pub fn on_error(mut self, f: impl Fn(FeedError) + 'static) -> Self {
        self.callbacks.on_error = Some(std::rc::Rc::new(f));
        self
    }
}

/// Shared connection state cell, written by the connection task and read by
/// the owner and every handle.
#[derive(Clone, Default)]
pub(crate) struct StateCell(Arc<Mutex<ConnectionState>>);

impl StateCell {
    pub(crate) fn get(&self) -> ConnectionState {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set(&self, next: ConnectionState) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }
}

/// Cheap, cloneable handle for sending on a feed connection.
#[derive(Clone)]
pub struct FeedHandle {
    url: String,
    state: StateCell,
    outbound: UnboundedSender<String>,
}

impl FeedHandle {
    pub(crate) fn new(url: String, state: StateCell, outbound: UnboundedSender<String>) -> Self {
        Self {
            url,
            state,
            outbound,
        }
    }

    /// Serialize a payload to JSON text and send it.
    ///
    /// Serialization failure is the only error; a disconnected feed behaves
    /// as in [`send_text`](Self::send_text) and still returns `Ok`.
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), FeedError> {
        let text = serde_json::to_string(payload)?;
        self.send_text(text);
        Ok(())
    }

    /// Send a text frame if currently connected.
    ///
    /// While disconnected the payload is logged and dropped, not queued:
    /// nothing accepted here outlives the connection generation it was
    /// accepted for.
    pub fn send_text(&self, text: impl Into<String>) {
        let text = text.into();
        if !self.state.get().is_connected() {
            log_warn!(
                "feed {} not connected, dropping outbound payload ({} bytes)",
                self.url,
                text.len()
            );
            return;
        }
        if self.outbound.unbounded_send(text).is_err() {
            log_warn!("feed {} connection task gone, dropping outbound payload", self.url);
        }
    }

    /// True while the underlying connection is established.
    pub fn is_connected(&self) -> bool {
        self.state.get().is_connected()
    }
}

// Include platform-specific implementation
#[cfg(target_arch = "wasm32")]
mod connection_wasm;
#[cfg(target_arch = "wasm32")]
pub use connection_wasm::FeedConnection;

#[cfg(not(target_arch = "wasm32"))]
mod connection_native;
#[cfg(not(target_arch = "wasm32"))]
pub use connection_native::FeedConnection;
