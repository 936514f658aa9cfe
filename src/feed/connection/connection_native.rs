//! Native feed connection using tokio-tungstenite.

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::{Callbacks, ConnectionState, FeedHandle, FeedOptions, ReconnectConfig, StateCell};
use crate::error::FeedError;
use crate::feed::address::resolve_address;
use crate::feed::message::Inbound;
use crate::{log_debug, log_error, log_info, log_warn};

/// A self-healing connection to one live-data feed (native implementation).
///
/// The background task spawned by [`open`](Self::open) exclusively owns the
/// transport and the retry timer; this value and its handles only observe
/// state and feed the outbound channel.
pub struct FeedConnection {
    url: String,
    state: StateCell,
    outbound: UnboundedSender<String>,
    shutdown: watch::Sender<bool>,
}

impl FeedConnection {
    /// Resolve `address` and start connecting in the background.
    ///
    /// Returns immediately; establishment is observed through
    /// [`state`](Self::state) and the `on_open` callback. An address that
    /// cannot be resolved fails here and nothing is retried. Must be called
    /// from within a tokio runtime.
    pub fn open(address: &str, options: FeedOptions) -> Result<Self, FeedError> {
        let url = resolve_address(address, options.origin.as_ref())?;
        let (outbound_tx, outbound_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = StateCell::default();

        tokio::spawn(run_connection(
            url.clone(),
            state.clone(),
            outbound_rx,
            shutdown_rx,
            options.callbacks,
            options.reconnect,
        ));

        Ok(Self {
            url,
            state,
            outbound: outbound_tx,
            shutdown: shutdown_tx,
        })
    }

    /// The resolved feed URL this connection targets.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Snapshot of the connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// True while the underlying connection is established.
    pub fn is_connected(&self) -> bool {
        self.state.get().is_connected()
    }

    /// Get a cloneable handle for sending on this connection.
    pub fn handle(&self) -> FeedHandle {
        FeedHandle::new(self.url.clone(), self.state.clone(), self.outbound.clone())
    }

    /// Serialize a payload to JSON text and send it; see [`FeedHandle::send`].
    pub fn send<T: serde::Serialize + ?Sized>(&self, payload: &T) -> Result<(), FeedError> {
        self.handle().send(payload)
    }

    /// Send a text frame if currently connected; see [`FeedHandle::send_text`].
    pub fn send_text(&self, text: impl Into<String>) {
        self.handle().send_text(text);
    }

    /// Deliberately close the connection.
    ///
    /// Cancels any pending reconnect, closes the transport if open and
    /// leaves the client disconnected for good. Idempotent; dropping the
    /// connection has the same effect.
    pub fn close(&self) {
        log_info!("feed {} close requested", self.url);
        self.state.set(ConnectionState::Disconnected);
        let _ = self.shutdown.send(true);
    }
}

impl Drop for FeedConnection {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Connection management loop. Owns the transport, the outbound receiver
/// and the retry sleep for the lifetime of the client.
async fn run_connection(
    url: String,
    state: StateCell,
    mut outbound: UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
    callbacks: Callbacks,
    reconnect: ReconnectConfig,
) {
    // Retries since the last successful connection.
    let mut attempt = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }
        if attempt == 0 {
            state.set(ConnectionState::Connecting);
        }

        let connected = tokio::select! {
            res = connect_async(url.as_str()) => res,
            _ = shutdown.changed() => break,
        };

        match connected {
            Ok((stream, _response)) => {
                // Text accepted against a previous connection generation is
                // dropped, not replayed; drain before the connected flag
                // lets new sends through.
                while let Ok(Some(_)) = outbound.try_next() {}

                attempt = 0;
                state.set(ConnectionState::Connected);
                log_info!("feed connected to {}", url);
                callbacks.opened();

                let deliberate =
                    drive_connection(stream, &url, &mut outbound, &mut shutdown, &callbacks).await;

                state.set(ConnectionState::Disconnected);
                log_info!("feed to {} closed", url);
                callbacks.closed();
                if deliberate {
                    break;
                }
            }
            Err(err) => {
                // A failed handshake counts as an unexpected closure: the
                // error is surfaced, the close fires, and the retry budget
                // decides what happens next.
                log_error!("feed connect to {} failed: {}", url, err);
                callbacks.error(FeedError::Transport(err.to_string()));
                state.set(ConnectionState::Disconnected);
                callbacks.closed();
            }
        }

        if attempt >= reconnect.max_attempts {
            log_warn!(
                "feed {}: reconnect budget ({}) exhausted, giving up",
                url,
                reconnect.max_attempts
            );
            state.set(ConnectionState::Failed {
                reason: format!("gave up after {} reconnect attempts", reconnect.max_attempts),
            });
            break;
        }
        attempt += 1;
        state.set(ConnectionState::Reconnecting { attempt });
        log_info!(
            "reconnecting to {} in {:?} (attempt {}/{})",
            url,
            reconnect.retry_delay,
            attempt,
            reconnect.max_attempts
        );
        tokio::select! {
            _ = tokio::time::sleep(reconnect.retry_delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    if !matches!(state.get(), ConnectionState::Failed { .. }) {
        state.set(ConnectionState::Disconnected);
    }
}

/// Drive one established connection until it ends.
///
/// Returns `true` when the end was deliberate (shutdown requested or every
/// sender dropped), `false` on an unexpected closure.
async fn drive_connection(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    url: &str,
    outbound: &mut UnboundedReceiver<String>,
    shutdown: &mut watch::Receiver<bool>,
    callbacks: &Callbacks,
) -> bool {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    callbacks.message(Inbound::parse(text.to_string()));
                }
                Some(Ok(Message::Close(_))) => {
                    log_info!("feed {} received close frame", url);
                    return false;
                }
                Some(Ok(Message::Ping(payload))) => {
                    // Pong is handled by tungstenite itself
                    log_debug!("feed {} ping ({} bytes)", url, payload.len());
                }
                Some(Ok(_)) => {
                    // Binary and pong frames are not part of the feed
                }
                Some(Err(err)) => {
                    log_error!("feed {} read error: {}", url, err);
                    callbacks.error(FeedError::Transport(err.to_string()));
                    return false;
                }
                None => return false,
            },
            text = outbound.next() => match text {
                Some(text) => {
                    log_debug!("feed {} sending {} bytes", url, text.len());
                    if let Err(err) = write.send(Message::text(text)).await {
                        log_error!("feed {} send failed: {}", url, err);
                        callbacks.error(FeedError::Transport(err.to_string()));
                        return false;
                    }
                }
                None => return true,
            },
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return true;
            }
        }
    }
}
