//! Browser feed connection using `web_sys::WebSocket`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{select, FutureExt, StreamExt};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::spawn_local;
use web_sys::{js_sys, CloseEvent, ErrorEvent, MessageEvent, WebSocket};

use super::{Callbacks, ConnectionState, FeedHandle, FeedOptions, ReconnectConfig, StateCell};
use crate::error::FeedError;
use crate::feed::address::{resolve_address, Origin};
use crate::feed::message::Inbound;
use crate::{log_error, log_info, log_warn};

/// A self-healing connection to one live-data feed (browser implementation).
pub struct FeedConnection {
    url: String,
    state: StateCell,
    outbound: UnboundedSender<String>,
    shutdown: UnboundedSender<()>,
    closed: Rc<Cell<bool>>,
}

impl FeedConnection {
    /// Resolve `address` and start connecting in the background.
    ///
    /// Relative addresses resolve against `options.origin`, falling back to
    /// the page's own origin. Returns immediately; establishment is observed
    /// through [`state`](Self::state) and the `on_open` callback. An address
    /// that cannot be resolved fails here and nothing is retried.
    pub fn open(address: &str, options: FeedOptions) -> Result<Self, FeedError> {
        let FeedOptions {
            origin,
            reconnect,
            callbacks,
        } = options;
        let origin = origin.or_else(Origin::from_page);
        let url = resolve_address(address, origin.as_ref())?;

        let (outbound_tx, outbound_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = unbounded();
        let state = StateCell::default();
        let closed = Rc::new(Cell::new(false));

        spawn_local(run_connection(
            url.clone(),
            state.clone(),
            outbound_rx,
            shutdown_rx,
            closed.clone(),
            callbacks,
            reconnect,
        ));

        Ok(Self {
            url,
            state,
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            closed,
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
        self.closed.set(true);
        self.state.set(ConnectionState::Disconnected);
        let _ = self.shutdown.unbounded_send(());
    }
}

impl Drop for FeedConnection {
    fn drop(&mut self) {
        self.closed.set(true);
        let _ = self.shutdown.unbounded_send(());
    }
}

/// Handshake outcome for one connection attempt.
enum ConnectError {
    /// The socket could not even be created; never retried.
    Construct(String),
    /// The socket was created but the handshake did not complete; treated
    /// as an unexpected closure.
    Handshake(String),
}

/// Connection management loop. Owns the transport and the retry timer for
/// the lifetime of the client.
async fn run_connection(
    url: String,
    state: StateCell,
    outbound: UnboundedReceiver<String>,
    mut shutdown: UnboundedReceiver<()>,
    closed: Rc<Cell<bool>>,
    callbacks: Callbacks,
    reconnect: ReconnectConfig,
) {
    // The socket the send task writes to; swapped on every reconnect.
    let current = Rc::new(RefCell::new(None::<WebSocket>));
    spawn_send_task(current.clone(), outbound, url.clone());

    // Retries since the last successful connection.
    let mut attempt = 0u32;

    loop {
        if closed.get() {
            break;
        }
        if attempt == 0 {
            state.set(ConnectionState::Connecting);
        }

        match connect_socket(&url, &callbacks, &closed, &state, &current).await {
            Ok(ws) => {
                attempt = 0;
                log_info!("feed connected to {}", url);

                // Signal fired by the socket's close event
                let (close_tx, mut close_rx) = unbounded::<()>();
                let onclose = Closure::wrap(Box::new(move |_: CloseEvent| {
                    let _ = close_tx.unbounded_send(());
                }) as Box<dyn FnMut(CloseEvent)>);
                ws.set_onclose(Some(onclose.as_ref().unchecked_ref()));
                onclose.forget();

                // Wait for the connection to end, one way or the other. A
                // socket that closed before this handler was wired never
                // fires it, so check readyState first (2 = CLOSING).
                let deliberate = if ws.ready_state() >= 2 {
                    false
                } else {
                    select! {
                        _ = close_rx.next() => false,
                        _ = shutdown.next() => {
                            let _ = ws.close();
                            true
                        }
                    }
                };

                *current.borrow_mut() = None;
                state.set(ConnectionState::Disconnected);
                log_info!("feed to {} closed", url);
                callbacks.closed();
                if deliberate {
                    break;
                }
            }
            Err(ConnectError::Construct(reason)) => {
                log_error!("feed {} could not create socket: {}", url, reason);
                state.set(ConnectionState::Disconnected);
                break;
            }
            Err(ConnectError::Handshake(reason)) => {
                if closed.get() {
                    break;
                }
                // A failed handshake counts as an unexpected closure: the
                // error is surfaced, the close fires, and the retry budget
                // decides what happens next.
                log_error!("feed connect to {} failed: {}", url, reason);
                callbacks.error(FeedError::Transport(reason));
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
        let delay_ms = reconnect.retry_delay.as_millis() as u32;
        select! {
            _ = gloo_timers::future::TimeoutFuture::new(delay_ms).fuse() => {}
            _ = shutdown.next() => break,
        }
    }

    if !matches!(state.get(), ConnectionState::Failed { .. }) {
        state.set(ConnectionState::Disconnected);
    }
}

/// Single writer task for the lifetime of the client.
///
/// Text sent against a socket that is gone (or not yet open again) is
/// dropped with a warning, never held for a later generation.
fn spawn_send_task(
    current: Rc<RefCell<Option<WebSocket>>>,
    mut outbound: UnboundedReceiver<String>,
    url: String,
) {
    spawn_local(async move {
        while let Some(text) = outbound.next().await {
            let ws = current.borrow().clone();
            match ws {
                // readyState 1 = OPEN
                Some(ws) if ws.ready_state() == 1 => {
                    if let Err(err) = ws.send_with_str(&text) {
                        log_error!("feed {} send failed: {:?}", url, err);
                    }
                }
                _ => {
                    log_warn!("feed {} not open, dropping outbound payload", url);
                }
            }
        }
        log_info!("feed {} handles dropped, stopping send task", url);
    });
}

/// Create a socket, wire its event handlers and wait for the handshake.
async fn connect_socket(
    url: &str,
    callbacks: &Callbacks,
    closed: &Rc<Cell<bool>>,
    state: &StateCell,
    current: &Rc<RefCell<Option<WebSocket>>>,
) -> Result<WebSocket, ConnectError> {
    let ws = WebSocket::new(url).map_err(|e| ConnectError::Construct(format!("{e:?}")))?;

    // Hand the socket to the send task before the open event can fire, so a
    // send from inside `on_open` has somewhere to go
    *current.borrow_mut() = Some(ws.clone());

    let is_open = Rc::new(Cell::new(false));
    let fail_reason = Rc::new(RefCell::new(None::<String>));

    // State flips and `on_open` fires from the browser's own open event, so
    // both are ordered before every message of this connection and a send
    // from inside `on_open` passes the connected check
    let is_open_cb = is_open.clone();
    let open_callbacks = callbacks.clone();
    let open_state = state.clone();
    let onopen = Closure::wrap(Box::new(move |_: web_sys::Event| {
        is_open_cb.set(true);
        open_state.set(ConnectionState::Connected);
        open_callbacks.opened();
    }) as Box<dyn FnMut(web_sys::Event)>);
    ws.set_onopen(Some(onopen.as_ref().unchecked_ref()));
    onopen.forget();

    // A close before the open event means the handshake failed
    let fail_close = fail_reason.clone();
    let onclose = Closure::wrap(Box::new(move |e: CloseEvent| {
        let reason = if e.reason().is_empty() {
            format!("close code {}", e.code())
        } else {
            e.reason()
        };
        fail_close.borrow_mut().get_or_insert(reason);
    }) as Box<dyn FnMut(CloseEvent)>);
    ws.set_onclose(Some(onclose.as_ref().unchecked_ref()));
    onclose.forget();

    // Error events are reported but never change connection state; the
    // close event governs that
    let fail_err = fail_reason.clone();
    let is_open_err = is_open.clone();
    let error_callbacks = callbacks.clone();
    let onerror = Closure::wrap(Box::new(move |_: ErrorEvent| {
        if is_open_err.get() {
            error_callbacks.error(FeedError::Transport("websocket error event".to_string()));
        } else {
            fail_err
                .borrow_mut()
                .get_or_insert_with(|| "websocket error event".to_string());
        }
    }) as Box<dyn FnMut(ErrorEvent)>);
    ws.set_onerror(Some(onerror.as_ref().unchecked_ref()));
    onerror.forget();

    let message_callbacks = callbacks.clone();
    let onmessage = Closure::wrap(Box::new(move |e: MessageEvent| {
        if let Ok(text) = e.data().dyn_into::<js_sys::JsString>() {
            let text: String = text.into();
            message_callbacks.message(Inbound::parse(text));
        }
    }) as Box<dyn FnMut(MessageEvent)>);
    ws.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));
    onmessage.forget();

    // Wait for the handshake to settle (10ms polls, 5s budget)
    for _ in 0..500 {
        if closed.get() {
            *current.borrow_mut() = None;
            let _ = ws.close();
            return Err(ConnectError::Handshake("closed during handshake".to_string()));
        }
        if is_open.get() {
            return Ok(ws);
        }
        if let Some(reason) = fail_reason.borrow().clone() {
            *current.borrow_mut() = None;
            return Err(ConnectError::Handshake(reason));
        }
        gloo_timers::future::TimeoutFuture::new(10).await;
    }

    *current.borrow_mut() = None;
    let _ = ws.close();
    Err(ConnectError::Handshake("handshake timeout".to_string()))
}
