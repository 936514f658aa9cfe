//! End-to-end behavior of the feed connection against in-process servers.

#![cfg(not(target_arch = "wasm32"))]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task;
use tokio::time::sleep;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use volterm_feed::{
    ConnectionState, FeedConnection, FeedError, FeedOptions, Inbound, Origin, ReconnectConfig,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Counts lifecycle callbacks and collects inbound frames.
#[derive(Default)]
struct Recorder {
    opens: AtomicUsize,
    closes: AtomicUsize,
    errors: AtomicUsize,
    messages: Mutex<Vec<Inbound>>,
}

impl Recorder {
    fn opens(&self) -> usize {
        self.opens.load(SeqCst)
    }

    fn closes(&self) -> usize {
        self.closes.load(SeqCst)
    }

    fn errors(&self) -> usize {
        self.errors.load(SeqCst)
    }
}

fn wired(recorder: &Arc<Recorder>, options: FeedOptions) -> FeedOptions {
    let r = recorder.clone();
    let options = options.on_open(move || {
        r.opens.fetch_add(1, SeqCst);
    });
    let r = recorder.clone();
    let options = options.on_close(move || {
        r.closes.fetch_add(1, SeqCst);
    });
    let r = recorder.clone();
    let options = options.on_error(move |_| {
        r.errors.fetch_add(1, SeqCst);
    });
    let r = recorder.clone();
    options.on_message(move |msg| r.messages.lock().unwrap().push(msg))
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn quick_reconnect(max_attempts: u32) -> ReconnectConfig {
    ReconnectConfig {
        max_attempts,
        retry_delay: Duration::from_millis(100),
    }
}

#[tokio::test]
async fn delivers_frames_in_order_with_raw_fallback() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = task::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.send(Message::text(r#"{"surface":"btc","tenor":"7d"}"#))
            .await
            .unwrap();
        ws.send(Message::text("feed warming up")).await.unwrap();
        ws.send(Message::text("17")).await.unwrap();
        // Hold the connection open until the client goes away
        while ws.next().await.is_some() {}
    });

    let recorder = Arc::new(Recorder::default());
    let origin = Origin::new(false, format!("127.0.0.1:{port}"));
    let feed = FeedConnection::open(
        "/live",
        wired(&recorder, FeedOptions::new().origin(origin)),
    )
    .unwrap();
    assert_eq!(feed.url(), format!("ws://127.0.0.1:{port}/live"));

    wait_until("three frames", || {
        recorder.messages.lock().unwrap().len() >= 3
    })
    .await;
    assert_eq!(recorder.opens(), 1);
    let messages = recorder.messages.lock().unwrap().clone();
    assert_eq!(
        messages[0],
        Inbound::Parsed(json!({"surface": "btc", "tenor": "7d"}))
    );
    assert_eq!(messages[1], Inbound::Raw("feed warming up".to_string()));
    assert_eq!(messages[2], Inbound::Parsed(json!(17)));
    assert!(feed.is_connected());

    feed.close();
    wait_until("disconnect", || !feed.is_connected()).await;
    server.abort();
}

#[tokio::test]
async fn send_while_disconnected_is_dropped_not_queued() {
    init_tracing();
    // Bind then drop: nothing listens on this port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let recorder = Arc::new(Recorder::default());
    let feed = FeedConnection::open(
        &format!("ws://127.0.0.1:{port}/live"),
        wired(&recorder, FeedOptions::new().reconnect(quick_reconnect(0))),
    )
    .unwrap();

    wait_until("terminal state", || {
        matches!(feed.state(), ConnectionState::Failed { .. })
    })
    .await;
    assert!(!feed.is_connected());
    assert_eq!(recorder.opens(), 0);

    // Rejected locally: no panic, nothing queued, still Ok
    feed.send(&json!({"subscribe": "vol-surface"})).unwrap();
    feed.send_text("ping");

    // Serialization failure is the one send error that propagates
    let mut unserializable = HashMap::new();
    unserializable.insert(vec![1u8, 2], "x");
    let err = feed.send(&unserializable).unwrap_err();
    assert!(matches!(err, FeedError::Serialize(_)));
}

#[tokio::test]
async fn reconnect_budget_is_exhausted_after_consecutive_failures() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // One successful connection, closed straight away, then the port goes dead
    let server = task::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _ = ws.close(None).await;
        drop(listener);
    });

    let recorder = Arc::new(Recorder::default());
    let feed = FeedConnection::open(
        &format!("ws://127.0.0.1:{port}/live"),
        wired(&recorder, FeedOptions::new().reconnect(quick_reconnect(2))),
    )
    .unwrap();

    // Initial closure plus one closure per failed attempt
    wait_until("three closes", || recorder.closes() >= 3).await;
    wait_until("terminal state", || {
        matches!(feed.state(), ConnectionState::Failed { .. })
    })
    .await;

    // No pending timer remains once the budget is spent
    sleep(Duration::from_millis(350)).await;
    assert_eq!(recorder.opens(), 1);
    assert_eq!(recorder.closes(), 3);
    assert_eq!(recorder.errors(), 2);
    assert!(!feed.is_connected());
    server.abort();
}

#[tokio::test]
async fn successful_connection_resets_the_reconnect_budget() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = task::spawn(async move {
        // Three accept-then-close cycles, then hold the fourth open
        for _ in 0..3 {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = ws.close(None).await;
        }
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while ws.next().await.is_some() {}
    });

    let recorder = Arc::new(Recorder::default());
    let feed = FeedConnection::open(
        &format!("ws://127.0.0.1:{port}/live"),
        wired(
            &recorder,
            FeedOptions::new().reconnect(ReconnectConfig {
                max_attempts: 1,
                retry_delay: Duration::from_millis(50),
            }),
        ),
    )
    .unwrap();

    // With a budget of one, only the reset on each successful connection
    // lets the client come back this many times
    wait_until("fourth connection", || recorder.opens() >= 4).await;
    wait_until("settled", || feed.is_connected()).await;

    feed.close();
    server.abort();
}

#[tokio::test]
async fn close_cancels_a_pending_retry() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let accepts = Arc::new(AtomicUsize::new(0));
    let server_accepts = accepts.clone();
    let server = task::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            server_accepts.fetch_add(1, SeqCst);
            let mut ws = accept_async(stream).await.unwrap();
            let _ = ws.close(None).await;
        }
    });

    let recorder = Arc::new(Recorder::default());
    let feed = FeedConnection::open(
        &format!("ws://127.0.0.1:{port}/live"),
        wired(
            &recorder,
            FeedOptions::new().reconnect(ReconnectConfig {
                max_attempts: 3,
                retry_delay: Duration::from_millis(500),
            }),
        ),
    )
    .unwrap();

    // Close while the retry delay is pending
    wait_until("first close", || recorder.closes() >= 1).await;
    wait_until("retry pending", || {
        matches!(feed.state(), ConnectionState::Reconnecting { .. })
    })
    .await;
    assert!(feed.state().is_connecting());
    feed.close();

    sleep(Duration::from_millis(800)).await;
    assert_eq!(accepts.load(SeqCst), 1);
    assert!(!feed.is_connected());
    server.abort();
}

#[tokio::test]
async fn close_while_connected_is_terminal() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let accepts = Arc::new(AtomicUsize::new(0));
    let server_accepts = accepts.clone();
    let server = task::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            server_accepts.fetch_add(1, SeqCst);
            let mut ws = accept_async(stream).await.unwrap();
            while ws.next().await.is_some() {}
        }
    });

    let recorder = Arc::new(Recorder::default());
    let feed = FeedConnection::open(
        &format!("ws://127.0.0.1:{port}/live"),
        wired(&recorder, FeedOptions::new().reconnect(quick_reconnect(3))),
    )
    .unwrap();

    wait_until("connected", || feed.is_connected()).await;
    feed.close();
    wait_until("disconnected", || !feed.is_connected()).await;

    sleep(Duration::from_millis(300)).await;
    assert_eq!(accepts.load(SeqCst), 1);
    assert_eq!(recorder.opens(), 1);
    assert_eq!(recorder.closes(), 1);
    server.abort();
}

#[tokio::test]
async fn dropping_the_connection_tears_it_down() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let accepts = Arc::new(AtomicUsize::new(0));
    let server_accepts = accepts.clone();
    let server = task::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            server_accepts.fetch_add(1, SeqCst);
            let mut ws = accept_async(stream).await.unwrap();
            while ws.next().await.is_some() {}
        }
    });

    let recorder = Arc::new(Recorder::default());
    let feed = FeedConnection::open(
        &format!("ws://127.0.0.1:{port}/live"),
        wired(&recorder, FeedOptions::new().reconnect(quick_reconnect(3))),
    )
    .unwrap();

    wait_until("connected", || feed.is_connected()).await;
    drop(feed);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(accepts.load(SeqCst), 1);
    server.abort();
}
