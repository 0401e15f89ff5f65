// tests/integration/server_test.rs

//! Integration tests for the socket layer: endpoints, listeners and the
//! per-connection socket task feeding a live engine.

use super::test_helpers::{TestContext, masked_frame, text_frame, token};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc};
use wsrelay::connection::{ConnectionHandler, ReactorEvent};
use wsrelay::core::state::Outbound;
use wsrelay::server::{AnyListener, AnyStream, Endpoint};

const WAIT: Duration = Duration::from_secs(2);

async fn next_event(events: &mut mpsc::UnboundedReceiver<ReactorEvent>) -> ReactorEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for a socket event")
        .expect("event channel closed")
}

/// Feeds one event into the engine the way the reactor loop does.
fn dispatch(ctx: &mut TestContext, event: ReactorEvent) {
    match event {
        ReactorEvent::Readable { id, data } => ctx.engine.on_readable(id, &data),
        ReactorEvent::Drained { id, flushed } => ctx.engine.on_writable(id, flushed),
        ReactorEvent::Timeout { id } => ctx.engine.on_timeout(id),
        ReactorEvent::Closed { id } => ctx.engine.on_error(id),
        ReactorEvent::Accepted { .. } => panic!("Unexpected accept event"),
    }
}

/// Pumps events into the engine until a drain is reported.
async fn pump_until_drained(
    ctx: &mut TestContext,
    events: &mut mpsc::UnboundedReceiver<ReactorEvent>,
) {
    loop {
        let event = next_event(events).await;
        let drained = matches!(event, ReactorEvent::Drained { .. });
        dispatch(ctx, event);
        if drained {
            return;
        }
    }
}

async fn read_exact(stream: &mut UnixStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("timed out reading from socket")
        .unwrap();
    buf
}

// ===== Endpoint Tests =====

#[test]
fn test_endpoint_parse() {
    assert_eq!(
        Endpoint::parse("tcp://0.0.0.0:8080").unwrap(),
        Endpoint::Tcp("0.0.0.0:8080".to_string())
    );
    assert_eq!(
        Endpoint::parse("127.0.0.1:9000").unwrap(),
        Endpoint::Tcp("127.0.0.1:9000".to_string())
    );
    assert_eq!(
        Endpoint::parse("unix:///tmp/relay.sock").unwrap(),
        Endpoint::Unix("/tmp/relay.sock".into())
    );
    assert!(Endpoint::parse("unix://").is_err());
    assert!(Endpoint::parse("localhost").is_err());
}

#[test]
fn test_endpoint_display_round_trips() {
    for raw in ["tcp://127.0.0.1:8080", "unix:///var/run/relay.sock"] {
        let endpoint = Endpoint::parse(raw).unwrap();
        assert_eq!(endpoint.to_string(), raw);
    }
}

// ===== Listener Tests =====

#[tokio::test]
async fn test_unix_listener_accepts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("control.sock");
    let listener = AnyListener::bind(&Endpoint::Unix(path.clone()))
        .await
        .unwrap();

    let connect = tokio::spawn(async move { UnixStream::connect(path).await.unwrap() });
    let (stream, peer) = listener.accept().await.unwrap();
    let _client = connect.await.unwrap();

    assert_eq!(peer, "unix");
    assert!(matches!(stream, AnyStream::Unix(_)));
}

// ===== Socket Task Tests =====

#[tokio::test]
async fn test_socket_task_writes_and_reports_drain() {
    let (server_side, mut client_side) = UnixStream::pair().unwrap();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, _) = broadcast::channel(1);
    let handler = ConnectionHandler::new(
        7,
        AnyStream::Unix(server_side),
        outbound_rx,
        events_tx,
        shutdown_tx.subscribe(),
    );
    let task = tokio::spawn(handler.run());

    outbound_tx
        .send(Outbound::Write(bytes::Bytes::from_static(b"abc")))
        .unwrap();
    outbound_tx
        .send(Outbound::Write(bytes::Bytes::from_static(b"def")))
        .unwrap();

    assert_eq!(read_exact(&mut client_side, 6).await, b"abcdef".to_vec());
    let mut flushed = 0;
    while flushed < 2 {
        match next_event(&mut events_rx).await {
            ReactorEvent::Drained { id, flushed: n } => {
                assert_eq!(id, 7);
                flushed = n;
            }
            ReactorEvent::Timeout { .. } => {}
            _ => panic!("Expected a drain event"),
        }
    }

    client_side.write_all(b"ping").await.unwrap();
    loop {
        match next_event(&mut events_rx).await {
            ReactorEvent::Readable { id, data } => {
                assert_eq!(id, 7);
                assert_eq!(&data[..], b"ping");
                break;
            }
            ReactorEvent::Timeout { .. } => {}
            _ => panic!("Expected a readable event"),
        }
    }

    outbound_tx.send(Outbound::Shutdown).unwrap();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    loop {
        if let ReactorEvent::Closed { id } = next_event(&mut events_rx).await {
            assert_eq!(id, 7);
            break;
        }
    }
}

#[tokio::test]
async fn test_socket_task_stops_on_shutdown_signal() {
    let (server_side, _client_side) = UnixStream::pair().unwrap();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (_outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, _) = broadcast::channel(1);
    let handler = ConnectionHandler::new(
        3,
        AnyStream::Unix(server_side),
        outbound_rx,
        events_tx,
        shutdown_tx.subscribe(),
    );
    let task = tokio::spawn(handler.run());

    shutdown_tx.send(()).unwrap();

    tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    loop {
        if let ReactorEvent::Closed { id } = next_event(&mut events_rx).await {
            assert_eq!(id, 3);
            break;
        }
    }
}

#[tokio::test]
async fn test_client_session_over_socket() {
    let mut ctx = TestContext::new();
    ctx.engine.hooks_mut().echo = true;
    let (server_side, mut client_side) = UnixStream::pair().unwrap();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, _) = broadcast::channel(1);
    let id = ctx
        .engine
        .accept_client(0, "unix".to_string(), outbound_tx);
    let handler = ConnectionHandler::new(
        id,
        AnyStream::Unix(server_side),
        outbound_rx,
        events_tx,
        shutdown_tx.subscribe(),
    );
    let task = tokio::spawn(handler.run());

    // Upgrade.
    let request = ctx.upgrade_request(&token(1));
    client_side.write_all(&request).await.unwrap();
    pump_until_drained(&mut ctx, &mut events_rx).await;
    let mut response = Vec::new();
    while !response.ends_with(b"\r\n\r\n") {
        response.extend(read_exact(&mut client_side, 1).await);
    }
    assert!(response.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));

    // Echo through the hooks.
    client_side
        .write_all(&masked_frame(0x81, b"round trip", [5, 6, 7, 8]))
        .await
        .unwrap();
    pump_until_drained(&mut ctx, &mut events_rx).await;
    let expected = text_frame(b"round trip");
    assert_eq!(read_exact(&mut client_side, expected.len()).await, expected);

    // Peer hangs up.
    drop(client_side);
    while ctx.engine.client_count() > 0 {
        let event = next_event(&mut events_rx).await;
        dispatch(&mut ctx, event);
    }
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(ctx.engine.relation(token(1).as_bytes()), None);
}
