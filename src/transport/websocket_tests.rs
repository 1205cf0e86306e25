use crate::client::{BenchConfig, run_bench};
use crate::config::{MalformedPolicy, Settings};
use crate::registry::engine::lock;
use crate::registry::{SessionRegistry, SharedRegistry};
use crate::transport::message::Event;
use crate::transport::websocket::Server;
use crate::utils::error::ServerError;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    registry: SharedRegistry,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    async fn shutdown(mut self) -> Result<(), ServerError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(TIMEOUT, &mut self.handle)
            .await
            .expect("server did not stop in time")
            .expect("server task panicked")
    }
}

async fn setup_server(policy: MalformedPolicy) -> TestServer {
    let mut settings = Settings::default();
    settings.server.host = "127.0.0.1".to_string();
    settings.server.port = 0;
    settings.session.on_malformed = policy;

    let registry = SessionRegistry::shared();
    let server = Server::bind(settings, registry.clone())
        .await
        .expect("Failed to bind");
    let addr = server.local_addr().expect("local addr");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run_until(async {
        let _ = stop_rx.await;
    }));

    TestServer {
        addr,
        registry,
        stop: Some(stop_tx),
        handle,
    }
}

async fn connect(server: &TestServer) -> Client {
    let (ws_stream, _) = connect_async(server.url())
        .await
        .expect("WebSocket handshake failed");
    ws_stream
}

/// Next data frame as `(is_binary, event)`.
async fn recv_event(ws: &mut Client) -> (bool, Event) {
    loop {
        let msg = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for an event")
            .expect("connection ended")
            .expect("read failed");
        match msg {
            WsMessage::Text(text) => return (false, Event::decode(text.as_bytes()).unwrap()),
            WsMessage::Binary(data) => return (true, Event::decode(&data).unwrap()),
            WsMessage::Close(frame) => panic!("Expected an event, got close {frame:?}"),
            _ => continue,
        }
    }
}

async fn send_count(ws: &mut Client, count: u64) {
    ws.send(WsMessage::text(json!({ "c": count }).to_string()))
        .await
        .expect("Failed to send message");
}

/// Waits until the registry has seen `closed` closes and holds no session.
async fn wait_for_closed(registry: &SharedRegistry, closed: u64) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        {
            let registry = lock(registry);
            if registry.total_closed() >= closed && registry.is_empty() {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "sessions did not close in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_greeting_is_first_message() {
    let server = setup_server(MalformedPolicy::Drop).await;
    let mut ws = connect(&server).await;

    let before = chrono::Utc::now().timestamp();
    let msg = tokio::time::timeout(TIMEOUT, ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(msg.is_text());

    let raw: serde_json::Value = serde_json::from_slice(&msg.into_data()).unwrap();
    let object = raw.as_object().expect("greeting is an object");
    assert_eq!(object.len(), 2);
    assert_eq!(raw["c"], 0);
    let ts = raw["ts"].as_i64().expect("integer timestamp");
    assert!((ts - before).abs() <= 2, "timestamp {ts} too far from {before}");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_replies_preserve_order() {
    let server = setup_server(MalformedPolicy::Drop).await;
    let mut ws = connect(&server).await;
    recv_event(&mut ws).await;

    let counts: Vec<u64> = (0..50).map(|i| (i * 7) % 13).collect();
    for &c in &counts {
        send_count(&mut ws, c).await;
    }

    let mut last_ts = i64::MIN;
    for &expected in &counts {
        let (binary, event) = recv_event(&mut ws).await;
        assert!(!binary);
        assert_eq!(event.count, expected);
        assert!(event.timestamp >= last_ts);
        last_ts = event.timestamp;
    }

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_binary_and_text_framing_is_preserved() {
    let server = setup_server(MalformedPolicy::Drop).await;
    let mut ws = connect(&server).await;
    recv_event(&mut ws).await;

    ws.send(WsMessage::binary(br#"{"c":21,"ts":0}"#.to_vec()))
        .await
        .unwrap();
    let (binary, event) = recv_event(&mut ws).await;
    assert!(binary);
    assert_eq!(event.count, 21);

    send_count(&mut ws, 22).await;
    let (binary, event) = recv_event(&mut ws).await;
    assert!(!binary);
    assert_eq!(event.count, 22);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_payload_does_not_affect_other_connections() {
    let server = setup_server(MalformedPolicy::Drop).await;
    let mut corrupt = connect(&server).await;
    let mut healthy = connect(&server).await;
    recv_event(&mut corrupt).await;
    recv_event(&mut healthy).await;

    corrupt
        .send(WsMessage::text("definitely not json"))
        .await
        .unwrap();
    corrupt
        .send(WsMessage::binary(vec![0xff, 0x00, 0x13]))
        .await
        .unwrap();
    corrupt
        .send(WsMessage::text(r#"{"ts": 5}"#))
        .await
        .unwrap();

    send_count(&mut healthy, 7).await;
    assert_eq!(recv_event(&mut healthy).await.1.count, 7);

    // Malformed messages were dropped without a reply; the next valid one
    // is answered on the same connection.
    send_count(&mut corrupt, 8).await;
    assert_eq!(recv_event(&mut corrupt).await.1.count, 8);

    let mut late = connect(&server).await;
    assert_eq!(recv_event(&mut late).await.1.count, 0);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_close_policy_closes_only_the_offending_session() {
    let server = setup_server(MalformedPolicy::Close).await;
    let mut corrupt = connect(&server).await;
    let mut healthy = connect(&server).await;
    recv_event(&mut corrupt).await;
    recv_event(&mut healthy).await;

    corrupt.send(WsMessage::text("{")).await.unwrap();

    let close = tokio::time::timeout(TIMEOUT, corrupt.next())
        .await
        .unwrap()
        .expect("close frame")
        .expect("read failed");
    match close {
        WsMessage::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Invalid),
        other => panic!("Expected close frame, got {other:?}"),
    }

    send_count(&mut healthy, 3).await;
    assert_eq!(recv_event(&mut healthy).await.1.count, 3);

    {
        let registry = lock(&server.registry);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.total_closed(), 1);
    }

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_connections() {
    let server = setup_server(MalformedPolicy::Drop).await;

    let config = BenchConfig {
        url: server.url(),
        connections: 50,
        messages: 20,
    };
    let report = run_bench(&config).await.expect("benchmark failed");

    assert_eq!(report.connections, 50);
    assert_eq!(report.greetings, 50);
    assert_eq!(report.replies, 50 * 20);
    assert!(report.min_rtt <= report.mean_rtt && report.mean_rtt <= report.max_rtt);

    wait_for_closed(&server.registry, 50).await;
    assert_eq!(lock(&server.registry).total_opened(), 50);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_pipelined_connections_keep_their_own_order() {
    let server = setup_server(MalformedPolicy::Drop).await;

    let mut tasks = Vec::new();
    for conn in 0..10u64 {
        let url = server.url();
        tasks.push(tokio::spawn(async move {
            let (mut ws, _) = connect_async(url).await.unwrap();
            assert_eq!(recv_event(&mut ws).await.1.count, 0);

            let counts: Vec<u64> = (1..=30).map(|i| conn * 1000 + i).collect();
            for &c in &counts {
                send_count(&mut ws, c).await;
            }
            for &c in &counts {
                assert_eq!(recv_event(&mut ws).await.1.count, c);
            }
            ws.close(None).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.expect("connection task failed");
    }

    wait_for_closed(&server.registry, 10).await;
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_clean_close_removes_session_once() {
    let server = setup_server(MalformedPolicy::Drop).await;
    let mut ws = connect(&server).await;
    recv_event(&mut ws).await;
    assert_eq!(lock(&server.registry).len(), 1);

    ws.close(None).await.expect("Failed to close WebSocket");
    while let Ok(Some(_)) = tokio::time::timeout(TIMEOUT, ws.next()).await {}

    wait_for_closed(&server.registry, 1).await;
    {
        let registry = lock(&server.registry);
        assert_eq!(registry.total_opened(), 1);
        assert_eq!(registry.total_closed(), 1);
    }

    // Attempt to send another message and assert that it fails
    let res = ws.send(WsMessage::text("should not send")).await;
    assert!(res.is_err());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_abrupt_disconnect_removes_session_once() {
    let server = setup_server(MalformedPolicy::Drop).await;
    let mut ws = connect(&server).await;
    recv_event(&mut ws).await;
    send_count(&mut ws, 1).await;
    recv_event(&mut ws).await;

    // Dropping the stream closes the socket without a closing handshake.
    drop(ws);

    wait_for_closed(&server.registry, 1).await;
    {
        let registry = lock(&server.registry);
        assert_eq!(registry.total_opened(), 1);
        assert_eq!(registry.total_closed(), 1);
    }

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_handshake_creates_no_session() {
    let server = setup_server(MalformedPolicy::Drop).await;

    let mut raw = TcpStream::connect(server.addr).await.unwrap();
    raw.write_all(b"GET / HTTP/1.1\r\nHost: nowhere\r\n\r\n")
        .await
        .unwrap();
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(TIMEOUT, raw.read_to_end(&mut buf)).await;

    let mut ws = connect(&server).await;
    assert_eq!(recv_event(&mut ws).await.1.count, 0);

    {
        let registry = lock(&server.registry);
        assert_eq!(registry.total_opened(), 1);
        assert_eq!(registry.len(), 1);
    }

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_all_sessions() {
    let server = setup_server(MalformedPolicy::Drop).await;
    let addr = server.addr;
    let registry = server.registry.clone();

    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut ws = connect(&server).await;
        recv_event(&mut ws).await;
        clients.push(ws);
    }
    assert_eq!(lock(&registry).len(), 3);

    server.shutdown().await.expect("server failed");

    for ws in &mut clients {
        let msg = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .unwrap()
            .expect("close frame")
            .expect("read failed");
        match msg {
            WsMessage::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
            other => panic!("Expected close frame, got {other:?}"),
        }
    }

    let registry = lock(&registry);
    assert!(registry.is_empty());
    assert_eq!(registry.total_opened(), 3);
    assert_eq!(registry.total_closed(), 3);

    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let server = setup_server(MalformedPolicy::Drop).await;

    let mut settings = Settings::default();
    settings.server.host = "127.0.0.1".to_string();
    settings.server.port = server.addr.port();

    let result = Server::bind(settings, SessionRegistry::shared()).await;
    assert!(matches!(result, Err(ServerError::Bind { .. })));

    server.shutdown().await.unwrap();
}
