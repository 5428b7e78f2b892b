//! Integration tests for the WebSocket event server.
//!
//! These tests run a real `EventServer` on a loopback port and talk to it
//! with tokio-tungstenite clients, covering replies, readiness gating,
//! close ordering, the `checkHeaders` hook, capacity and shutdown.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use wev_protocol::Args;
use wevd::{
    ClientHandle, CloseInfo, ConnectInfo, Directory, EventServer, HandlerTable,
    HandlerTableBuilder, HandshakeRejection, ServerConfig,
};

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for any single frame
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Time after which a missing reply counts as "no reply"
const SILENCE: Duration = Duration::from_millis(200);

// ============================================================================
// Test Helpers
// ============================================================================

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Test server context; cancels the server when dropped.
struct TestServer {
    addr: SocketAddr,
    directory: Directory,
    cancel_token: CancellationToken,
}

impl TestServer {
    async fn spawn(handlers: HandlerTable) -> Self {
        Self::spawn_with(ServerConfig::default(), handlers).await
    }

    async fn spawn_with(config: ServerConfig, handlers: HandlerTable) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let server = EventServer::new(config, handlers);
        let directory = server.directory();
        let cancel_token = server.cancel_token();

        tokio::spawn(async move {
            let _ = server.run_with_listener(listener).await;
        });

        Self {
            addr,
            directory,
            cancel_token,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}/events", self.addr)
    }

    async fn connect(&self) -> TestClient {
        let (ws, _response) = connect_async(self.url()).await.expect("connect");
        TestClient { ws }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// WebSocket client speaking the `{type, args}` envelope.
struct TestClient {
    ws: Ws,
}

impl TestClient {
    async fn send(&mut self, event: &str, args: Value) {
        self.send_raw(&json!({ "type": event, "args": args }).to_string())
            .await;
    }

    async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::text(text.to_string()))
            .await
            .expect("send frame");
    }

    /// Next text frame, parsed as JSON.
    async fn recv(&mut self) -> Value {
        loop {
            let msg = timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("read frame");
            match msg {
                Message::Text(text) => return serde_json::from_str(text.as_str()).expect("json"),
                Message::Close(frame) => panic!("unexpected close: {frame:?}"),
                _ => continue,
            }
        }
    }

    /// Returns true if no text frame arrives within [`SILENCE`].
    async fn is_silent(&mut self) -> bool {
        match timeout(SILENCE, self.ws.next()).await {
            Err(_) => true,
            Ok(Some(Ok(Message::Text(_)))) => false,
            Ok(_) => true,
        }
    }

    /// Round-trips a ping; proves earlier frames were processed.
    async fn sync(&mut self) {
        self.send("ping", json!([])).await;
        assert_eq!(self.recv().await, json!({"type": "pong", "args": []}));
    }

    /// Waits for the server's close frame.
    async fn recv_close(&mut self) -> Option<CloseFrame> {
        loop {
            let msg = timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for close");
            match msg {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                other => panic!("expected close frame, got {other:?}"),
            }
        }
    }

    /// Sends a close frame and drives the stream until it ends.
    async fn close(mut self, code: CloseCode, reason: &str) {
        self.ws
            .close(Some(CloseFrame {
                code,
                reason: reason.to_string().into(),
            }))
            .await
            .expect("send close");
        while let Ok(Some(_)) = timeout(RECV_TIMEOUT, self.ws.next()).await {}
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn ping(_client: ClientHandle, _args: Args) -> anyhow::Result<Value> {
    Ok(json!(["pong"]))
}

async fn sum(_client: ClientHandle, args: Args) -> anyhow::Result<Value> {
    let (a, b): (i64, i64) = args.deserialize()?;
    Ok(json!(["sumResult", a + b]))
}

async fn whoami(client: ClientHandle, _args: Args) -> anyhow::Result<Value> {
    Ok(json!({"type": "you", "id": client.id().as_str()}))
}

async fn count(_client: ClientHandle, _args: Args) -> anyhow::Result<Value> {
    Ok(json!(42))
}

async fn slow(_client: ClientHandle, _args: Args) -> anyhow::Result<Value> {
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(json!(["slowDone"]))
}

async fn fail(_client: ClientHandle, _args: Args) -> anyhow::Result<Value> {
    anyhow::bail!("handler refused")
}

async fn explode(_client: ClientHandle, _args: Args) -> anyhow::Result<Value> {
    panic!("handler exploded")
}

async fn kick(client: ClientHandle, _args: Args) -> anyhow::Result<Value> {
    client.close_with(4000, "kicked").await?;
    Ok(Value::Null)
}

async fn nick(client: ClientHandle, args: Args) -> anyhow::Result<Value> {
    let (name,): (String,) = args.deserialize()?;
    client.set("nick", json!(name)).await?;
    Ok(Value::Null)
}

async fn who(client: ClientHandle, _args: Args) -> anyhow::Result<Value> {
    let mut nicks: Vec<Value> = client
        .directory()
        .map(|data| data.field("nick").cloned().unwrap_or(Value::Null))
        .await;
    nicks.sort_by_key(|v| v.to_string());
    Ok(json!(["nicks", nicks]))
}

async fn say(client: ClientHandle, args: Args) -> anyhow::Result<Value> {
    let (text,): (String,) = args.deserialize()?;
    let peers = client.directory().map(|data| data.client().clone()).await;
    for peer in peers {
        peer.emit("said", vec![json!(client.id().as_str()), json!(text)])
            .await?;
    }
    Ok(Value::Null)
}

async fn welcome(client: ClientHandle, _info: Arc<ConnectInfo>) -> anyhow::Result<Value> {
    let ids = client.directory().map(|data| data.id().clone()).await;
    let listed = ids.contains(client.id());
    client
        .emit("welcome", vec![json!(listed), json!(ids.len())])
        .await?;
    Ok(Value::Null)
}

async fn slow_welcome(client: ClientHandle, _info: Arc<ConnectInfo>) -> anyhow::Result<Value> {
    tokio::time::sleep(Duration::from_millis(300)).await;
    Ok(json!(["welcome", client.id().as_str()]))
}

async fn stall(_client: ClientHandle, _info: Arc<ConnectInfo>) -> anyhow::Result<Value> {
    tokio::time::sleep(Duration::from_secs(60)).await;
    Ok(Value::Null)
}

/// Polls until the directory lists `expected` ready connections.
async fn wait_for_len(directory: &Directory, expected: usize) {
    timeout(RECV_TIMEOUT, async {
        while directory.len().await != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("directory never reached the expected size");
}

fn base() -> HandlerTableBuilder {
    HandlerTable::builder()
        .on("ping", ping)
        .on("sum", sum)
        .on("whoami", whoami)
        .on("count", count)
        .on("slow", slow)
        .on("fail", fail)
        .on("explode", explode)
        .on("kick", kick)
        .on("nick", nick)
        .on("who", who)
        .on("say", say)
}

async fn basic_server() -> TestServer {
    TestServer::spawn(base().build().unwrap()).await
}

// ============================================================================
// Replies
// ============================================================================

#[tokio::test]
async fn test_array_reply() {
    let server = basic_server().await;
    let mut client = server.connect().await;

    client.send("sum", json!([2, 3])).await;
    assert_eq!(client.recv().await, json!({"type": "sumResult", "args": [5]}));
}

#[tokio::test]
async fn test_object_reply() {
    let server = basic_server().await;
    let mut client = server.connect().await;

    client.send("whoami", json!([])).await;
    let reply = client.recv().await;

    assert_eq!(reply["type"], "you");
    let id = reply["args"]["id"].as_str().unwrap();
    assert_eq!(id.len(), 16);
    assert!(id.chars().all(|c| c.is_ascii_digit()));
}

#[tokio::test]
async fn test_primitive_return_sends_nothing() {
    let server = basic_server().await;
    let mut client = server.connect().await;

    client.send("count", json!([])).await;
    client.sync().await;
    assert!(client.is_silent().await);
}

#[tokio::test]
async fn test_reply_goes_to_caller_only() {
    let server = basic_server().await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    a.send("sum", json!([1, 1])).await;
    assert_eq!(a.recv().await["type"], "sumResult");

    // b's first frame is its own pong, not a's reply
    b.sync().await;
    assert!(b.is_silent().await);
}

#[tokio::test]
async fn test_suspended_handler_does_not_block_reads() {
    let server = basic_server().await;
    let mut client = server.connect().await;

    client.send("slow", json!([])).await;
    client.send("ping", json!([])).await;

    assert_eq!(client.recv().await["type"], "pong");
    assert_eq!(client.recv().await["type"], "slowDone");
}

// ============================================================================
// Silent Drops
// ============================================================================

#[tokio::test]
async fn test_unknown_event_is_ignored() {
    let server = basic_server().await;
    let mut client = server.connect().await;

    client.send("nope", json!([1, 2])).await;
    client.sync().await;
    assert!(client.is_silent().await);
}

#[tokio::test]
async fn test_malformed_frames_are_ignored() {
    let server = basic_server().await;
    let mut client = server.connect().await;

    client.send_raw("not json").await;
    client.send_raw("[1, 2, 3]").await;
    client.send_raw(r#"{"args": [1]}"#).await;
    client.send_raw(r#"{"type": 7}"#).await;

    client.sync().await;
    assert!(client.is_silent().await);
}

#[tokio::test]
async fn test_oversized_frame_is_dropped() {
    let config = ServerConfig {
        max_message_size: 64,
        ..ServerConfig::default()
    };
    let server = TestServer::spawn_with(config, base().build().unwrap()).await;
    let mut client = server.connect().await;

    let padding = "x".repeat(128);
    client.send("sum", json!([1, 2, padding])).await;
    client.sync().await;
    assert!(client.is_silent().await);
}

#[tokio::test]
async fn test_binary_utf8_frame_is_dispatched() {
    let server = basic_server().await;
    let mut client = server.connect().await;

    let frame = json!({"type": "sum", "args": [4, 5]}).to_string();
    client
        .ws
        .send(Message::binary(frame.into_bytes()))
        .await
        .unwrap();
    assert_eq!(client.recv().await, json!({"type": "sumResult", "args": [9]}));
}

#[tokio::test]
async fn test_handler_failure_is_isolated() {
    let server = basic_server().await;
    let mut client = server.connect().await;

    client.send("fail", json!([])).await;
    client.send("explode", json!([])).await;
    client.send("sum", json!(["not", "numbers"])).await;

    client.sync().await;
    client.send("sum", json!([10, 20])).await;
    assert_eq!(client.recv().await["args"], json!([30]));
}

// ============================================================================
// Directory & Readiness
// ============================================================================

#[tokio::test]
async fn test_connection_hook_runs_before_ready() {
    let table = base().on_connection(welcome).build().unwrap();
    let server = TestServer::spawn(table).await;

    let mut a = server.connect().await;
    assert_eq!(a.recv().await, json!({"type": "welcome", "args": [false, 0]}));
    a.sync().await;

    let mut b = server.connect().await;
    assert_eq!(b.recv().await, json!({"type": "welcome", "args": [false, 1]}));
    b.sync().await;

    assert_eq!(server.directory.len().await, 2);
}

#[tokio::test]
async fn test_frames_handled_while_connection_hook_runs() {
    let table = base().on_connection(slow_welcome).build().unwrap();
    let server = TestServer::spawn(table).await;
    let mut client = server.connect().await;

    // The ping overtakes the still-sleeping connection hook
    client.send("ping", json!([])).await;
    assert_eq!(client.recv().await["type"], "pong");
    assert!(server.directory.is_empty().await);

    assert_eq!(client.recv().await["type"], "welcome");
    wait_for_len(&server.directory, 1).await;
}

#[tokio::test]
async fn test_disconnect_during_connection_hook() {
    let (table, mut reports) = close_reporter_with(base().on_connection(stall));
    let server = TestServer::spawn(table).await;

    let client = server.connect().await;
    drop(client);

    // Reported long before the hook would finish
    let (stale, listed, info) = next_report(&mut reports).await;
    assert!(stale);
    assert!(!listed);
    assert_eq!(info.code, 1006);
    assert!(server.directory.is_empty().await);
}

#[tokio::test]
async fn test_fields_visible_through_directory() {
    let server = basic_server().await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    a.send("nick", json!(["alice"])).await;
    b.send("nick", json!(["bob"])).await;
    a.sync().await;
    b.sync().await;

    a.send("who", json!([])).await;
    assert_eq!(
        a.recv().await,
        json!({"type": "nicks", "args": [["alice", "bob"]]})
    );
}

#[tokio::test]
async fn test_broadcast_through_directory() {
    let server = basic_server().await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;
    a.sync().await;
    b.sync().await;

    a.send("say", json!(["hello"])).await;

    for client in [&mut a, &mut b] {
        let frame = client.recv().await;
        assert_eq!(frame["type"], "said");
        assert_eq!(frame["args"][1], "hello");
    }
}

// ============================================================================
// Close Handling
// ============================================================================

/// Close hook that reports (emit was stale, still listed, close info).
fn close_reporter() -> (HandlerTable, mpsc::UnboundedReceiver<(bool, bool, CloseInfo)>) {
    close_reporter_with(base())
}

fn close_reporter_with(
    builder: HandlerTableBuilder,
) -> (HandlerTable, mpsc::UnboundedReceiver<(bool, bool, CloseInfo)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let table = builder
        .on_close(move |client: ClientHandle, info: CloseInfo| {
            let tx = tx.clone();
            async move {
                let stale = match client.emit("late", Vec::new()).await {
                    Err(e) => e.is_stale(),
                    Ok(()) => false,
                };
                let listed = client.directory().get(client.id().clone()).await.is_some();
                let _ = tx.send((stale, listed, info));
                Ok::<Value, anyhow::Error>(Value::Null)
            }
        })
        .build()
        .unwrap();
    (table, rx)
}

async fn next_report(
    rx: &mut mpsc::UnboundedReceiver<(bool, bool, CloseInfo)>,
) -> (bool, bool, CloseInfo) {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("close hook did not run")
        .expect("reporter dropped")
}

#[tokio::test]
async fn test_close_hook_runs_after_unregister() {
    let (table, mut reports) = close_reporter();
    let server = TestServer::spawn(table).await;
    let mut client = server.connect().await;
    client.sync().await;

    client.close(CloseCode::Normal, "bye").await;

    let (stale, listed, info) = next_report(&mut reports).await;
    assert!(stale, "emit on a closed connection must be stale");
    assert!(!listed, "closed connection must not be in the directory");
    assert_eq!(info, CloseInfo::new(1000, "bye"));
    assert!(server.directory.is_empty().await);
}

#[tokio::test]
async fn test_abrupt_disconnect_reports_abnormal_close() {
    let (table, mut reports) = close_reporter();
    let server = TestServer::spawn(table).await;
    let mut client = server.connect().await;
    client.sync().await;

    drop(client);

    let (_, listed, info) = next_report(&mut reports).await;
    assert!(!listed);
    assert_eq!(info.code, 1006);
}

#[tokio::test]
async fn test_server_initiated_close() {
    let (table, mut reports) = close_reporter();
    let server = TestServer::spawn(table).await;
    let mut client = server.connect().await;

    client.send("kick", json!([])).await;
    let frame = client.recv_close().await.expect("close frame");
    assert_eq!(u16::from(frame.code), 4000);
    assert_eq!(frame.reason.as_str(), "kicked");

    while let Ok(Some(_)) = timeout(RECV_TIMEOUT, client.ws.next()).await {}

    let (stale, _, info) = next_report(&mut reports).await;
    assert!(stale);
    assert_eq!(info.code, 4000);
}

#[tokio::test]
async fn test_suspended_handler_emit_after_peer_close_is_stale() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let table = base()
        .on("linger", move |client: ClientHandle, _args: Args| {
            let tx = tx.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                let result = client.emit("late", Vec::new()).await;
                let _ = tx.send(result.map_err(|e| e.is_stale()));
                Ok::<Value, anyhow::Error>(Value::Null)
            }
        })
        .build()
        .unwrap();
    let server = TestServer::spawn(table).await;
    let mut client = server.connect().await;
    client.sync().await;

    client.send("linger", json!([])).await;
    client.close(CloseCode::Normal, "bye").await;

    let result = timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("handler did not finish")
        .expect("reporter dropped");
    assert_eq!(result, Err(true));
    assert!(server.directory.is_empty().await);
}

#[tokio::test]
async fn test_unanswered_server_close_is_bounded() {
    let (table, mut reports) = close_reporter();
    let config = ServerConfig {
        write_timeout_secs: 1,
        ..ServerConfig::default()
    };
    let server = TestServer::spawn_with(config, table).await;
    let mut client = server.connect().await;
    client.sync().await;

    // Never read again, so the close frame goes unanswered
    client.send("kick", json!([])).await;

    let (stale, listed, info) = next_report(&mut reports).await;
    assert!(stale);
    assert!(!listed);
    assert_eq!(info.code, 1006);
    assert!(server.directory.is_empty().await);
    drop(client);
}

// ============================================================================
// Handshake Hook
// ============================================================================

fn token_gate() -> HandlerTable {
    base()
        .check_headers(|info, headers| {
            if info.header("x-token") != Some("secret") {
                return Err(HandshakeRejection::unauthorized("missing token"));
            }
            headers.insert("x-wev-server", HeaderValue::from_static("1"));
            Ok(())
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_check_headers_adds_response_header() {
    let server = TestServer::spawn(token_gate()).await;

    let mut request = server.url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("x-token", HeaderValue::from_static("secret"));

    let (ws, response) = connect_async(request).await.expect("upgrade");
    assert_eq!(
        response.headers().get("x-wev-server").map(|v| v.as_bytes()),
        Some(&b"1"[..])
    );

    let mut client = TestClient { ws };
    client.sync().await;
}

#[tokio::test]
async fn test_check_headers_rejects_upgrade() {
    let server = TestServer::spawn(token_gate()).await;

    match connect_async(server.url()).await {
        Err(WsError::Http(response)) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("upgrade should have been rejected"),
    }
    assert!(server.directory.is_empty().await);
}

// ============================================================================
// Capacity & Shutdown
// ============================================================================

#[tokio::test]
async fn test_registry_full_refuses_connection() {
    let config = ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    };
    let server = TestServer::spawn_with(config, base().build().unwrap()).await;

    let mut first = server.connect().await;
    first.sync().await;

    let mut second = server.connect().await;
    let frame = second.recv_close().await.expect("close frame");
    assert_eq!(u16::from(frame.code), 1013);

    // The admitted connection is unaffected
    first.sync().await;
    assert_eq!(server.directory.len().await, 1);
}

#[tokio::test]
async fn test_shutdown_sends_going_away() {
    let server = basic_server().await;
    let mut client = server.connect().await;
    client.sync().await;

    server.cancel_token.cancel();

    let frame = client.recv_close().await.expect("close frame");
    assert_eq!(u16::from(frame.code), 1001);
}
