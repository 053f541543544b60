//! WebSocket handling

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arbor_protocol::{ClientMessage, ServerMessage, Snapshot, WORKTREES_TOPIC};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::distributor::AppState;
use crate::engine::{EngineEvent, SnapshotEngine};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Messages that can be sent through the WebSocket
enum OutboundMessage {
    /// JSON-serialized ServerMessage
    Json(ServerMessage),
    /// Raw pong response
    Pong(Bytes),
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.engine))
}

/// One connected observer: its declared topics and the last snapshot
/// version it was sent.
struct Connection {
    id: u64,
    engine: Arc<SnapshotEngine>,
    outbound: mpsc::Sender<OutboundMessage>,
    subscribed: AtomicBool,
    /// Held while enqueueing a snapshot so versions leave in order.
    last_sent: Mutex<u64>,
}

impl Connection {
    fn new(engine: Arc<SnapshotEngine>, outbound: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            engine,
            outbound,
            subscribed: AtomicBool::new(false),
            last_sent: Mutex::new(0),
        }
    }

    fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    async fn send(&self, msg: ServerMessage) -> bool {
        self.outbound.send(OutboundMessage::Json(msg)).await.is_ok()
    }

    /// Answer an explicit request with the current snapshot.
    async fn reply_snapshot(&self) -> bool {
        let mut last_sent = self.last_sent.lock().await;
        let snapshot = self.engine.current_snapshot();
        *last_sent = (*last_sent).max(snapshot.version);
        self.send(ServerMessage::snapshot(&snapshot)).await
    }

    /// Push an engine emission unless this connection already has it.
    async fn push_snapshot(&self, snapshot: &Snapshot) -> bool {
        let mut last_sent = self.last_sent.lock().await;
        if snapshot.version <= *last_sent {
            debug!(
                component = "websocket",
                event = "ws.push.stale_dropped",
                connection_id = self.id,
                version = snapshot.version,
                last_sent = *last_sent,
            );
            return true;
        }
        *last_sent = snapshot.version;
        self.send(ServerMessage::snapshot(snapshot)).await
    }

    async fn handle_client_message(&self, msg: ClientMessage) {
        match msg {
            ClientMessage::Hello { subs } => {
                let wants_worktrees = subs.iter().any(|topic| topic == WORKTREES_TOPIC);
                self.subscribed.store(wants_worktrees, Ordering::Release);
                info!(
                    component = "websocket",
                    event = "ws.hello",
                    connection_id = self.id,
                    subs = ?subs,
                );

                let version = self.engine.current_snapshot().version;
                self.send(ServerMessage::Ready {
                    version,
                    ts: unix_millis(),
                })
                .await;
                self.reply_snapshot().await;
            }
            ClientMessage::GetWorktrees => {
                self.reply_snapshot().await;
            }
        }
    }
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, engine: Arc<SnapshotEngine>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Channel for sending messages to this client
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(100);
    let conn = Arc::new(Connection::new(engine.clone(), outbound_tx));
    let conn_id = conn.id;
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        "WebSocket connection opened"
    );

    // Spawn task to forward messages to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    // Subscribe before reading anything so no emission falls between the
    // hello reply and the first push.
    let forwarder = spawn_engine_forwarder(conn.clone(), engine.subscribe());

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = conn.outbound.send(OutboundMessage::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        match serde_json::from_str::<ClientMessage>(&msg) {
            Ok(client_msg) => conn.handle_client_message(client_msg).await,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    connection_id = conn_id,
                    error = %e,
                    payload_bytes = msg.len(),
                    payload_preview = %truncate_for_log(&msg, 240),
                    "Failed to parse client message"
                );
                conn.send(ServerMessage::Error {
                    code: "parse_error".into(),
                    message: e.to_string(),
                })
                .await;
            }
        }
    }

    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        "WebSocket connection closed"
    );
    forwarder.abort();
    send_task.abort();
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Drain engine events into one connection. Exits when the client goes
/// away or the engine is dropped. A lagged connection gets the current
/// snapshot instead of the emissions it missed.
fn spawn_engine_forwarder(
    conn: Arc<Connection>,
    mut rx: broadcast::Receiver<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let delivered = match rx.recv().await {
                Ok(EngineEvent::Snapshot(snapshot)) => {
                    !conn.is_subscribed() || conn.push_snapshot(&snapshot).await
                }
                Ok(EngineEvent::Error(message)) => {
                    !conn.is_subscribed()
                        || conn
                            .send(ServerMessage::Error {
                                code: "refresh_failed".into(),
                                message,
                            })
                            .await
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        component = "websocket",
                        event = "ws.broadcast.lagged",
                        connection_id = conn.id,
                        skipped = n,
                        "Broadcast subscriber lagged, sending current snapshot"
                    );
                    !conn.is_subscribed() || conn.reply_snapshot().await
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if !delivered {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::testing::{FakeInspector, FakeMultiplexer, FakeReviewClient};
    use std::path::Path;
    use std::time::Duration;
    use tokio::time::timeout;

    fn engine() -> (Arc<FakeInspector>, Arc<SnapshotEngine>) {
        let inspector = Arc::new(FakeInspector::default());
        inspector.add_worktree("p1", "f1", Path::new("/wt/p1/f1"), "f1", 10);
        let engine = Arc::new(SnapshotEngine::new(
            inspector.clone(),
            Arc::new(FakeMultiplexer::default()),
            Arc::new(FakeReviewClient::default()),
            EngineConfig::default(),
        ));
        (inspector, engine)
    }

    fn connection(engine: Arc<SnapshotEngine>) -> (Arc<Connection>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(32);
        (Arc::new(Connection::new(engine, tx)), rx)
    }

    async fn next_json(rx: &mut mpsc::Receiver<OutboundMessage>) -> ServerMessage {
        match timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(OutboundMessage::Json(msg))) => msg,
            Ok(Some(OutboundMessage::Pong(_))) => panic!("unexpected pong"),
            Ok(None) => panic!("outbound closed"),
            Err(_) => panic!("timed out waiting for message"),
        }
    }

    fn version_of(msg: &ServerMessage) -> u64 {
        match msg {
            ServerMessage::WorktreesSnapshot { version, .. } => *version,
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hello_replies_ready_then_snapshot() {
        let (_inspector, engine) = engine();
        engine.refresh().await.expect("refresh");
        let (conn, mut rx) = connection(engine.clone());

        conn.handle_client_message(ClientMessage::hello([WORKTREES_TOPIC]))
            .await;

        match next_json(&mut rx).await {
            ServerMessage::Ready { version, ts } => {
                assert_eq!(version, engine.current_snapshot().version);
                assert!(ts > 0);
            }
            other => panic!("expected ready, got {other:?}"),
        }
        match next_json(&mut rx).await {
            ServerMessage::WorktreesSnapshot { items, .. } => assert_eq!(items.len(), 1),
            other => panic!("expected snapshot, got {other:?}"),
        }
        assert!(conn.is_subscribed());
    }

    #[tokio::test]
    async fn get_worktrees_does_not_subscribe() {
        let (_inspector, engine) = engine();
        let (conn, mut rx) = connection(engine);

        conn.handle_client_message(ClientMessage::GetWorktrees).await;
        assert_eq!(version_of(&next_json(&mut rx).await), 0);
        assert!(!conn.is_subscribed());
    }

    #[tokio::test]
    async fn pushes_never_go_backwards() {
        let (_inspector, engine) = engine();
        let (conn, mut rx) = connection(engine);

        let snapshot = |version| Snapshot {
            version,
            items: Vec::new(),
        };
        conn.push_snapshot(&snapshot(3)).await;
        conn.push_snapshot(&snapshot(2)).await;
        conn.push_snapshot(&snapshot(3)).await;
        conn.push_snapshot(&snapshot(4)).await;

        assert_eq!(version_of(&next_json(&mut rx).await), 3);
        assert_eq!(version_of(&next_json(&mut rx).await), 4);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forwarder_delivers_engine_changes_to_subscribers() {
        let (inspector, engine) = engine();
        let (conn, mut rx) = connection(engine.clone());
        conn.handle_client_message(ClientMessage::hello([WORKTREES_TOPIC]))
            .await;
        next_json(&mut rx).await; // ready
        assert_eq!(version_of(&next_json(&mut rx).await), 0);

        let forwarder = spawn_engine_forwarder(conn.clone(), engine.subscribe());
        engine.refresh().await.expect("refresh");

        let mut last = 0;
        while last < engine.current_snapshot().version {
            let version = version_of(&next_json(&mut rx).await);
            assert!(version > last);
            last = version;
        }

        inspector.fail_discovery(true);
        let _ = engine.refresh().await;
        match next_json(&mut rx).await {
            ServerMessage::Error { code, .. } => assert_eq!(code, "refresh_failed"),
            other => panic!("expected error, got {other:?}"),
        }
        forwarder.abort();
    }

    #[tokio::test]
    async fn unsubscribed_connection_gets_no_pushes() {
        let (_inspector, engine) = engine();
        let (conn, mut rx) = connection(engine.clone());
        conn.handle_client_message(ClientMessage::hello(Vec::<String>::new()))
            .await;
        next_json(&mut rx).await; // ready
        next_json(&mut rx).await; // snapshot

        let forwarder = spawn_engine_forwarder(conn.clone(), engine.subscribe());
        engine.refresh().await.expect("refresh");
        tokio::task::yield_now().await;
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
        forwarder.abort();
    }

    #[tokio::test]
    async fn lagged_subscriber_receives_current_snapshot() {
        let (_inspector, engine) = engine();
        engine.refresh().await.expect("refresh");
        let current = engine.current_snapshot().version;

        let (conn, mut rx) = connection(engine.clone());
        conn.subscribed.store(true, Ordering::Release);

        let (tx, events) = broadcast::channel(1);
        for _ in 0..3 {
            let _ = tx.send(EngineEvent::Snapshot(Arc::new(Snapshot {
                version: 1,
                items: Vec::new(),
            })));
        }
        let forwarder = spawn_engine_forwarder(conn, events);

        // Lagged first: the current snapshot, then the retained event is
        // dropped as already covered.
        assert_eq!(version_of(&next_json(&mut rx).await), current);
        drop(tx);
        forwarder.await.expect("forwarder exits when the channel closes");
        assert!(rx.try_recv().is_err());
    }
}
