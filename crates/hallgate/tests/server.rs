//! Integration tests for the hall server: real WebSocket clients against a
//! server on a random port, with a seeded in-memory hall store.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hallgate::prelude::*;
use hallgate_protocol::{HeartbeatProbe, LoginReply, LoginRequest};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

// =========================================================================
// Helpers
// =========================================================================

const PROJECT: &str = "abu";
const TIMEOUT: Duration = Duration::from_secs(5);

type ClientWs =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Joined(UserId),
    Left(UserId),
}

struct TestServer {
    addr: String,
    sessions: HallSessions<Arc<MemoryStore>>,
    store: Arc<MemoryStore>,
    events: mpsc::UnboundedReceiver<Event>,
}

fn identity() -> ServerIdentity {
    ServerIdentity {
        game_id: 1,
        room_level: 2,
        server_id: 3,
    }
}

/// Heartbeats slow enough that they never fire during a test.
fn quiet_config() -> SessionConfig {
    SessionConfig {
        project: PROJECT.into(),
        heartbeat_interval: Duration::from_secs(60),
        ..SessionConfig::default()
    }
}

/// Starts a server on a random port with join/leave recorded.
async fn start_server(config: SessionConfig) -> TestServer {
    let store = Arc::new(MemoryStore::new());
    let server = HallServerBuilder::new()
        .bind("127.0.0.1:0")
        .identity(identity())
        .session_config(config)
        .build(Arc::clone(&store))
        .await
        .expect("server should build");

    let addr = server.local_addr().expect("should have local addr").to_string();
    let sessions = server.sessions().clone();

    let (tx, events) = mpsc::unbounded_channel();
    let joined = tx.clone();
    sessions.register_user_joined(move |id| {
        let _ = joined.send(Event::Joined(id));
    });
    sessions.register_user_left(move |id| {
        let _ = tx.send(Event::Left(id));
    });

    tokio::spawn(async move {
        let _ = server.run().await;
    });

    TestServer {
        addr,
        sessions,
        store,
        events,
    }
}

impl TestServer {
    fn issue(&self, token: &str, user: i64) {
        self.store.issue_token(
            PROJECT,
            token,
            &TokenDescriptor {
                user_id: UserId(user),
                game_id: 1,
                room_level: 2,
                server_id: 3,
            },
        );
    }

    async fn next_event(&mut self) -> Event {
        tokio::time::timeout(TIMEOUT, self.events.recv())
            .await
            .expect("event in time")
            .expect("event channel open")
    }
}

async fn connect(addr: &str) -> ClientWs {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("should connect");
    ws
}

async fn send_frame(ws: &mut ClientWs, frame: &Frame) {
    let text = serde_json::to_string(frame).expect("encode");
    ws.send(Message::Text(text.into())).await.expect("send");
}

/// Next data frame from the server, or `None` once the socket closes.
async fn recv_frame(ws: &mut ClientWs) -> Option<Frame> {
    loop {
        let msg = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("server should answer in time");
        match msg {
            Some(Ok(Message::Text(text))) => {
                return Some(serde_json::from_str(text.as_str()).expect("decode"));
            }
            Some(Ok(Message::Binary(data))) => {
                return Some(serde_json::from_slice(&data).expect("decode"));
            }
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn login(ws: &mut ClientWs, token: &str) -> LoginReply {
    let frame = Frame::with(LoginRequest::MSG_ID, &LoginRequest { token: token.into() })
        .expect("login frame");
    send_frame(ws, &frame).await;
    let reply = recv_frame(ws).await.expect("login reply");
    assert_eq!(reply.msg_id, LoginReply::MSG_ID);
    reply.parse().expect("login reply body")
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition should hold in time");
}

// =========================================================================
// Login
// =========================================================================

#[tokio::test]
async fn test_login_success_acknowledges_and_joins() {
    let mut server = start_server(quiet_config()).await;
    server.issue("t42", 42);
    let mut ws = connect(&server.addr).await;

    match login(&mut ws, "t42").await {
        LoginReply::Accepted {
            user_id,
            reconnect_token,
        } => {
            assert_eq!(user_id, UserId(42));
            assert_eq!(reconnect_token.len(), 32);
        }
        other => panic!("expected acceptance, got {other:?}"),
    }

    assert_eq!(server.next_event().await, Event::Joined(UserId(42)));
    assert!(server.sessions.session(UserId(42)).is_some());
}

#[tokio::test]
async fn test_login_unknown_token_is_rejected_and_socket_stays_open() {
    let mut server = start_server(quiet_config()).await;
    server.issue("good", 7);
    let mut ws = connect(&server.addr).await;

    assert_eq!(login(&mut ws, "bad").await, LoginReply::rejected("token invalid"));
    assert!(server.sessions.registry().is_empty());

    // A retry on the same socket can still succeed.
    assert!(matches!(login(&mut ws, "good").await, LoginReply::Accepted { .. }));
    assert_eq!(server.next_event().await, Event::Joined(UserId(7)));
}

#[tokio::test]
async fn test_login_for_other_server_is_wrong_server() {
    let server = start_server(quiet_config()).await;
    server.store.issue_token(
        PROJECT,
        "elsewhere",
        &TokenDescriptor {
            user_id: UserId(5),
            game_id: 1,
            room_level: 2,
            server_id: 99,
        },
    );
    let mut ws = connect(&server.addr).await;

    assert_eq!(login(&mut ws, "elsewhere").await, LoginReply::rejected("wrong server"));
}

// =========================================================================
// Custom messages
// =========================================================================

#[tokio::test]
async fn test_custom_handler_can_reply_to_sender() {
    let server = start_server(quiet_config()).await;
    server.issue("t", 42);

    let sessions = server.sessions.clone();
    server
        .sessions
        .register_message_handler("echo", move |conn, payload| {
            let sessions = sessions.clone();
            async move {
                if let Some(session) = sessions.session_for(conn) {
                    sessions.send_to_user(session.user_id(), "echo", &payload);
                }
            }
        })
        .unwrap();

    let mut ws = connect(&server.addr).await;
    login(&mut ws, "t").await;

    let mut payload = Payload::new();
    payload.insert("Text".into(), "hello".into());
    send_frame(&mut ws, &Frame::new("echo", payload.clone())).await;

    let reply = recv_frame(&mut ws).await.expect("echo reply");
    assert_eq!(reply, Frame::new("echo", payload));
}

#[tokio::test]
async fn test_burst_past_outbound_capacity_is_refused_not_buffered() {
    let store = Arc::new(MemoryStore::new());
    let server = HallServerBuilder::new()
        .bind("127.0.0.1:0")
        .identity(identity())
        .session_config(quiet_config())
        .outbound_capacity(4)
        .build(Arc::clone(&store))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let sessions = server.sessions().clone();
    store.issue_token(
        PROJECT,
        "t",
        &TokenDescriptor {
            user_id: UserId(42),
            game_id: 1,
            room_level: 2,
            server_id: 3,
        },
    );

    let (sent_tx, mut sent_rx) = mpsc::unbounded_channel();
    let s = sessions.clone();
    sessions
        .register_message_handler("burst", move |_conn, _payload| {
            // No await between sends, so the writer can't drain mid-burst.
            let sent = (0..10)
                .filter(|_| s.send_to_user(UserId(42), "tick", &Payload::new()))
                .count();
            let _ = sent_tx.send(sent);
            async {}
        })
        .unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    let mut ws = connect(&addr).await;
    login(&mut ws, "t").await;
    send_frame(&mut ws, &Frame::new("burst", Payload::new())).await;

    let sent = tokio::time::timeout(TIMEOUT, sent_rx.recv()).await.unwrap().unwrap();
    assert_eq!(sent, 4);
    for _ in 0..4 {
        assert_eq!(recv_frame(&mut ws).await.expect("queued frame").msg_id, "tick");
    }
    assert!(sessions.session(UserId(42)).is_some());
}

#[tokio::test]
async fn test_garbage_frames_are_skipped() {
    let server = start_server(quiet_config()).await;
    server.issue("t", 1);
    let mut ws = connect(&server.addr).await;

    ws.send(Message::Text("not json".into())).await.unwrap();

    assert!(matches!(login(&mut ws, "t").await, LoginReply::Accepted { .. }));
}

// =========================================================================
// Leaving
// =========================================================================

#[tokio::test]
async fn test_client_disconnect_leaves() {
    let mut server = start_server(quiet_config()).await;
    server.issue("t", 42);
    let mut ws = connect(&server.addr).await;
    login(&mut ws, "t").await;
    assert_eq!(server.next_event().await, Event::Joined(UserId(42)));

    ws.close(None).await.unwrap();

    assert_eq!(server.next_event().await, Event::Left(UserId(42)));
    assert!(server.sessions.session(UserId(42)).is_none());
}

#[tokio::test]
async fn test_kick_closes_client_socket() {
    let mut server = start_server(quiet_config()).await;
    server.issue("t", 42);
    let mut ws = connect(&server.addr).await;
    login(&mut ws, "t").await;
    assert_eq!(server.next_event().await, Event::Joined(UserId(42)));

    assert!(server.sessions.kick_user(UserId(42)).await);

    assert!(recv_frame(&mut ws).await.is_none(), "socket should close");
    assert_eq!(server.next_event().await, Event::Left(UserId(42)));
}

#[tokio::test]
async fn test_second_login_closes_first_socket() {
    let mut server = start_server(quiet_config()).await;
    server.issue("t", 42);

    let mut first = connect(&server.addr).await;
    login(&mut first, "t").await;
    let mut second = connect(&server.addr).await;
    login(&mut second, "t").await;

    assert!(recv_frame(&mut first).await.is_none(), "old socket should close");
    assert_eq!(server.next_event().await, Event::Joined(UserId(42)));
    assert_eq!(server.next_event().await, Event::Left(UserId(42)));
    assert_eq!(server.next_event().await, Event::Joined(UserId(42)));
    assert_eq!(server.sessions.registry().len(), 1);
}

// =========================================================================
// Heartbeats
// =========================================================================

#[tokio::test]
async fn test_silent_client_is_probed_then_evicted() {
    let mut server = start_server(SessionConfig {
        project: PROJECT.into(),
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_threshold: 2,
        ..SessionConfig::default()
    })
    .await;
    server.issue("t", 42);
    let mut ws = connect(&server.addr).await;
    login(&mut ws, "t").await;

    let mut indices = Vec::new();
    while let Some(frame) = recv_frame(&mut ws).await {
        assert_eq!(frame.msg_id, HeartbeatProbe::MSG_ID);
        indices.push(frame.parse::<HeartbeatProbe>().unwrap().index);
    }

    assert_eq!(indices, vec![1, 2]);
    assert_eq!(server.next_event().await, Event::Joined(UserId(42)));
    assert_eq!(server.next_event().await, Event::Left(UserId(42)));
}

#[tokio::test]
async fn test_answering_heartbeats_keeps_session() {
    let server = start_server(SessionConfig {
        project: PROJECT.into(),
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_threshold: 2,
        ..SessionConfig::default()
    })
    .await;
    server.issue("t", 42);
    let mut ws = connect(&server.addr).await;
    login(&mut ws, "t").await;

    for _ in 0..8 {
        let probe = recv_frame(&mut ws).await.expect("probe");
        assert_eq!(probe.msg_id, HeartbeatProbe::MSG_ID);
        send_frame(&mut ws, &Frame::new(HeartbeatProbe::MSG_ID, Payload::new())).await;
    }

    assert!(server.sessions.session(UserId(42)).is_some());
}

// =========================================================================
// Shutdown
// =========================================================================

#[tokio::test]
async fn test_run_until_stops_and_drains_queue() {
    let store = Arc::new(MemoryStore::new());
    let server = HallServerBuilder::new()
        .bind("127.0.0.1:0")
        .session_config(quiet_config())
        .build(store)
        .await
        .unwrap();
    let sessions = server.sessions().clone();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let running = tokio::spawn(server.run_until(async {
        let _ = stop_rx.await;
    }));

    let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let r = Arc::clone(&ran);
    sessions
        .invoke(move || r.store(true, std::sync::atomic::Ordering::SeqCst))
        .await
        .unwrap();

    stop_tx.send(()).unwrap();
    let result = tokio::time::timeout(TIMEOUT, running).await.expect("server stops");
    assert!(result.unwrap().is_ok());
    wait_until(|| ran.load(std::sync::atomic::Ordering::SeqCst)).await;
    assert!(sessions.task_queue().is_closed());
}
