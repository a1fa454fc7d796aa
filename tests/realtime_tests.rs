//! End-to-end fan-out scenarios
//!
//! Sessions run over in-process WebSocket pairs (`tokio::io::duplex`), so
//! every frame goes through the real handler, queue and drain task.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use chat_fanout::{
    handle_connection, run_session, AppError, ChannelId, ChatServer, EventKind, InMemoryMembership,
    InMemoryMessageStore, RealtimeSettings, UserId, USER_ID_HEADER,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

struct TestClient {
    ws: WebSocketStream<DuplexStream>,
}

impl TestClient {
    async fn send(&mut self, frame: Value) {
        self.ws
            .send(Message::Text(frame.to_string().into()))
            .await
            .expect("send failed");
    }

    async fn recv(&mut self) -> Value {
        loop {
            let msg = timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            match msg {
                Message::Text(text) => return serde_json::from_str(&text).expect("invalid JSON"),
                Message::Close(frame) => panic!("Unexpected close: {:?}", frame),
                _ => continue,
            }
        }
    }

    async fn recv_close(&mut self) -> Option<CloseFrame<'static>> {
        loop {
            let msg = timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for close")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Close(frame) = msg {
                return frame.map(CloseFrame::into_owned);
            }
        }
    }

    async fn subscribe(&mut self, channel: &str) -> Value {
        self.send(json!({"action": "subscribe", "channel_id": channel}))
            .await;
        self.recv().await
    }
}

fn settings() -> RealtimeSettings {
    RealtimeSettings {
        drain_timeout_ms: 200,
        ..RealtimeSettings::default()
    }
}

fn server_with(settings: RealtimeSettings) -> (Arc<InMemoryMembership>, Arc<ChatServer>) {
    let membership = Arc::new(InMemoryMembership::new());
    let store = Arc::new(InMemoryMessageStore::new(membership.clone()));
    let server = Arc::new(ChatServer::new(settings, membership.clone(), store));
    (membership, server)
}

async fn connect(
    server: &Arc<ChatServer>,
    user: i64,
) -> (TestClient, JoinHandle<Result<(), AppError>>) {
    connect_with_buffer(server, user, 64 * 1024).await
}

/// `buffer` bounds the bytes in flight, so a client that stops reading
/// blocks the server's writes once it fills
async fn connect_with_buffer(
    server: &Arc<ChatServer>,
    user: i64,
    buffer: usize,
) -> (TestClient, JoinHandle<Result<(), AppError>>) {
    let (server_io, client_io) = tokio::io::duplex(buffer);
    start_session(server, user, server_io, client_io).await
}

async fn start_session<S>(
    server: &Arc<ChatServer>,
    user: i64,
    server_io: S,
    client_io: DuplexStream,
) -> (TestClient, JoinHandle<Result<(), AppError>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    let client_ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

    let session = tokio::spawn(run_session(server_ws, UserId(user), server.clone()));
    let mut client = TestClient { ws: client_ws };

    let hello = client.recv().await;
    assert_eq!(hello["type"], "connected");
    assert_eq!(hello["user_id"], user);
    (client, session)
}

/// Server-side transport whose writes start failing once `broken` is set
struct BreakableLink {
    inner: DuplexStream,
    broken: Arc<AtomicBool>,
}

impl AsyncRead for BreakableLink {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for BreakableLink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.broken.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down")));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.broken.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down")));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[tokio::test]
async fn test_two_subscribers_receive_event_once() {
    let (membership, server) = server_with(settings());
    let general = ChannelId::from("general");
    membership.join(UserId(1), &general);
    membership.join(UserId(2), &general);

    let (mut a, _sa) = connect(&server, 1).await;
    let (mut b, _sb) = connect(&server, 2).await;
    assert_eq!(a.subscribe("general").await["type"], "subscribed");
    assert_eq!(b.subscribe("general").await["type"], "subscribed");

    let sequence = server.bridge().notify_message_event(
        general.clone(),
        EventKind::MessageCreated,
        json!({"text": "hi"}),
    );
    assert_eq!(sequence, 1);

    for client in [&mut a, &mut b] {
        let event = client.recv().await;
        assert_eq!(event["type"], "event");
        assert_eq!(event["event_kind"], "message-created");
        assert_eq!(event["channel_id"], "general");
        assert_eq!(event["sequence"], 1);
        assert_eq!(event["payload"], json!({"text": "hi"}));

        // Nothing else queued ahead of the heartbeat reply
        client.send(json!({"action": "heartbeat"})).await;
        assert_eq!(client.recv().await["type"], "heartbeat_ack");
    }
}

#[tokio::test]
async fn test_disconnected_subscriber_is_skipped() {
    let (membership, server) = server_with(settings());
    let general = ChannelId::from("general");
    membership.join(UserId(1), &general);

    let (mut a, session) = connect(&server, 1).await;
    a.subscribe("general").await;
    assert_eq!(server.registry().subscriber_count(&general), 1);

    a.ws.close(None).await.expect("close failed");
    session.await.unwrap().unwrap();

    assert_eq!(server.registry().connection_count(), 0);
    assert_eq!(server.registry().subscriber_count(&general), 0);

    let sequence =
        server
            .bridge()
            .notify_message_event(general, EventKind::MessageCreated, json!({"text": "hi"}));
    assert_eq!(sequence, 1);
}

#[tokio::test]
async fn test_events_arrive_in_sequence_order() {
    let (membership, server) = server_with(settings());
    let general = ChannelId::from("general");
    membership.join(UserId(1), &general);

    let (mut a, _session) = connect(&server, 1).await;
    a.subscribe("general").await;

    let kinds = [
        EventKind::MessageCreated,
        EventKind::MessageEdited,
        EventKind::MessageDeleted,
    ];
    for kind in kinds {
        server
            .bridge()
            .notify_message_event(general.clone(), kind, json!({"id": 10}));
    }

    for (expected, kind) in (1u64..).zip(["message-created", "message-edited", "message-deleted"]) {
        let event = a.recv().await;
        assert_eq!(event["sequence"], expected);
        assert_eq!(event["event_kind"], kind);
    }
}

#[tokio::test]
async fn test_non_member_subscribe_rejected_connection_stays_open() {
    let (_membership, server) = server_with(settings());

    let (mut a, _session) = connect(&server, 1).await;
    let reply = a.subscribe("secret").await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "not_a_channel_member");

    a.send(json!({"action": "heartbeat"})).await;
    assert_eq!(a.recv().await["type"], "heartbeat_ack");
    assert_eq!(server.registry().connection_count(), 1);
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (membership, server) = server_with(settings());
    let general = ChannelId::from("general");
    membership.join(UserId(1), &general);

    let (mut a, _session) = connect(&server, 1).await;
    a.subscribe("general").await;

    a.send(json!({"action": "unsubscribe", "channel_id": "general"}))
        .await;
    assert_eq!(a.recv().await["type"], "unsubscribed");
    // Repeating is a no-op, not an error
    a.send(json!({"action": "unsubscribe", "channel_id": "general"}))
        .await;
    assert_eq!(a.recv().await["type"], "unsubscribed");

    server
        .bridge()
        .notify_message_event(general, EventKind::MessageCreated, json!({}));

    a.send(json!({"action": "heartbeat"})).await;
    assert_eq!(a.recv().await["type"], "heartbeat_ack");
}

#[tokio::test]
async fn test_submitted_message_is_persisted_then_broadcast() {
    let (membership, server) = server_with(settings());
    let general = ChannelId::from("general");
    membership.join(UserId(1), &general);
    membership.join(UserId(2), &general);

    let (mut author, _sa) = connect(&server, 1).await;
    let (mut reader, _sb) = connect(&server, 2).await;
    author.subscribe("general").await;
    reader.subscribe("general").await;

    author
        .send(json!({
            "action": "send_message",
            "channel_id": "general",
            "content": "hello there"
        }))
        .await;

    let event = reader.recv().await;
    assert_eq!(event["type"], "event");
    assert_eq!(event["payload"]["content"], "hello there");
    assert_eq!(event["payload"]["author_id"], 1);
    assert_eq!(event["payload"]["message_type"], "text");

    // The author sees its own message broadcast, then the acceptance
    let own = author.recv().await;
    assert_eq!(own["type"], "event");
    let accepted = author.recv().await;
    assert_eq!(accepted["type"], "message_accepted");
    assert_eq!(accepted["message_id"], event["payload"]["id"]);
}

#[tokio::test]
async fn test_rejected_submission_is_not_broadcast() {
    let (membership, server) = server_with(settings());
    let general = ChannelId::from("general");
    membership.join(UserId(2), &general);

    // User 1 is not a member and cannot post
    let (mut outsider, _sa) = connect(&server, 1).await;
    let (mut reader, _sb) = connect(&server, 2).await;
    reader.subscribe("general").await;

    outsider
        .send(json!({"action": "send_message", "channel_id": "general", "content": "spam"}))
        .await;
    let reply = outsider.recv().await;
    assert_eq!(reply["type"], "error");
    assert_eq!(server.bridge().last_sequence(&general), 0);

    reader.send(json!({"action": "heartbeat"})).await;
    assert_eq!(reader.recv().await["type"], "heartbeat_ack");
}

#[tokio::test]
async fn test_invalid_frame_gets_error_reply() {
    let (_membership, server) = server_with(settings());
    let (mut a, _session) = connect(&server, 1).await;

    a.send(json!({"action": "dance"})).await;
    let reply = a.recv().await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "invalid_message");
}

#[tokio::test]
async fn test_slow_consumer_is_evicted() {
    let (membership, server) = server_with(RealtimeSettings {
        outbound_queue_capacity: 1,
        overflow_close_threshold: 0,
        ..settings()
    });
    let general = ChannelId::from("general");
    membership.join(UserId(1), &general);

    let (mut a, session) = connect(&server, 1).await;
    a.subscribe("general").await;

    // No await between notifies: the drain task cannot keep up
    for _ in 0..5 {
        server
            .bridge()
            .notify_message_event(general.clone(), EventKind::MessageCreated, json!({}));
    }

    // Event 1 was displaced by event 2, which was then lost to the eviction
    let overflow = a.recv().await;
    assert_eq!(overflow["type"], "overflow");
    assert_eq!(overflow["dropped"], 2);
    let close = a.recv_close().await.expect("close frame");
    assert_eq!(close.code, CloseCode::Policy);

    let result = session.await.unwrap();
    assert!(matches!(
        result,
        Err(AppError::SlowConsumerOverflow { dropped: 2 })
    ));
    assert_eq!(server.registry().connection_count(), 0);
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let (_membership, server) = server_with(RealtimeSettings {
        heartbeat_interval_ms: 20,
        idle_timeout_ms: 60,
        ..settings()
    });

    let (mut a, session) = connect(&server, 1).await;
    let close = a.recv_close().await.expect("close frame");
    assert_eq!(close.code, CloseCode::Normal);

    session.await.unwrap().unwrap();
    assert_eq!(server.registry().connection_count(), 0);
}

#[tokio::test]
async fn test_shutdown_closes_all_connections() {
    let (_membership, server) = server_with(settings());
    let (mut a, sa) = connect(&server, 1).await;
    let (mut b, sb) = connect(&server, 2).await;

    assert_eq!(server.shutdown().await, 0);

    for client in [&mut a, &mut b] {
        let close = client.recv_close().await.expect("close frame");
        assert_eq!(close.code, CloseCode::Away);
    }
    sa.await.unwrap().unwrap();
    sb.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_write_failure_unregisters_connection() {
    let (membership, server) = server_with(settings());
    let general = ChannelId::from("general");
    membership.join(UserId(1), &general);

    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let broken = Arc::new(AtomicBool::new(false));
    let link = BreakableLink {
        inner: server_io,
        broken: broken.clone(),
    };
    let (mut a, session) = start_session(&server, 1, link, client_io).await;
    a.subscribe("general").await;

    broken.store(true, Ordering::SeqCst);
    server
        .bridge()
        .notify_message_event(general.clone(), EventKind::MessageCreated, json!({}));

    let result = timeout(RECV_TIMEOUT, session)
        .await
        .expect("session did not end")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(server.registry().connection_count(), 0);
    assert_eq!(server.registry().subscriber_count(&general), 0);
}

#[tokio::test]
async fn test_drain_timeout_discards_unsent_frames() {
    let (membership, server) = server_with(settings());
    let general = ChannelId::from("general");
    membership.join(UserId(1), &general);

    // The client stops reading, so a small link fills up and stalls the writer
    let (mut a, session) = connect_with_buffer(&server, 1, 256).await;
    a.subscribe("general").await;

    let bulky = "x".repeat(1024);
    for _ in 0..20 {
        server.bridge().notify_message_event(
            general.clone(),
            EventKind::MessageCreated,
            json!({ "text": bulky }),
        );
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    assert_eq!(server.shutdown().await, 0);
    session.await.unwrap().unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "closed after {:?}", elapsed);
    assert!(elapsed < RECV_TIMEOUT, "closed after {:?}", elapsed);

    // The writer was abandoned before reaching the queued close frame
    let mut events = 0;
    loop {
        match timeout(RECV_TIMEOUT, a.ws.next()).await {
            Ok(Some(Ok(Message::Text(_)))) => events += 1,
            Ok(Some(Ok(Message::Close(frame)))) => panic!("Unexpected close: {:?}", frame),
            Ok(Some(Ok(_))) => continue,
            _ => break,
        }
    }
    assert!(events < 20);
}

#[tokio::test]
async fn test_author_edits_and_deletes_over_the_socket() {
    let (membership, server) = server_with(settings());
    let general = ChannelId::from("general");
    membership.join(UserId(1), &general);
    membership.join(UserId(2), &general);

    let (mut author, _sa) = connect(&server, 1).await;
    let (mut reader, _sb) = connect(&server, 2).await;
    author.subscribe("general").await;
    reader.subscribe("general").await;

    author
        .send(json!({"action": "send_message", "channel_id": "general", "content": "frist"}))
        .await;
    let created = reader.recv().await;
    let message_id = created["payload"]["id"].clone();
    assert_eq!(author.recv().await["type"], "event");
    assert_eq!(author.recv().await["type"], "message_accepted");

    // Someone else's message cannot be edited
    reader
        .send(json!({"action": "edit_message", "message_id": message_id, "content": "mine"}))
        .await;
    let refused = reader.recv().await;
    assert_eq!(refused["type"], "error");
    assert_eq!(refused["code"], "not_message_author");

    author
        .send(json!({"action": "edit_message", "message_id": message_id, "content": "first"}))
        .await;
    let edited = reader.recv().await;
    assert_eq!(edited["event_kind"], "message-edited");
    assert_eq!(edited["sequence"], 2);
    assert_eq!(edited["payload"]["content"], "first");
    assert_eq!(author.recv().await["type"], "event");
    let reply = author.recv().await;
    assert_eq!(reply["type"], "message_edited");
    assert_eq!(reply["message_id"], message_id);

    author
        .send(json!({"action": "delete_message", "message_id": message_id}))
        .await;
    let deleted = reader.recv().await;
    assert_eq!(deleted["event_kind"], "message-deleted");
    assert_eq!(deleted["sequence"], 3);
    assert_eq!(deleted["payload"]["id"], message_id);
    assert_eq!(author.recv().await["type"], "event");
    assert_eq!(author.recv().await["type"], "message_deleted");

    author
        .send(json!({"action": "delete_message", "message_id": message_id}))
        .await;
    assert_eq!(author.recv().await["code"], "message_not_found");
}

#[tokio::test]
async fn test_join_and_leave_are_announced() {
    let (membership, server) = server_with(settings());
    let general = ChannelId::from("general");
    membership.join(UserId(1), &general);

    let (mut member, _sa) = connect(&server, 1).await;
    let (mut newcomer, _sb) = connect(&server, 2).await;
    member.subscribe("general").await;
    assert_eq!(newcomer.subscribe("general").await["code"], "not_a_channel_member");

    newcomer
        .send(json!({"action": "join_channel", "channel_id": "general"}))
        .await;
    assert_eq!(newcomer.recv().await["type"], "channel_joined");
    let joined = member.recv().await;
    assert_eq!(joined["event_kind"], "membership-changed");
    assert_eq!(joined["payload"], json!({"user_id": 2, "change": "joined"}));

    assert_eq!(newcomer.subscribe("general").await["type"], "subscribed");
    newcomer
        .send(json!({"action": "join_channel", "channel_id": "general"}))
        .await;
    assert_eq!(newcomer.recv().await["code"], "already_channel_member");

    newcomer
        .send(json!({"action": "leave_channel", "channel_id": "general"}))
        .await;
    let own_departure = newcomer.recv().await;
    assert_eq!(own_departure["payload"]["change"], "left");
    assert_eq!(newcomer.recv().await["type"], "channel_left");
    assert_eq!(member.recv().await["payload"]["change"], "left");

    // Leaving also ends the live subscription
    assert_eq!(server.registry().subscriber_count(&general), 1);
    assert_eq!(membership.members_of(&general), vec![UserId(1)]);
}

fn serve_one(
    listener: Arc<TcpListener>,
    server: Arc<ChatServer>,
) -> JoinHandle<Result<(), AppError>> {
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        handle_connection(stream, server).await
    })
}

#[tokio::test]
async fn test_tcp_handshake_attaches_identity() {
    let (_membership, server) = server_with(settings());
    let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
    let addr = listener.local_addr().unwrap();

    let _identified = serve_one(listener.clone(), server.clone());
    let mut request = format!("ws://{}/", addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert(USER_ID_HEADER, HeaderValue::from_static("7"));
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let hello = match timeout(RECV_TIMEOUT, ws.next()).await.unwrap().unwrap().unwrap() {
        Message::Text(text) => serde_json::from_str::<Value>(&text).unwrap(),
        other => panic!("Unexpected frame: {:?}", other),
    };
    assert_eq!(hello["type"], "connected");
    assert_eq!(hello["user_id"], 7);

    // Without the identity header the handshake is refused
    let anonymous_session = serve_one(listener.clone(), server.clone());
    let anonymous = format!("ws://{}/", addr).into_client_request().unwrap();
    match tokio_tungstenite::connect_async(anonymous).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::UNAUTHORIZED),
        other => panic!("Expected 401, got {:?}", other.map(|_| ())),
    }

    let result = timeout(RECV_TIMEOUT, anonymous_session)
        .await
        .expect("handshake task did not end")
        .unwrap();
    assert!(matches!(result, Err(AppError::MissingIdentity)));
    assert_eq!(server.registry().connection_count(), 1);
}
