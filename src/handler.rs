//! WebSocket connection handler
//!
//! Handles individual client connections: WebSocket handshake, identity
//! attachment, the per-connection control loop and the outbound drain task.
//!
//! Lifecycle: `Connecting -> Open -> Closing -> Closed`. Registry cleanup
//! happens on entering `Closing`, before any attempt to flush the queue.

use std::sync::Arc;

use chrono::Utc;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, ConnectionState};
use crate::error::AppError;
use crate::message::{ClientMessage, ServerMessage};
use crate::queue::{CloseReason, Delivery, OutboundQueue};
use crate::server::ChatServer;
use crate::store::MessageDraft;
use crate::types::{ConnectionId, UserId};

/// Handshake header carrying the identity validated upstream
pub const USER_ID_HEADER: &str = "x-user-id";

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake, attaches the upstream identity and runs
/// the session until the connection is closed.
pub async fn handle_connection(stream: TcpStream, server: Arc<ChatServer>) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    let mut identity = None;
    let attach_identity = |request: &Request, response: Response| {
        match user_id_from_request(request) {
            Some(user_id) => {
                identity = Some(user_id);
                Ok(response)
            }
            None => Err(unauthorized()),
        }
    };

    let handshake = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        attach_identity,
        Some(server.settings().websocket_config()),
    )
    .await;
    let ws_stream = match handshake {
        Ok(ws_stream) => ws_stream,
        // The 401 has already been written to the peer
        Err(WsError::Http(response)) if response.status() == StatusCode::UNAUTHORIZED => {
            return Err(AppError::MissingIdentity);
        }
        Err(e) => return Err(e.into()),
    };

    let Some(user_id) = identity else {
        return Err(AppError::MissingIdentity);
    };
    debug!("Connection from {} identified as user {}", peer_addr, user_id);

    run_session(ws_stream, user_id, server).await
}

/// Run an accepted WebSocket for an already identified user
///
/// Registers the connection, spawns the outbound drain task and processes
/// inbound frames until the client leaves, goes idle, errors, or the server
/// closes the connection.
pub async fn run_session<S>(
    ws_stream: WebSocketStream<S>,
    user_id: UserId,
    server: Arc<ChatServer>,
) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let settings = server.settings().clone();
    let mut connection = Connection::new(
        user_id,
        settings.outbound_queue_capacity,
        settings.overflow_close_threshold,
    );
    let connection_id = connection.id();

    // A duplicate id is fatal to this connection only
    let registration = server.registry().register(&connection)?;
    connection.transition(ConnectionState::Open);
    info!(connection_id = %connection_id, user_id = %user_id, "Connection open");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let connected = ServerMessage::Connected {
        connection_id: connection_id.to_string(),
        user_id: user_id.0,
        heartbeat_interval_ms: settings.heartbeat_interval_ms,
    };
    let json = serde_json::to_string(&connected)?;
    ws_sender.send(Message::Text(json.into())).await?;

    let queue = connection.queue().clone();
    let mut writer = tokio::spawn(drain_outbound(ws_sender, queue.clone(), connection_id));

    let closed = queue.closed();
    tokio::pin!(closed);

    let mut idle_check = interval(settings.heartbeat_interval());
    idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    idle_check.tick().await; // Skip first immediate tick
    let mut last_seen = Instant::now();

    let reason = loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    last_seen = Instant::now();
                    handle_text(&text, &mut connection, &server).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(connection_id = %connection_id, "Client closed connection");
                    break CloseReason::ClientClosed;
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Pong is handled automatically by tungstenite
                    last_seen = Instant::now();
                }
                Some(Ok(_)) => {
                    debug!(connection_id = %connection_id, "Ignoring non-text frame");
                }
                Some(Err(e)) => {
                    warn!(connection_id = %connection_id, error = %e, "WebSocket error");
                    break CloseReason::ProtocolError;
                }
            },
            reason = &mut closed => break reason,
            _ = idle_check.tick() => {
                if last_seen.elapsed() >= settings.idle_timeout() {
                    info!(connection_id = %connection_id, "Idle timeout, closing connection");
                    break CloseReason::IdleTimeout;
                }
            }
        }
    };

    connection.transition(ConnectionState::Closing);
    registration.unregister(reason);

    match timeout(settings.drain_timeout(), &mut writer).await {
        Ok(Ok(Ok(_))) => {}
        Ok(Ok(Err(e))) => debug!(connection_id = %connection_id, error = %e, "Drain ended early"),
        Ok(Err(e)) => error!(connection_id = %connection_id, error = %e, "Drain task failed"),
        Err(_) => {
            writer.abort();
            debug!(
                connection_id = %connection_id,
                discarded = queue.len(),
                "Drain timeout, discarding queued frames"
            );
        }
    }

    connection.transition(ConnectionState::Closed);
    let lifetime = Utc::now() - connection.connected_at();
    info!(
        connection_id = %connection_id,
        user_id = %user_id,
        reason = %reason,
        duration_ms = lifetime.num_milliseconds(),
        "Connection closed"
    );

    if reason == CloseReason::SlowConsumer {
        return Err(AppError::SlowConsumerOverflow {
            dropped: queue.dropped_total(),
        });
    }
    Ok(())
}

/// Write queued frames to the transport until the queue closes
async fn drain_outbound<W>(
    mut sink: W,
    queue: Arc<OutboundQueue>,
    connection_id: ConnectionId,
) -> Result<CloseReason, AppError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        let frame = match queue.next().await {
            Delivery::Frame(frame) => frame,
            Delivery::Overflow { dropped } => {
                warn!(connection_id = %connection_id, dropped, "Events dropped for slow consumer");
                ServerMessage::Overflow { dropped }
            }
            Delivery::Closed(reason) => {
                if let Some(close) = reason.close_frame() {
                    let _ = sink.send(Message::Close(Some(close))).await;
                }
                debug!(connection_id = %connection_id, reason = %reason, "Write task ended");
                return Ok(reason);
            }
        };

        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize message: {}", e);
                // Continue - don't break on serialization errors
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(json.into())).await {
            debug!(connection_id = %connection_id, error = %e, "WebSocket send failed");
            queue.close(CloseReason::TransportFailure);
            return Err(AppError::TransportWriteFailure(e.to_string()));
        }
    }
}

/// Parse one inbound text frame and queue the reply
async fn handle_text(text: &str, connection: &mut Connection, server: &ChatServer) {
    let reply = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => handle_client_message(message, connection, server).await,
        Err(e) => {
            warn!(connection_id = %connection.id(), "Invalid JSON: {}", e);
            AppError::Json(e).into()
        }
    };
    connection.queue().push(reply);
}

async fn handle_client_message(
    message: ClientMessage,
    connection: &mut Connection,
    server: &ChatServer,
) -> ServerMessage {
    match message {
        ClientMessage::Subscribe { channel_id } => {
            match server.subscriptions().subscribe(connection, &channel_id).await {
                Ok(_) => ServerMessage::Subscribed { channel_id },
                Err(e) => e.into(),
            }
        }
        ClientMessage::Unsubscribe { channel_id } => {
            match server.subscriptions().unsubscribe(connection, &channel_id) {
                Ok(_) => ServerMessage::Unsubscribed { channel_id },
                Err(e) => e.into(),
            }
        }
        ClientMessage::SendMessage {
            channel_id,
            content,
            message_type,
        } => {
            let draft = MessageDraft {
                content,
                message_type,
            };
            match server
                .submit_message(connection.user_id(), &channel_id, draft)
                .await
            {
                Ok(stored) => ServerMessage::MessageAccepted {
                    channel_id,
                    message_id: stored.id,
                },
                Err(e) => {
                    debug!(connection_id = %connection.id(), error = %e, "Submission rejected");
                    e.into()
                }
            }
        }
        ClientMessage::EditMessage {
            message_id,
            content,
        } => match server
            .edit_message(connection.user_id(), message_id, content)
            .await
        {
            Ok(edited) => ServerMessage::MessageEdited {
                channel_id: edited.channel_id,
                message_id,
            },
            Err(e) => {
                debug!(connection_id = %connection.id(), error = %e, "Edit rejected");
                e.into()
            }
        },
        ClientMessage::DeleteMessage { message_id } => {
            match server
                .delete_message(connection.user_id(), message_id)
                .await
            {
                Ok(removed) => ServerMessage::MessageDeleted {
                    channel_id: removed.channel_id,
                    message_id,
                },
                Err(e) => {
                    debug!(connection_id = %connection.id(), error = %e, "Delete rejected");
                    e.into()
                }
            }
        }
        ClientMessage::JoinChannel { channel_id } => {
            match server.join_channel(connection.user_id(), &channel_id).await {
                Ok(()) => ServerMessage::ChannelJoined { channel_id },
                Err(e) => e.into(),
            }
        }
        ClientMessage::LeaveChannel { channel_id } => {
            match server.leave_channel(connection.user_id(), &channel_id).await {
                Ok(()) => {
                    // No longer a member, so this connection stops listening too
                    if let Err(e) = server.subscriptions().unsubscribe(connection, &channel_id) {
                        debug!(
                            connection_id = %connection.id(),
                            error = %e,
                            "Unsubscribe after leave failed"
                        );
                    }
                    ServerMessage::ChannelLeft { channel_id }
                }
                Err(e) => e.into(),
            }
        }
        ClientMessage::Heartbeat => ServerMessage::HeartbeatAck,
    }
}

fn user_id_from_request(request: &Request) -> Option<UserId> {
    request
        .headers()
        .get(USER_ID_HEADER)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("missing or invalid user identity".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}
