//! Message protocol definitions
//!
//! JSON-based bidirectional frame protocol using Serde's tagged enums
//! for type-safe serialization/deserialization, plus the immutable
//! `BroadcastEvent` carried by every fan-out.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::store::MessageType;
use crate::types::ChannelId;

/// Kind of change a broadcast event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    MessageCreated,
    MessageEdited,
    MessageDeleted,
    MembershipChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MessageCreated => "message-created",
            EventKind::MessageEdited => "message-edited",
            EventKind::MessageDeleted => "message-deleted",
            EventKind::MembershipChanged => "membership-changed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of real-time notification for one channel
///
/// Built once by the bridge and shared (behind `Arc`) by every subscriber's
/// outbound queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    pub event_kind: EventKind,
    pub channel_id: ChannelId,
    /// Per-channel, strictly increasing, starting at 1
    pub sequence: u64,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Client → Server frame
///
/// All frames from client to server. Uses tagged enum with snake_case naming.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving broadcasts for a channel
    Subscribe { channel_id: ChannelId },
    /// Stop receiving broadcasts for a channel
    Unsubscribe { channel_id: ChannelId },
    /// New message submission, forwarded to persistence
    SendMessage {
        channel_id: ChannelId,
        content: String,
        #[serde(default)]
        message_type: MessageType,
    },
    /// Replace the content of one of the user's own messages
    EditMessage { message_id: i64, content: String },
    /// Remove one of the user's own messages
    DeleteMessage { message_id: i64 },
    /// Become a member of a channel
    JoinChannel { channel_id: ChannelId },
    /// Give up membership of a channel
    LeaveChannel { channel_id: ChannelId },
    /// Application-level keepalive
    Heartbeat,
}

/// Server → Client frame
///
/// All frames from server to client. Uses tagged enum with snake_case naming.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection accepted, connection ID issued
    Connected {
        connection_id: String,
        user_id: i64,
        heartbeat_interval_ms: u64,
    },
    /// Channel event fan-out
    Event(Arc<BroadcastEvent>),
    /// Subscription confirmed
    Subscribed { channel_id: ChannelId },
    /// Unsubscription confirmed
    Unsubscribed { channel_id: ChannelId },
    /// Submitted message was persisted
    MessageAccepted { channel_id: ChannelId, message_id: i64 },
    /// Edit was persisted
    MessageEdited { channel_id: ChannelId, message_id: i64 },
    /// Deletion was persisted
    MessageDeleted { channel_id: ChannelId, message_id: i64 },
    /// Membership granted
    ChannelJoined { channel_id: ChannelId },
    /// Membership given up
    ChannelLeft { channel_id: ChannelId },
    /// Heartbeat acknowledged
    HeartbeatAck,
    /// Events were dropped because the outbound queue was full
    Overflow { dropped: u64 },
    /// Error occurred
    Error { code: ErrorCode, message: String },
}

/// Error codes for ServerMessage::Error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Subscribe rejected by the membership check
    NotAChannelMember,
    /// Join requested while already a member
    AlreadyChannelMember,
    /// Edit/delete of an unknown message
    MessageNotFound,
    /// Edit/delete of someone else's message
    NotMessageAuthor,
    /// Persistence rejected the submitted message
    PersistenceFailed,
    /// Invalid frame format
    InvalidMessage,
    /// Anything the client cannot act on
    Internal,
}

/// Convert AppError to ServerMessage for client notification
impl From<AppError> for ServerMessage {
    fn from(err: AppError) -> Self {
        let (code, message) = match &err {
            AppError::NotAChannelMember { channel_id, .. } => (
                ErrorCode::NotAChannelMember,
                format!("Not a member of channel '{}'", channel_id),
            ),
            AppError::AlreadyChannelMember { channel_id, .. } => (
                ErrorCode::AlreadyChannelMember,
                format!("Already a member of channel '{}'", channel_id),
            ),
            AppError::MessageNotFound(message_id) => (
                ErrorCode::MessageNotFound,
                format!("Message {} not found", message_id),
            ),
            AppError::NotMessageAuthor { message_id, .. } => (
                ErrorCode::NotMessageAuthor,
                format!("Not the author of message {}", message_id),
            ),
            AppError::Persistence(reason) => (
                ErrorCode::PersistenceFailed,
                format!("Message not stored: {}", reason),
            ),
            AppError::Json(e) => {
                (ErrorCode::InvalidMessage, format!("Invalid message format: {}", e))
            }
            // Fatal errors are not typically converted (connection closes)
            _ => (ErrorCode::Internal, "Internal error".to_string()),
        };
        ServerMessage::Error { code, message }
    }
}
