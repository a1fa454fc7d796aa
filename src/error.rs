//! Error types for the fan-out core
//!
//! Defines application-level errors. Uses thiserror for ergonomic error
//! definitions.

use thiserror::Error;

use crate::types::{ChannelId, ConnectionId, UserId};

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// business errors (send error frame to client, connection stays open).
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Handshake arrived without a usable user identity
    #[error("Missing user identity")]
    MissingIdentity,

    /// Subscribe rejected by the membership check
    #[error("User {user_id} is not a member of channel {channel_id}")]
    NotAChannelMember {
        user_id: UserId,
        channel_id: ChannelId,
    },

    /// Connection id collision (invariant violation, fatal to that connection)
    #[error("Duplicate connection id: {0}")]
    DuplicateConnectionId(ConnectionId),

    /// Operation targeted a connection that is not registered
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Outbound queue overflowed past the tolerated number of episodes
    #[error("Slow consumer overflow: {dropped} events dropped")]
    SlowConsumerOverflow { dropped: u64 },

    /// Writing to the transport failed (triggers Open -> Closing)
    #[error("Transport write failure: {0}")]
    TransportWriteFailure(String),

    /// Join requested by a user who already belongs to the channel
    #[error("User {user_id} is already a member of channel {channel_id}")]
    AlreadyChannelMember {
        user_id: UserId,
        channel_id: ChannelId,
    },

    /// Edit or delete targeted a message that does not exist
    #[error("Message {0} not found")]
    MessageNotFound(i64),

    /// Only a message's author may edit or delete it
    #[error("User {user_id} is not the author of message {message_id}")]
    NotMessageAuthor { user_id: UserId, message_id: i64 },

    /// The persistence layer rejected or failed a write
    #[error("Persistence error: {0}")]
    Persistence(String),
}
