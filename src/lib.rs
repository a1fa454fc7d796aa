//! Real-time Channel Fan-out Library
//!
//! The real-time distribution core of a chat backend built with
//! tokio-tungstenite: live connections grouped by channel, and every
//! persisted message fanned out to the connections subscribed to its channel.
//!
//! # Features
//! - WebSocket connection handling with upstream-validated identity
//! - Channel subscribe/unsubscribe gated by a membership check
//! - Ordered per-channel broadcast with monotonic sequence numbers
//! - Bounded per-connection outbound queues with drop-oldest overflow
//! - Slow consumer eviction, idle timeout and graceful drain on close
//!
//! # Architecture
//! - `Registry` is the only shared mutable state: a dual index of
//!   channel -> connections and connection -> channels
//! - Each connection has a `handler` task that owns its `Connection` and a
//!   spawned drain task that writes its outbound queue to the socket
//! - `MessageBridge` is the persistence layer's entry point; it sequences
//!   events per channel and hands them to the `Dispatcher`
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use chat_fanout::{handle_connection, ChatServer, InMemoryMembership, InMemoryMessageStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     let membership = Arc::new(InMemoryMembership::new());
//!     let store = Arc::new(InMemoryMessageStore::new(membership.clone()));
//!     let server = Arc::new(ChatServer::new(Default::default(), membership, store));
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         tokio::spawn(handle_connection(stream, server.clone()));
//!     }
//! }
//! ```

pub mod bridge;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod membership;
pub mod message;
pub mod queue;
pub mod registry;
pub mod server;
pub mod settings;
pub mod store;
pub mod subscription;
pub mod types;

// Re-export main types for convenience
pub use bridge::MessageBridge;
pub use connection::{Connection, ConnectionState};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use error::AppError;
pub use handler::{handle_connection, run_session, USER_ID_HEADER};
pub use membership::{InMemoryMembership, MembershipChange, MembershipDelta, MembershipService};
pub use message::{BroadcastEvent, ClientMessage, ErrorCode, EventKind, ServerMessage};
pub use queue::{CloseReason, OutboundQueue, PushOutcome};
pub use registry::{RegistrationHandle, Registry, Subscriber};
pub use server::ChatServer;
pub use settings::{RealtimeSettings, Settings};
pub use store::{InMemoryMessageStore, MessageDraft, MessageStore, MessageType, StoredMessage};
pub use subscription::SubscriptionManager;
pub use types::{ChannelId, ConnectionId, UserId};
