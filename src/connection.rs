//! Connection struct definition
//!
//! Represents one live client connection: its identity, lifecycle state,
//! owned copy of its subscription set and its outbound queue.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::queue::OutboundQueue;
use crate::types::{ChannelId, ConnectionId, UserId};

/// Connection lifecycle: `Connecting -> Open -> Closing -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Open) | (Connecting, Closing) | (Open, Closing) | (Closing, Closed)
        )
    }
}

/// Connected client
///
/// Owned exclusively by the handler task that accepted it. The registry only
/// keeps a clone of the outbound queue.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    state: ConnectionState,
    channels: HashSet<ChannelId>,
    queue: Arc<OutboundQueue>,
    connected_at: DateTime<Utc>,
}

impl Connection {
    /// Create a new connection in the `Connecting` state
    pub fn new(user_id: UserId, queue_capacity: usize, overflow_limit: u32) -> Self {
        Self::with_id(ConnectionId::new(), user_id, queue_capacity, overflow_limit)
    }

    pub fn with_id(
        id: ConnectionId,
        user_id: UserId,
        queue_capacity: usize,
        overflow_limit: u32,
    ) -> Self {
        Self {
            id,
            user_id,
            state: ConnectionState::Connecting,
            channels: HashSet::new(),
            queue: Arc::new(OutboundQueue::new(queue_capacity, overflow_limit)),
            connected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Move to `next`. Illegal transitions are ignored and return false.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                connection_id = %self.id,
                from = ?self.state,
                to = ?next,
                "Ignoring illegal connection state transition"
            );
            return false;
        }
        debug!(connection_id = %self.id, from = ?self.state, to = ?next, "Connection state change");
        self.state = next;
        true
    }

    pub fn is_subscribed(&self, channel_id: &ChannelId) -> bool {
        self.channels.contains(channel_id)
    }

    pub fn channels(&self) -> &HashSet<ChannelId> {
        &self.channels
    }

    pub(crate) fn record_subscribed(&mut self, channel_id: ChannelId) {
        self.channels.insert(channel_id);
    }

    pub(crate) fn record_unsubscribed(&mut self, channel_id: &ChannelId) {
        self.channels.remove(channel_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_creation() {
        let conn = Connection::new(UserId(1), 16, 3);

        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(conn.user_id(), UserId(1));
        assert!(conn.channels().is_empty());
        assert_eq!(conn.queue().capacity(), 16);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut conn = Connection::new(UserId(1), 16, 3);

        assert!(conn.transition(ConnectionState::Open));
        assert!(!conn.transition(ConnectionState::Connecting));
        assert!(!conn.transition(ConnectionState::Closed));
        assert!(conn.transition(ConnectionState::Closing));
        assert!(conn.transition(ConnectionState::Closed));

        // Closed is terminal
        assert!(!conn.transition(ConnectionState::Open));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_owned_subscription_set() {
        let mut conn = Connection::new(UserId(1), 16, 3);
        let general = ChannelId::from("general");

        conn.record_subscribed(general.clone());
        conn.record_subscribed(general.clone());
        assert!(conn.is_subscribed(&general));
        assert_eq!(conn.channels().len(), 1);

        conn.record_unsubscribed(&general);
        assert!(!conn.is_subscribed(&general));
    }
}
