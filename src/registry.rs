//! Connection registry
//!
//! Tracks live connections and the channels each one is subscribed to.
//! Keeps two indices in step:
//! - channel -> subscribers (sharded `DashMap`, one bucket per channel)
//! - connection -> channels (per-connection mutex)
//!
//! Lock order is always connection entry first, then channel bucket. Reads of
//! a channel's subscribers copy the bucket out, so no lock survives the call.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::connection::Connection;
use crate::error::AppError;
use crate::queue::{CloseReason, OutboundQueue};
use crate::types::{ChannelId, ConnectionId, UserId};

/// A connection as seen from one channel bucket
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub queue: Arc<OutboundQueue>,
    pub subscribed_at: DateTime<Utc>,
}

#[derive(Debug)]
struct RegistryEntry {
    user_id: UserId,
    queue: Arc<OutboundQueue>,
    /// Reverse index; `None` once the connection has been unregistered
    channels: Mutex<Option<HashMap<ChannelId, DateTime<Utc>>>>,
}

/// Registry of live connections and their channel subscriptions
#[derive(Debug, Default)]
pub struct Registry {
    connections: DashMap<ConnectionId, Arc<RegistryEntry>>,
    channels: DashMap<ChannelId, HashMap<ConnectionId, Subscriber>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection with no subscriptions
    pub fn register(
        self: &Arc<Self>,
        connection: &Connection,
    ) -> Result<RegistrationHandle, AppError> {
        let connection_id = connection.id();
        match self.connections.entry(connection_id) {
            Entry::Occupied(_) => {
                error!(
                    connection_id = %connection_id,
                    "Invariant violation: connection id already registered"
                );
                Err(AppError::DuplicateConnectionId(connection_id))
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(RegistryEntry {
                    user_id: connection.user_id(),
                    queue: connection.queue().clone(),
                    channels: Mutex::new(Some(HashMap::new())),
                }));
                info!(
                    connection_id = %connection_id,
                    user_id = %connection.user_id(),
                    "Connection registered"
                );
                Ok(RegistrationHandle {
                    registry: self.clone(),
                    connection_id,
                    released: false,
                })
            }
        }
    }

    /// Subscribe a connection to a channel. Returns false if it already was.
    pub fn subscribe(
        &self,
        connection_id: ConnectionId,
        channel_id: &ChannelId,
    ) -> Result<bool, AppError> {
        let entry = self
            .entry(connection_id)
            .ok_or(AppError::UnknownConnection(connection_id))?;

        let mut guard = entry.channels.lock();
        let Some(channels) = guard.as_mut() else {
            return Err(AppError::UnknownConnection(connection_id));
        };
        if channels.contains_key(channel_id) {
            return Ok(false);
        }

        let subscribed_at = Utc::now();
        self.channels.entry(channel_id.clone()).or_default().insert(
            connection_id,
            Subscriber {
                connection_id,
                user_id: entry.user_id,
                queue: entry.queue.clone(),
                subscribed_at,
            },
        );
        channels.insert(channel_id.clone(), subscribed_at);

        debug!(
            connection_id = %connection_id,
            channel_id = %channel_id,
            "Subscribed"
        );
        Ok(true)
    }

    /// Remove a subscription. Returns false if there was none.
    pub fn unsubscribe(
        &self,
        connection_id: ConnectionId,
        channel_id: &ChannelId,
    ) -> Result<bool, AppError> {
        let entry = self
            .entry(connection_id)
            .ok_or(AppError::UnknownConnection(connection_id))?;

        let mut guard = entry.channels.lock();
        let Some(channels) = guard.as_mut() else {
            return Err(AppError::UnknownConnection(connection_id));
        };
        if channels.remove(channel_id).is_none() {
            return Ok(false);
        }
        self.detach(connection_id, channel_id);

        debug!(
            connection_id = %connection_id,
            channel_id = %channel_id,
            "Unsubscribed"
        );
        Ok(true)
    }

    /// Remove a connection and all of its subscriptions, closing its queue.
    ///
    /// Returns false when the connection was not registered, so the
    /// disconnect path may call it even after a failed registration.
    pub fn unregister(&self, connection_id: ConnectionId, reason: CloseReason) -> bool {
        let Some((_, entry)) = self.connections.remove(&connection_id) else {
            return false;
        };

        // Closed first: a broadcast racing with us can no longer enqueue.
        entry.queue.close(reason);

        let channels = entry.channels.lock().take().unwrap_or_default();
        for channel_id in channels.keys() {
            self.detach(connection_id, channel_id);
        }

        info!(
            connection_id = %connection_id,
            user_id = %entry.user_id,
            channels = channels.len(),
            reason = %reason,
            "Connection unregistered"
        );
        true
    }

    /// Snapshot of a channel's current subscribers
    pub fn subscribers_of(&self, channel_id: &ChannelId) -> Vec<Subscriber> {
        self.channels
            .get(channel_id)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Channels a connection is subscribed to, `None` if unknown
    pub fn channels_of(&self, connection_id: ConnectionId) -> Option<Vec<ChannelId>> {
        let entry = self.entry(connection_id)?;
        let guard = entry.channels.lock();
        guard.as_ref().map(|channels| channels.keys().cloned().collect())
    }

    pub fn is_subscribed(&self, connection_id: ConnectionId, channel_id: &ChannelId) -> bool {
        self.channels
            .get(channel_id)
            .map(|bucket| bucket.contains_key(&connection_id))
            .unwrap_or(false)
    }

    pub fn is_registered(&self, connection_id: ConnectionId) -> bool {
        self.connections.contains_key(&connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Channels with at least one subscriber
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn subscriber_count(&self, channel_id: &ChannelId) -> usize {
        self.channels
            .get(channel_id)
            .map(|bucket| bucket.len())
            .unwrap_or(0)
    }

    /// Close every registered connection's queue. Handlers observe the close
    /// and unregister themselves.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let entries: Vec<Arc<RegistryEntry>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        entries
            .iter()
            .filter(|entry| entry.queue.close(reason))
            .count()
    }

    /// Verify both indices describe the same relation. Meaningful at
    /// quiescent points only.
    pub fn check_consistency(&self) -> bool {
        let forward: Vec<(ChannelId, ConnectionId)> = self
            .channels
            .iter()
            .flat_map(|bucket| {
                let channel_id = bucket.key().clone();
                bucket
                    .value()
                    .keys()
                    .map(|connection_id| (channel_id.clone(), *connection_id))
                    .collect::<Vec<_>>()
            })
            .collect();

        let all_listed = forward.iter().all(|(channel_id, connection_id)| {
            self.channels_of(*connection_id)
                .map(|channels| channels.contains(channel_id))
                .unwrap_or(false)
        });

        let entries: Vec<Arc<RegistryEntry>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let reverse: usize = entries
            .iter()
            .map(|entry| entry.channels.lock().as_ref().map_or(0, |channels| channels.len()))
            .sum();

        all_listed && forward.len() == reverse
    }

    fn entry(&self, connection_id: ConnectionId) -> Option<Arc<RegistryEntry>> {
        self.connections
            .get(&connection_id)
            .map(|entry| entry.value().clone())
    }

    fn detach(&self, connection_id: ConnectionId, channel_id: &ChannelId) {
        if let Some(mut bucket) = self.channels.get_mut(channel_id) {
            bucket.remove(&connection_id);
        }
        if self
            .channels
            .remove_if(channel_id, |_, bucket| bucket.is_empty())
            .is_some()
        {
            debug!(channel_id = %channel_id, "Channel has no subscribers, bucket removed");
        }
    }
}

/// Proof of registration
///
/// `unregister` consumes the handle; dropping it without doing so
/// unregisters as a transport failure.
#[derive(Debug)]
pub struct RegistrationHandle {
    registry: Arc<Registry>,
    connection_id: ConnectionId,
    released: bool,
}

impl RegistrationHandle {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn unregister(mut self, reason: CloseReason) -> bool {
        self.released = true;
        self.registry.unregister(self.connection_id, reason)
    }
}

impl Drop for RegistrationHandle {
    fn drop(&mut self) {
        if !self.released {
            self.registry
                .unregister(self.connection_id, CloseReason::TransportFailure);
        }
    }
}
