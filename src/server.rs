//! ChatServer composition root
//!
//! Owns the registry and wires the subscription manager, dispatcher and
//! bridge to the external collaborators. Created at service start and torn
//! down at shutdown by closing every connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::bridge::MessageBridge;
use crate::dispatcher::Dispatcher;
use crate::error::AppError;
use crate::membership::{MembershipChange, MembershipDelta, MembershipService};
use crate::message::EventKind;
use crate::queue::CloseReason;
use crate::registry::Registry;
use crate::settings::RealtimeSettings;
use crate::store::{MessageDraft, MessageStore, StoredMessage};
use crate::subscription::SubscriptionManager;
use crate::types::{ChannelId, UserId};

/// How often shutdown re-checks whether every handler has unregistered
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// The real-time fan-out core shared by all connection handlers
pub struct ChatServer {
    settings: RealtimeSettings,
    registry: Arc<Registry>,
    subscriptions: SubscriptionManager,
    bridge: Arc<MessageBridge>,
    membership: Arc<dyn MembershipService>,
    store: Arc<dyn MessageStore>,
}

impl ChatServer {
    pub fn new(
        settings: RealtimeSettings,
        membership: Arc<dyn MembershipService>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let subscriptions = SubscriptionManager::new(registry.clone(), membership.clone());
        let bridge = Arc::new(MessageBridge::new(Dispatcher::new(registry.clone())));
        Self {
            settings,
            registry,
            subscriptions,
            bridge,
            membership,
            store,
        }
    }

    pub fn settings(&self) -> &RealtimeSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Handle given to the persistence/REST layer
    pub fn bridge(&self) -> &Arc<MessageBridge> {
        &self.bridge
    }

    /// Persist a submission, then broadcast it.
    ///
    /// Nothing is broadcast unless the store commits.
    pub async fn submit_message(
        &self,
        author_id: UserId,
        channel_id: &ChannelId,
        draft: MessageDraft,
    ) -> Result<StoredMessage, AppError> {
        let stored = self.store.persist(author_id, channel_id, draft).await?;
        self.bridge
            .notify_stored_message(EventKind::MessageCreated, &stored);
        Ok(stored)
    }

    /// Apply an author's edit, then broadcast `message-edited`.
    pub async fn edit_message(
        &self,
        editor_id: UserId,
        message_id: i64,
        content: String,
    ) -> Result<StoredMessage, AppError> {
        let edited = self.store.update(editor_id, message_id, content).await?;
        self.bridge
            .notify_stored_message(EventKind::MessageEdited, &edited);
        Ok(edited)
    }

    /// Delete an author's message, then broadcast `message-deleted` carrying
    /// the removed record.
    pub async fn delete_message(
        &self,
        requester_id: UserId,
        message_id: i64,
    ) -> Result<StoredMessage, AppError> {
        let removed = self.store.delete(requester_id, message_id).await?;
        self.bridge
            .notify_stored_message(EventKind::MessageDeleted, &removed);
        Ok(removed)
    }

    /// Make `user_id` a member of `channel_id` and announce it on the channel
    pub async fn join_channel(
        &self,
        user_id: UserId,
        channel_id: &ChannelId,
    ) -> Result<(), AppError> {
        if !self.membership.add_member(user_id, channel_id).await? {
            return Err(AppError::AlreadyChannelMember {
                user_id,
                channel_id: channel_id.clone(),
            });
        }
        self.announce_membership(user_id, channel_id, MembershipChange::Joined);
        Ok(())
    }

    /// Remove `user_id` from `channel_id` and announce it on the channel.
    ///
    /// Live subscriptions are left to their owning handlers.
    pub async fn leave_channel(
        &self,
        user_id: UserId,
        channel_id: &ChannelId,
    ) -> Result<(), AppError> {
        if !self.membership.remove_member(user_id, channel_id).await? {
            return Err(AppError::NotAChannelMember {
                user_id,
                channel_id: channel_id.clone(),
            });
        }
        self.announce_membership(user_id, channel_id, MembershipChange::Left);
        Ok(())
    }

    /// Close every connection and wait up to the drain timeout for their
    /// handlers to unregister. Returns the number still registered.
    pub async fn shutdown(&self) -> usize {
        let closing = self.registry.close_all(CloseReason::Shutdown);
        info!(connections = closing, "Shutting down, closing connections");

        let deadline = Instant::now() + self.settings.drain_timeout();
        while self.registry.connection_count() > 0 && Instant::now() < deadline {
            sleep(SHUTDOWN_POLL_INTERVAL).await;
        }

        let remaining = self.registry.connection_count();
        if remaining > 0 {
            warn!(remaining, "Connections still registered after drain timeout");
        }
        remaining
    }

    fn announce_membership(
        &self,
        user_id: UserId,
        channel_id: &ChannelId,
        change: MembershipChange,
    ) {
        let delta = MembershipDelta { user_id, change };
        let sequence = self
            .bridge
            .notify_membership_change(channel_id.clone(), &delta);
        debug!(
            user_id = %user_id,
            channel_id = %channel_id,
            change = ?change,
            sequence = ?sequence,
            "Membership change announced"
        );
    }
}
