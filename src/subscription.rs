//! Subscription manager
//!
//! Applies channel policy on top of the registry. Both operations take the
//! connection by `&mut`, so only the handler that owns a connection can
//! change its subscriptions, and its requests run one at a time.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::AppError;
use crate::membership::MembershipService;
use crate::registry::Registry;
use crate::types::ChannelId;

pub struct SubscriptionManager {
    registry: Arc<Registry>,
    membership: Arc<dyn MembershipService>,
}

impl SubscriptionManager {
    pub fn new(registry: Arc<Registry>, membership: Arc<dyn MembershipService>) -> Self {
        Self {
            registry,
            membership,
        }
    }

    /// Subscribe after the membership service confirms the user may join.
    ///
    /// Returns false when the connection was already subscribed.
    pub async fn subscribe(
        &self,
        connection: &mut Connection,
        channel_id: &ChannelId,
    ) -> Result<bool, AppError> {
        if connection.is_subscribed(channel_id) {
            return Ok(false);
        }

        let user_id = connection.user_id();
        if !self.membership.is_member(user_id, channel_id).await? {
            warn!(
                connection_id = %connection.id(),
                user_id = %user_id,
                channel_id = %channel_id,
                "Subscribe rejected, not a channel member"
            );
            return Err(AppError::NotAChannelMember {
                user_id,
                channel_id: channel_id.clone(),
            });
        }

        let added = self.registry.subscribe(connection.id(), channel_id)?;
        connection.record_subscribed(channel_id.clone());
        debug!(
            connection_id = %connection.id(),
            channel_id = %channel_id,
            subscribers = self.registry.subscriber_count(channel_id),
            "Channel joined"
        );
        Ok(added)
    }

    /// Drop a subscription. Returns false when there was none.
    pub fn unsubscribe(
        &self,
        connection: &mut Connection,
        channel_id: &ChannelId,
    ) -> Result<bool, AppError> {
        let removed = self.registry.unsubscribe(connection.id(), channel_id)?;
        connection.record_unsubscribed(channel_id);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::InMemoryMembership;
    use crate::queue::CloseReason;
    use crate::types::UserId;

    fn setup() -> (Arc<Registry>, Arc<InMemoryMembership>, SubscriptionManager) {
        let registry = Arc::new(Registry::new());
        let membership = Arc::new(InMemoryMembership::new());
        let manager = SubscriptionManager::new(registry.clone(), membership.clone());
        (registry, membership, manager)
    }

    #[tokio::test]
    async fn test_member_can_subscribe() {
        let (registry, membership, manager) = setup();
        let general = ChannelId::from("general");
        membership.join(UserId(1), &general);

        let mut conn = Connection::new(UserId(1), 8, 3);
        let _handle = registry.register(&conn).unwrap();

        assert!(manager.subscribe(&mut conn, &general).await.unwrap());
        assert!(!manager.subscribe(&mut conn, &general).await.unwrap());
        assert!(conn.is_subscribed(&general));
        assert!(registry.is_subscribed(conn.id(), &general));
    }

    #[tokio::test]
    async fn test_non_member_rejected_and_stays_registered() {
        let (registry, _membership, manager) = setup();
        let secret = ChannelId::from("secret");

        let mut conn = Connection::new(UserId(1), 8, 3);
        let _handle = registry.register(&conn).unwrap();

        let result = manager.subscribe(&mut conn, &secret).await;
        assert!(matches!(result, Err(AppError::NotAChannelMember { .. })));
        assert!(!conn.is_subscribed(&secret));
        assert_eq!(registry.subscriber_count(&secret), 0);
        assert!(registry.is_registered(conn.id()));
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let (registry, membership, manager) = setup();
        let general = ChannelId::from("general");
        membership.join(UserId(1), &general);

        let mut conn = Connection::new(UserId(1), 8, 3);
        let _handle = registry.register(&conn).unwrap();
        manager.subscribe(&mut conn, &general).await.unwrap();

        assert!(manager.unsubscribe(&mut conn, &general).unwrap());
        assert!(!manager.unsubscribe(&mut conn, &general).unwrap());
        assert!(!conn.is_subscribed(&general));
        assert!(registry.check_consistency());
    }

    #[tokio::test]
    async fn test_subscribe_after_unregister_fails() {
        let (registry, membership, manager) = setup();
        let general = ChannelId::from("general");
        membership.join(UserId(1), &general);

        let mut conn = Connection::new(UserId(1), 8, 3);
        let handle = registry.register(&conn).unwrap();
        handle.unregister(CloseReason::ClientClosed);

        let result = manager.subscribe(&mut conn, &general).await;
        assert!(matches!(result, Err(AppError::UnknownConnection(_))));
        assert_eq!(registry.channel_count(), 0);
    }
}
