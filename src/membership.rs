//! Channel membership seam
//!
//! The membership service owns who belongs to which channel. The fan-out
//! core asks `is_member` on every subscribe request and forwards join/leave
//! requests, broadcasting the resulting delta.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::types::{ChannelId, UserId};

/// Capability check delegated to the external membership service
#[async_trait]
pub trait MembershipService: Send + Sync {
    async fn is_member(&self, user_id: UserId, channel_id: &ChannelId) -> Result<bool, AppError>;

    /// Record a membership. Returns false if the user already was a member.
    async fn add_member(&self, user_id: UserId, channel_id: &ChannelId) -> Result<bool, AppError>;

    /// Drop a membership. Returns false if the user was not a member.
    async fn remove_member(
        &self,
        user_id: UserId,
        channel_id: &ChannelId,
    ) -> Result<bool, AppError>;
}

/// Direction of a membership change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipChange {
    Joined,
    Left,
}

/// Payload of a `membership-changed` broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipDelta {
    pub user_id: UserId,
    pub change: MembershipChange,
}

/// Membership roster kept in memory
///
/// Backs the standalone binary and tests; production deployments plug in a
/// client for the real membership service instead.
#[derive(Debug, Default)]
pub struct InMemoryMembership {
    members: DashMap<ChannelId, HashSet<UserId>>,
}

impl InMemoryMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a `channel -> [user ids]` roster
    pub fn from_roster(roster: &HashMap<String, Vec<i64>>) -> Self {
        let membership = Self::new();
        for (channel, users) in roster {
            let channel_id = ChannelId::new(channel.clone());
            for user in users {
                membership.join(UserId(*user), &channel_id);
            }
        }
        membership
    }

    /// Add a member. Returns false if already a member.
    pub fn join(&self, user_id: UserId, channel_id: &ChannelId) -> bool {
        self.members
            .entry(channel_id.clone())
            .or_default()
            .insert(user_id)
    }

    /// Remove a member. Returns false if not a member.
    pub fn leave(&self, user_id: UserId, channel_id: &ChannelId) -> bool {
        let removed = self
            .members
            .get_mut(channel_id)
            .map(|mut members| members.remove(&user_id))
            .unwrap_or(false);
        self.members
            .remove_if(channel_id, |_, members| members.is_empty());
        removed
    }

    pub fn members_of(&self, channel_id: &ChannelId) -> Vec<UserId> {
        let mut members: Vec<UserId> = self
            .members
            .get(channel_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        members.sort();
        members
    }
}

#[async_trait]
impl MembershipService for InMemoryMembership {
    async fn is_member(&self, user_id: UserId, channel_id: &ChannelId) -> Result<bool, AppError> {
        Ok(self
            .members
            .get(channel_id)
            .map(|members| members.contains(&user_id))
            .unwrap_or(false))
    }

    async fn add_member(&self, user_id: UserId, channel_id: &ChannelId) -> Result<bool, AppError> {
        Ok(self.join(user_id, channel_id))
    }

    async fn remove_member(
        &self,
        user_id: UserId,
        channel_id: &ChannelId,
    ) -> Result<bool, AppError> {
        Ok(self.leave(user_id, channel_id))
    }
}
