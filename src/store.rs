//! Message persistence seam
//!
//! Submissions coming in over a connection are handed to the persistence
//! layer; only a stored message is ever broadcast.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::membership::MembershipService;
use crate::types::{ChannelId, UserId};

/// Content type of a chat message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    File,
}

/// Message as submitted by a client, before persistence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub content: String,
    pub message_type: MessageType,
}

/// Durably stored message; the payload of message broadcasts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub content: String,
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// External persistence layer
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Durably commit a new message
    async fn persist(
        &self,
        author_id: UserId,
        channel_id: &ChannelId,
        draft: MessageDraft,
    ) -> Result<StoredMessage, AppError>;

    /// Replace a message's content. Only its author may edit it.
    async fn update(
        &self,
        editor_id: UserId,
        message_id: i64,
        content: String,
    ) -> Result<StoredMessage, AppError>;

    /// Remove a message, returning the removed record. Only its author may
    /// delete it.
    async fn delete(
        &self,
        requester_id: UserId,
        message_id: i64,
    ) -> Result<StoredMessage, AppError>;
}

/// Message store kept in memory
///
/// Enforces the same authorship rule as the REST layer: only channel members
/// may post.
pub struct InMemoryMessageStore {
    membership: Arc<dyn MembershipService>,
    next_id: AtomicI64,
    messages: DashMap<i64, StoredMessage>,
}

impl InMemoryMessageStore {
    pub fn new(membership: Arc<dyn MembershipService>) -> Self {
        Self {
            membership,
            next_id: AtomicI64::new(1),
            messages: DashMap::new(),
        }
    }

    pub fn get(&self, id: i64) -> Option<StoredMessage> {
        self.messages.get(&id).map(|message| message.value().clone())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn persist(
        &self,
        author_id: UserId,
        channel_id: &ChannelId,
        draft: MessageDraft,
    ) -> Result<StoredMessage, AppError> {
        if draft.content.trim().is_empty() {
            return Err(AppError::Persistence("message content is empty".to_string()));
        }
        if !self.membership.is_member(author_id, channel_id).await? {
            return Err(AppError::NotAChannelMember {
                user_id: author_id,
                channel_id: channel_id.clone(),
            });
        }

        let now = Utc::now();
        let message = StoredMessage {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            channel_id: channel_id.clone(),
            author_id,
            content: draft.content,
            message_type: draft.message_type,
            created_at: now,
            updated_at: now,
        };
        self.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn update(
        &self,
        editor_id: UserId,
        message_id: i64,
        content: String,
    ) -> Result<StoredMessage, AppError> {
        if content.trim().is_empty() {
            return Err(AppError::Persistence("message content is empty".to_string()));
        }
        let mut message = self
            .messages
            .get_mut(&message_id)
            .ok_or(AppError::MessageNotFound(message_id))?;
        if message.author_id != editor_id {
            return Err(AppError::NotMessageAuthor {
                user_id: editor_id,
                message_id,
            });
        }

        message.content = content;
        message.updated_at = Utc::now();
        Ok(message.clone())
    }

    async fn delete(
        &self,
        requester_id: UserId,
        message_id: i64,
    ) -> Result<StoredMessage, AppError> {
        let removed = self
            .messages
            .remove_if(&message_id, |_, message| message.author_id == requester_id);
        match removed {
            Some((_, message)) => Ok(message),
            None if self.messages.contains_key(&message_id) => Err(AppError::NotMessageAuthor {
                user_id: requester_id,
                message_id,
            }),
            None => Err(AppError::MessageNotFound(message_id)),
        }
    }
}
