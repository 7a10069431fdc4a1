use std::{collections::HashMap, fmt, str::FromStr};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    conversation::{ConversationKey, Role, UserId},
    error::{ChatError, ChatResult},
};

pub mod feed;
pub mod memory;
pub mod sqlite;

pub use feed::{ChangeFeed, EventSource, EventStream, PublishingStore};
pub use memory::MemoryMessageStore;
pub use sqlite::SqliteMessageStore;

pub const DEFAULT_MAX_BODY_CHARS: usize = 4_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ChatError;

    fn from_str(s: &str) -> ChatResult<Self> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_key: ConversationKey,
    pub sender_id: UserId,
    pub sender_role: Role,
    pub body: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    pub is_read: bool,
    /// Number of edits applied so far.
    pub edit_version: u32,
}

impl Message {
    /// Total order inside a conversation: creation time, then id.
    pub fn order_key(&self) -> (OffsetDateTime, MessageId) {
        (self.created_at, self.id)
    }

    pub fn recipient(&self) -> Option<UserId> {
        self.conversation_key.counterparty_of(self.sender_id)
    }

    /// Which of two copies of the same message is newer. Read flags only ever
    /// turn on, so a read copy wins over an unread one at the same edit.
    pub fn supersedes(&self, other: &Message) -> bool {
        (self.updated_at, self.edit_version, self.is_read)
            > (other.updated_at, other.edit_version, other.is_read)
    }
}

/// A committed mutation, as fanned out to realtime subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    Inserted(Message),
    Updated(Message),
    Deleted {
        conversation_key: ConversationKey,
        id: MessageId,
    },
}

impl StoreEvent {
    pub fn conversation_key(&self) -> ConversationKey {
        match self {
            StoreEvent::Inserted(message) | StoreEvent::Updated(message) => message.conversation_key,
            StoreEvent::Deleted { conversation_key, .. } => *conversation_key,
        }
    }
}

/// Durable message records for coach–trainee threads.
///
/// Implementations assign `created_at`/`updated_at` themselves and enforce the
/// sender-only rules for edits and deletes and the recipient-only rule for read
/// receipts.
pub trait MessageStore: Send + Sync {
    fn append(
        &self,
        key: ConversationKey,
        sender: UserId,
        role: Role,
        body: String,
    ) -> BoxFuture<'_, ChatResult<Message>>;

    /// Ascending by `(created_at, id)`.
    fn list(&self, key: ConversationKey) -> BoxFuture<'_, ChatResult<Vec<Message>>>;

    fn get(&self, id: MessageId) -> BoxFuture<'_, ChatResult<Message>>;

    /// Applies an edit if the requester is the sender. With `expected_version`
    /// set, the edit only lands on that exact version; without it the latest
    /// `updated_at` wins.
    fn edit_versioned(
        &self,
        id: MessageId,
        requester: UserId,
        body: String,
        expected_version: Option<u32>,
    ) -> BoxFuture<'_, ChatResult<Message>>;

    fn edit(&self, id: MessageId, requester: UserId, body: String) -> BoxFuture<'_, ChatResult<Message>> {
        self.edit_versioned(id, requester, body, None)
    }

    /// Hard delete; returns the removed record.
    fn delete(&self, id: MessageId, requester: UserId) -> BoxFuture<'_, ChatResult<Message>>;

    /// Flips `is_read` on the given messages addressed to `recipient`. Returns
    /// only the messages that actually changed.
    fn mark_read<'a>(
        &'a self,
        ids: &'a [MessageId],
        recipient: UserId,
    ) -> BoxFuture<'a, ChatResult<Vec<Message>>>;

    fn mark_conversation_read(
        &self,
        key: ConversationKey,
        recipient: UserId,
    ) -> BoxFuture<'_, ChatResult<Vec<Message>>>;

    /// Unread messages addressed to `user`, grouped by sender.
    fn unread_by_counterparty(&self, user: UserId) -> BoxFuture<'_, ChatResult<HashMap<UserId, usize>>>;
}

pub(crate) fn validate_body(body: &str, max_chars: usize) -> ChatResult<()> {
    if body.trim().is_empty() {
        return Err(ChatError::validation("message body is empty"));
    }
    if body.chars().count() > max_chars {
        return Err(ChatError::validation(format!("message body is longer than {max_chars} characters")));
    }
    Ok(())
}

pub(crate) fn validate_sender(key: ConversationKey, sender: UserId) -> ChatResult<()> {
    if !key.contains(sender) {
        return Err(ChatError::validation(format!("{sender} is not part of conversation {key}")));
    }
    Ok(())
}
