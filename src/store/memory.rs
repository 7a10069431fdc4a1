use std::{collections::HashMap, sync::Arc};

use futures_util::future::BoxFuture;
use tokio::sync::RwLock;

use super::{DEFAULT_MAX_BODY_CHARS, Message, MessageId, MessageStore, validate_body, validate_sender};
use crate::{
    clock::MonotonicClock,
    conversation::{ConversationKey, Role, UserId},
    error::{ChatError, ChatResult},
};

/// In-process [`MessageStore`] with the same rules as the sqlite one.
#[derive(Clone)]
pub struct MemoryMessageStore {
    messages: Arc<RwLock<HashMap<MessageId, Message>>>,
    clock: Arc<MonotonicClock>,
    max_body_chars: usize,
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self {
            messages: Arc::default(),
            clock: Arc::default(),
            max_body_chars: DEFAULT_MAX_BODY_CHARS,
        }
    }
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_body_chars(mut self, max_body_chars: usize) -> Self {
        self.max_body_chars = max_body_chars;
        self
    }

    fn owned_by(message: &Message, requester: UserId) -> ChatResult<()> {
        if message.sender_id != requester {
            return Err(ChatError::Authorization(format!(
                "{requester} did not send message {}",
                message.id
            )));
        }
        Ok(())
    }
}

impl MessageStore for MemoryMessageStore {
    fn append(
        &self,
        key: ConversationKey,
        sender: UserId,
        role: Role,
        body: String,
    ) -> BoxFuture<'_, ChatResult<Message>> {
        Box::pin(async move {
            validate_body(&body, self.max_body_chars)?;
            validate_sender(key, sender)?;

            let message = Message {
                id: MessageId::new(),
                conversation_key: key,
                sender_id: sender,
                sender_role: role,
                body,
                created_at: self.clock.now(),
                updated_at: None,
                is_read: false,
                edit_version: 0,
            };
            self.messages.write().await.insert(message.id, message.clone());
            Ok(message)
        })
    }

    fn list(&self, key: ConversationKey) -> BoxFuture<'_, ChatResult<Vec<Message>>> {
        Box::pin(async move {
            let mut found: Vec<Message> = self
                .messages
                .read()
                .await
                .values()
                .filter(|message| message.conversation_key == key)
                .cloned()
                .collect();
            found.sort_by_key(Message::order_key);
            Ok(found)
        })
    }

    fn get(&self, id: MessageId) -> BoxFuture<'_, ChatResult<Message>> {
        Box::pin(async move {
            self.messages
                .read()
                .await
                .get(&id)
                .cloned()
                .ok_or_else(|| ChatError::NotFound(format!("message {id}")))
        })
    }

    fn edit_versioned(
        &self,
        id: MessageId,
        requester: UserId,
        body: String,
        expected_version: Option<u32>,
    ) -> BoxFuture<'_, ChatResult<Message>> {
        Box::pin(async move {
            validate_body(&body, self.max_body_chars)?;
            let edited_at = self.clock.now();

            let mut messages = self.messages.write().await;
            let message = messages
                .get_mut(&id)
                .ok_or_else(|| ChatError::NotFound(format!("message {id}")))?;
            Self::owned_by(message, requester)?;

            if let Some(expected) = expected_version {
                if message.edit_version != expected {
                    return Err(ChatError::Conflict {
                        expected,
                        actual: message.edit_version,
                    });
                }
            }
            if message.updated_at.is_some_and(|at| at >= edited_at) {
                return Ok(message.clone());
            }

            message.body = body;
            message.updated_at = Some(edited_at);
            message.edit_version += 1;
            Ok(message.clone())
        })
    }

    fn delete(&self, id: MessageId, requester: UserId) -> BoxFuture<'_, ChatResult<Message>> {
        Box::pin(async move {
            let mut messages = self.messages.write().await;
            let message = messages
                .get(&id)
                .ok_or_else(|| ChatError::NotFound(format!("message {id}")))?;
            Self::owned_by(message, requester)?;
            messages
                .remove(&id)
                .ok_or_else(|| ChatError::NotFound(format!("message {id}")))
        })
    }

    fn mark_read<'a>(
        &'a self,
        ids: &'a [MessageId],
        recipient: UserId,
    ) -> BoxFuture<'a, ChatResult<Vec<Message>>> {
        Box::pin(async move {
            let mut messages = self.messages.write().await;
            let mut changed = Vec::new();
            for id in ids {
                let Some(message) = messages.get_mut(id) else {
                    continue;
                };
                if message.is_read || message.recipient() != Some(recipient) {
                    continue;
                }
                message.is_read = true;
                changed.push(message.clone());
            }
            changed.sort_by_key(Message::order_key);
            Ok(changed)
        })
    }

    fn mark_conversation_read(
        &self,
        key: ConversationKey,
        recipient: UserId,
    ) -> BoxFuture<'_, ChatResult<Vec<Message>>> {
        Box::pin(async move {
            let mut messages = self.messages.write().await;
            let mut changed: Vec<Message> = messages
                .values_mut()
                .filter(|m| m.conversation_key == key && !m.is_read && m.recipient() == Some(recipient))
                .map(|m| {
                    m.is_read = true;
                    m.clone()
                })
                .collect();
            changed.sort_by_key(Message::order_key);
            Ok(changed)
        })
    }

    fn unread_by_counterparty(&self, user: UserId) -> BoxFuture<'_, ChatResult<HashMap<UserId, usize>>> {
        Box::pin(async move {
            let mut counts = HashMap::new();
            for message in self.messages.read().await.values() {
                if !message.is_read && message.recipient() == Some(user) {
                    *counts.entry(message.sender_id).or_default() += 1;
                }
            }
            Ok(counts)
        })
    }
}
