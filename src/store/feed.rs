use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use futures_util::{
    future::BoxFuture,
    stream::{self, BoxStream, StreamExt},
};
use tokio::sync::broadcast;

use super::{Message, MessageId, MessageStore, StoreEvent};
use crate::{
    conversation::{ConversationKey, Role, UserId},
    error::ChatResult,
};

/// Live events for one subscription. The stream ending means the connection
/// dropped and anything after that point may have been missed.
pub type EventStream = BoxStream<'static, StoreEvent>;

/// Where realtime subscribers get their events from.
pub trait EventSource: Send + Sync {
    fn connect(&self, key: ConversationKey) -> BoxFuture<'_, ChatResult<EventStream>>;

    /// Events for every conversation `user` takes part in.
    fn connect_user(&self, user: UserId) -> BoxFuture<'_, ChatResult<EventStream>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Topic {
    Conversation(ConversationKey),
    User(UserId),
}

const DEFAULT_CAPACITY: usize = 256;

/// In-process fan-out of committed store mutations, one broadcast channel per
/// conversation and per participant.
#[derive(Clone)]
pub struct ChangeFeed {
    topics: Arc<Mutex<HashMap<Topic, broadcast::Sender<StoreEvent>>>>,
    capacity: usize,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::default(),
            capacity,
        }
    }

    pub fn publish(&self, event: StoreEvent) {
        let key = event.conversation_key();
        let (a, b) = key.members();
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        for topic in [Topic::Conversation(key), Topic::User(a), Topic::User(b)] {
            let Some(tx) = topics.get(&topic) else {
                continue;
            };
            if tx.send(event.clone()).is_err() {
                // nobody listening any more
                topics.remove(&topic);
            }
        }
    }

    /// Drops every live subscription on `key`; subscribers see their stream end.
    pub fn disconnect(&self, key: ConversationKey) {
        let removed = self
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&Topic::Conversation(key));
        if removed.is_some() {
            tracing::info!(%key, "conversation feed dropped");
        }
    }

    pub fn subscriber_count(&self, key: ConversationKey) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Topic::Conversation(key))
            .map_or(0, broadcast::Sender::receiver_count)
    }

    fn subscribe(&self, topic: Topic) -> EventStream {
        let rx = {
            let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
            // topics whose last stream was dropped
            topics.retain(|_, tx| tx.receiver_count() > 0);
            topics
                .entry(topic)
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(event) => Some((event, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscriber fell behind, closing stream");
                    None
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        })
        .boxed()
    }
}

impl EventSource for ChangeFeed {
    fn connect(&self, key: ConversationKey) -> BoxFuture<'_, ChatResult<EventStream>> {
        let stream = self.subscribe(Topic::Conversation(key));
        Box::pin(async move { Ok(stream) })
    }

    fn connect_user(&self, user: UserId) -> BoxFuture<'_, ChatResult<EventStream>> {
        let stream = self.subscribe(Topic::User(user));
        Box::pin(async move { Ok(stream) })
    }
}

/// Wraps a store so every committed mutation is published on a [`ChangeFeed`].
pub struct PublishingStore<S> {
    inner: S,
    feed: ChangeFeed,
}

impl<S: MessageStore> PublishingStore<S> {
    pub fn new(inner: S, feed: ChangeFeed) -> Self {
        Self { inner, feed }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn publish_updates(&self, messages: &[Message]) {
        for message in messages {
            self.feed.publish(StoreEvent::Updated(message.clone()));
        }
    }
}

impl<S: MessageStore> MessageStore for PublishingStore<S> {
    fn append(
        &self,
        key: ConversationKey,
        sender: UserId,
        role: Role,
        body: String,
    ) -> BoxFuture<'_, ChatResult<Message>> {
        Box::pin(async move {
            let message = self.inner.append(key, sender, role, body).await?;
            self.feed.publish(StoreEvent::Inserted(message.clone()));
            Ok(message)
        })
    }

    fn list(&self, key: ConversationKey) -> BoxFuture<'_, ChatResult<Vec<Message>>> {
        self.inner.list(key)
    }

    fn get(&self, id: MessageId) -> BoxFuture<'_, ChatResult<Message>> {
        self.inner.get(id)
    }

    fn edit_versioned(
        &self,
        id: MessageId,
        requester: UserId,
        body: String,
        expected_version: Option<u32>,
    ) -> BoxFuture<'_, ChatResult<Message>> {
        Box::pin(async move {
            let message = self.inner.edit_versioned(id, requester, body, expected_version).await?;
            self.feed.publish(StoreEvent::Updated(message.clone()));
            Ok(message)
        })
    }

    fn delete(&self, id: MessageId, requester: UserId) -> BoxFuture<'_, ChatResult<Message>> {
        Box::pin(async move {
            let message = self.inner.delete(id, requester).await?;
            self.feed.publish(StoreEvent::Deleted {
                conversation_key: message.conversation_key,
                id: message.id,
            });
            Ok(message)
        })
    }

    fn mark_read<'a>(
        &'a self,
        ids: &'a [MessageId],
        recipient: UserId,
    ) -> BoxFuture<'a, ChatResult<Vec<Message>>> {
        Box::pin(async move {
            let changed = self.inner.mark_read(ids, recipient).await?;
            self.publish_updates(&changed);
            Ok(changed)
        })
    }

    fn mark_conversation_read(
        &self,
        key: ConversationKey,
        recipient: UserId,
    ) -> BoxFuture<'_, ChatResult<Vec<Message>>> {
        Box::pin(async move {
            let changed = self.inner.mark_conversation_read(key, recipient).await?;
            self.publish_updates(&changed);
            Ok(changed)
        })
    }

    fn unread_by_counterparty(&self, user: UserId) -> BoxFuture<'_, ChatResult<HashMap<UserId, usize>>> {
        self.inner.unread_by_counterparty(user)
    }
}

#[cfg(test)]
impl ChangeFeed {
    fn topic_count(&self) -> usize {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
