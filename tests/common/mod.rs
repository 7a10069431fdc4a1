#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use coachline::{
    config::{PresenceConfig, SessionConfig, TypingConfig},
    conversation::{ConversationKey, Participants, Role, UserId},
    error::{ChatError, ChatResult},
    identity::FixedIdentity,
    presence::PresenceTracker,
    retry::RetryPolicy,
    session::{ChatSession, ChatSessionController, ChatViewModel},
    store::{
        ChangeFeed, EventSource, EventStream, MemoryMessageStore, Message, MessageId, MessageStore,
        PublishingStore,
    },
    sync::RealtimeSync,
    typing::TypingIndicatorChannel,
    unread::UnreadCounter,
};
use futures_util::future::BoxFuture;

/// [`ChangeFeed`] that can be told to refuse the next few connects.
pub struct FlakySource {
    feed: ChangeFeed,
    failures: AtomicU32,
    connects: AtomicU32,
}

impl FlakySource {
    pub fn new(feed: ChangeFeed) -> Self {
        Self {
            feed,
            failures: AtomicU32::new(0),
            connects: AtomicU32::new(0),
        }
    }

    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl EventSource for FlakySource {
    fn connect(&self, key: ConversationKey) -> BoxFuture<'_, ChatResult<EventStream>> {
        Box::pin(async move {
            if self.should_fail() {
                return Err(ChatError::TransientNetwork("connection refused".into()));
            }
            self.feed.connect(key).await
        })
    }

    fn connect_user(&self, user: UserId) -> BoxFuture<'_, ChatResult<EventStream>> {
        self.feed.connect_user(user)
    }
}

/// Store whose `list` takes its snapshot, then lingers before answering.
pub struct SlowHistory {
    inner: Arc<PublishingStore<MemoryMessageStore>>,
    delay: Duration,
}

impl SlowHistory {
    pub fn new(inner: Arc<PublishingStore<MemoryMessageStore>>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

impl MessageStore for SlowHistory {
    fn append(&self, key: ConversationKey, sender: UserId, role: Role, body: String) -> BoxFuture<'_, ChatResult<Message>> {
        self.inner.append(key, sender, role, body)
    }

    fn list(&self, key: ConversationKey) -> BoxFuture<'_, ChatResult<Vec<Message>>> {
        Box::pin(async move {
            let snapshot = self.inner.list(key).await?;
            tokio::time::sleep(self.delay).await;
            Ok(snapshot)
        })
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
        self.inner.edit_versioned(id, requester, body, expected_version)
    }

    fn delete(&self, id: MessageId, requester: UserId) -> BoxFuture<'_, ChatResult<Message>> {
        self.inner.delete(id, requester)
    }

    fn mark_read<'a>(&'a self, ids: &'a [MessageId], recipient: UserId) -> BoxFuture<'a, ChatResult<Vec<Message>>> {
        self.inner.mark_read(ids, recipient)
    }

    fn mark_conversation_read(&self, key: ConversationKey, recipient: UserId) -> BoxFuture<'_, ChatResult<Vec<Message>>> {
        self.inner.mark_conversation_read(key, recipient)
    }

    fn unread_by_counterparty(&self, user: UserId) -> BoxFuture<'_, ChatResult<HashMap<UserId, usize>>> {
        self.inner.unread_by_counterparty(user)
    }
}

/// One in-process deployment: a published memory store and the realtime
/// services around it.
pub struct World {
    pub feed: ChangeFeed,
    pub store: Arc<PublishingStore<MemoryMessageStore>>,
    pub source: Arc<FlakySource>,
    pub sync: RealtimeSync,
    pub presence: PresenceTracker,
    pub typing: TypingIndicatorChannel,
    pub unread: UnreadCounter,
    pub participants: Participants,
}

impl World {
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::default())
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        let feed = ChangeFeed::new();
        let store = Arc::new(PublishingStore::new(MemoryMessageStore::new(), feed.clone()));
        let source = Arc::new(FlakySource::new(feed.clone()));
        Self {
            sync: RealtimeSync::new(source.clone(), store.clone(), policy),
            presence: PresenceTracker::new(PresenceConfig::default()),
            typing: TypingIndicatorChannel::new(TypingConfig::default()),
            unread: UnreadCounter::new(store.clone(), policy),
            participants: Participants::new(UserId::new(), UserId::new()).unwrap(),
            feed,
            store,
            source,
        }
    }

    pub fn coach(&self) -> UserId {
        self.participants.coach
    }

    pub fn trainee(&self) -> UserId {
        self.participants.trainee
    }

    pub fn key(&self) -> ConversationKey {
        self.participants.key()
    }

    /// Writes straight to the backing store without publishing, as if the
    /// event was lost in transit.
    pub fn silent_store(&self) -> MemoryMessageStore {
        self.store.inner().clone()
    }

    pub async fn open_as(&self, user: UserId) -> ChatSession {
        self.controller(user, self.store.clone())
            .open(self.participants)
            .await
            .unwrap()
    }

    pub fn controller(&self, user: UserId, store: Arc<dyn MessageStore>) -> ChatSessionController {
        ChatSessionController::new(
            Arc::new(FixedIdentity(user)),
            store,
            self.sync.clone(),
            self.presence.clone(),
            self.typing.clone(),
            SessionConfig::default(),
            RetryPolicy::default(),
        )
    }
}

/// Lets spawned tasks drain under paused time.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub async fn wait_for_view(session: &ChatSession, ready: impl FnMut(&ChatViewModel) -> bool) -> ChatViewModel {
    let mut model = session.watch();
    let mut ready = ready;
    let found = model.wait_for(|view| ready(view)).await.unwrap();
    found.clone()
}

pub fn bodies(view: &ChatViewModel) -> Vec<&str> {
    view.messages.iter().map(|m| m.body.as_str()).collect()
}
