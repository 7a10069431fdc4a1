mod view;

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

pub use view::{ConversationView, FetchMark, RenderedMessage, render_markdown};

use crate::{
    config::SessionConfig,
    conversation::{ConversationKey, Participants, Role, UserId},
    error::{ChatError, ChatResult},
    identity::IdentityProvider,
    presence::{PresenceSnapshot, PresenceSubscription, PresenceTracker},
    retry::{self, RetryPolicy},
    store::{Message, MessageId, MessageStore, validate_body},
    sync::{ConnectionStatus, RealtimeSync, SubscriptionHandle, SyncHandler},
    typing::{TypingIndicatorChannel, TypingSubscription},
};

/// Everything a chat screen needs to draw one conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatViewModel {
    pub conversation_key: ConversationKey,
    pub viewer: UserId,
    pub counterparty: UserId,
    pub messages: Vec<RenderedMessage>,
    pub counterparty_presence: PresenceSnapshot,
    pub counterparty_typing: bool,
    pub connection: ConnectionStatus,
    /// User-facing text for the last failed action, cleared by the next success.
    pub last_error: Option<String>,
}

struct LiveState {
    view: ConversationView,
    /// Start of the earliest history fetch still in flight.
    fetch_from: Option<FetchMark>,
    presence: PresenceSnapshot,
    typing: bool,
    connection: ConnectionStatus,
    last_error: Option<String>,
}

/// Shared between the session, its realtime subscription and its background
/// tasks. Every change republishes the view model.
struct Live {
    key: ConversationKey,
    viewer: UserId,
    counterparty: UserId,
    state: Mutex<LiveState>,
    model: watch::Sender<ChatViewModel>,
    to_mark: mpsc::UnboundedSender<MessageId>,
}

impl Live {
    fn update(&self, apply: impl FnOnce(&mut LiveState) -> bool) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !apply(&mut state) {
            return false;
        }
        self.model.send_replace(ChatViewModel {
            conversation_key: self.key,
            viewer: self.viewer,
            counterparty: self.counterparty,
            messages: state.view.rendered(),
            counterparty_presence: state.presence,
            counterparty_typing: state.typing,
            connection: state.connection,
            last_error: state.last_error.clone(),
        });
        true
    }

    fn queue_unread(&self, ids: impl IntoIterator<Item = MessageId>) {
        for id in ids {
            // the batcher is gone once the session closed
            let _ = self.to_mark.send(id);
        }
    }

    fn record<T>(&self, result: &ChatResult<T>) {
        let error = result.as_ref().err().map(ChatError::user_message);
        self.update(|state| {
            if state.last_error == error {
                return false;
            }
            state.last_error = error;
            true
        });
    }
}

impl SyncHandler for Live {
    fn on_insert(&self, message: Message) {
        let incoming = (message.sender_id != self.viewer && !message.is_read).then_some(message.id);
        if self.update(|state| state.view.apply_insert(message)) {
            self.queue_unread(incoming);
        }
    }

    fn on_update(&self, message: Message) {
        let incoming = (message.sender_id != self.viewer && !message.is_read).then_some(message.id);
        if self.update(|state| state.view.apply_update(message)) {
            self.queue_unread(incoming);
        }
    }

    fn on_delete(&self, id: MessageId) {
        self.update(|state| state.view.apply_delete(id));
    }

    fn begin_resync(&self) {
        self.update(|state| {
            let mark = state.view.fetch_mark();
            state.fetch_from.get_or_insert(mark);
            false
        });
    }

    fn on_resync(&self, messages: Vec<Message>) {
        let mut unread = Vec::new();
        self.update(|state| {
            let since = state.fetch_from.take().unwrap_or_else(|| state.view.fetch_mark());
            state.view.merge(messages, since);
            unread = state.view.unread_incoming();
            true
        });
        self.queue_unread(unread);
    }
}

/// Opens chat sessions for the signed-in user.
#[derive(Clone)]
pub struct ChatSessionController {
    identity: Arc<dyn IdentityProvider>,
    store: Arc<dyn MessageStore>,
    sync: RealtimeSync,
    presence: PresenceTracker,
    typing: TypingIndicatorChannel,
    config: SessionConfig,
    retry: RetryPolicy,
}

impl ChatSessionController {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn MessageStore>,
        sync: RealtimeSync,
        presence: PresenceTracker,
        typing: TypingIndicatorChannel,
        config: SessionConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            identity,
            store,
            sync,
            presence,
            typing,
            config,
            retry,
        }
    }

    /// Subscribes to the conversation, loads its history, starts watching the
    /// counterparty and begins marking incoming messages read.
    pub async fn open(&self, participants: Participants) -> ChatResult<ChatSession> {
        let viewer = self.identity.current_user();
        let role = participants
            .role_of(viewer)
            .ok_or_else(|| ChatError::validation(format!("{viewer} is not part of this conversation")))?;
        let counterparty = participants
            .counterparty_of(viewer)
            .ok_or_else(|| ChatError::validation("conversation has no counterparty"))?;
        let key = participants.key();

        let (to_mark, marks) = mpsc::unbounded_channel();
        let (model_tx, model) = watch::channel(ChatViewModel {
            conversation_key: key,
            viewer,
            counterparty,
            messages: Vec::new(),
            counterparty_presence: self.presence.snapshot(counterparty),
            counterparty_typing: false,
            connection: ConnectionStatus::Reconnecting,
            last_error: None,
        });
        let live = Arc::new(Live {
            key,
            viewer,
            counterparty,
            state: Mutex::new(LiveState {
                view: ConversationView::new(viewer),
                fetch_from: None,
                presence: self.presence.snapshot(counterparty),
                typing: self.typing.is_typing(counterparty, key),
                connection: ConnectionStatus::Reconnecting,
                last_error: None,
            }),
            model: model_tx,
            to_mark,
        });

        // subscribe before loading so nothing committed in between is missed
        live.begin_resync();
        let subscription = self.sync.subscribe(key, live.clone());
        let connection = subscription.ready().await;
        live.update(|state| {
            state.connection = connection;
            true
        });

        let history = retry::with_backoff(&self.retry, "load history", || self.store.list(key)).await?;
        live.on_resync(history);

        let token = CancellationToken::new();
        tokio::spawn(follow_connection(live.clone(), subscription.watch_status(), token.clone()));
        tokio::spawn(
            ReadBatcher {
                store: self.store.clone(),
                live: live.clone(),
                window: self.config.mark_read_batch,
            }
            .run(marks, token.clone()),
        );

        let presence = {
            let live = live.clone();
            self.presence.subscribe(&[counterparty], move |update| {
                live.update(|state| {
                    let snapshot = PresenceSnapshot {
                        is_online: update.is_online,
                        last_seen: update.last_seen,
                    };
                    let changed = state.presence != snapshot;
                    state.presence = snapshot;
                    changed
                });
            })
        };
        let typing = {
            let live = live.clone();
            self.typing.subscribe(key, viewer, move |event| {
                live.update(|state| {
                    let changed = state.typing != event.is_typing;
                    state.typing = event.is_typing;
                    changed
                });
            })
        };

        tracing::info!(%key, %viewer, %role, "chat session opened");
        Ok(ChatSession {
            viewer,
            role,
            key,
            store: self.store.clone(),
            typing: self.typing.clone(),
            retry: self.retry,
            max_body_chars: self.config.max_body_chars,
            live,
            model,
            token,
            _subscription: subscription,
            _presence: presence,
            _typing: typing,
        })
    }
}

async fn follow_connection(live: Arc<Live>, mut status: watch::Receiver<ConnectionStatus>, token: CancellationToken) {
    loop {
        let changed = tokio::select! {
            _ = token.cancelled() => break,
            changed = status.changed() => changed,
        };
        if changed.is_err() {
            break;
        }
        let connection = *status.borrow_and_update();
        live.update(|state| {
            let changed = state.connection != connection;
            state.connection = connection;
            changed
        });
    }
}

enum Step {
    Queued(MessageId),
    Flush,
    Stop,
}

/// Collects incoming message ids and marks them read once things go quiet.
struct ReadBatcher {
    store: Arc<dyn MessageStore>,
    live: Arc<Live>,
    window: std::time::Duration,
}

impl ReadBatcher {
    async fn run(self, mut marks: mpsc::UnboundedReceiver<MessageId>, token: CancellationToken) {
        let mut pending: Vec<MessageId> = Vec::new();

        loop {
            let step = tokio::select! {
                _ = token.cancelled() => Step::Stop,
                id = marks.recv() => id.map_or(Step::Stop, Step::Queued),
                _ = tokio::time::sleep(self.window), if !pending.is_empty() => Step::Flush,
            };

            match step {
                Step::Queued(id) => {
                    if !pending.contains(&id) {
                        pending.push(id);
                    }
                }
                Step::Flush => {
                    let batch = std::mem::take(&mut pending);
                    let marked = tokio::select! {
                        _ = token.cancelled() => break,
                        marked = self.store.mark_read(&batch, self.live.viewer) => marked,
                    };
                    match marked {
                        Ok(changed) => {
                            tracing::debug!(key = %self.live.key, count = changed.len(), "marked read");
                            for message in changed {
                                self.live.on_update(message);
                            }
                        }
                        Err(err) if err.is_transient() => {
                            tracing::debug!(%err, "mark read deferred");
                            pending = batch;
                        }
                        Err(err) => tracing::warn!(%err, "mark read failed"),
                    }
                }
                Step::Stop => break,
            }
        }
    }
}

/// One open conversation. Dropping it (or [`ChatSession::close`]) cancels the
/// realtime, presence and typing subscriptions and any pending read batch.
pub struct ChatSession {
    viewer: UserId,
    role: Role,
    key: ConversationKey,
    store: Arc<dyn MessageStore>,
    typing: TypingIndicatorChannel,
    retry: RetryPolicy,
    max_body_chars: usize,
    live: Arc<Live>,
    model: watch::Receiver<ChatViewModel>,
    token: CancellationToken,
    _subscription: SubscriptionHandle,
    _presence: PresenceSubscription,
    _typing: TypingSubscription,
}

impl ChatSession {
    pub fn key(&self) -> ConversationKey {
        self.key
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn view(&self) -> ChatViewModel {
        self.model.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ChatViewModel> {
        self.model.clone()
    }

    /// Typing signal from the compose box: any text means typing, empty means stopped.
    pub fn input_changed(&self, text: &str) -> ChatResult<()> {
        if text.is_empty() {
            self.typing.stop_typing(self.viewer, self.key);
            return Ok(());
        }
        self.typing.notify_typing(self.viewer, self.key)
    }

    /// Sends once. A failure is reported, never retried behind the user's back.
    pub async fn send(&self, body: impl Into<String>) -> ChatResult<Message> {
        let body = body.into();
        self.typing.stop_typing(self.viewer, self.key);

        let sent = match validate_body(&body, self.max_body_chars) {
            Ok(()) => self.store.append(self.key, self.viewer, self.role, body).await,
            Err(err) => Err(err),
        };
        self.live.record(&sent);
        let message = sent.inspect_err(|err| tracing::warn!(key = %self.key, %err, "send failed"))?;
        self.live.on_insert(message.clone());
        Ok(message)
    }

    pub async fn edit(&self, id: MessageId, body: impl Into<String>) -> ChatResult<Message> {
        self.edit_versioned(id, body.into(), None).await
    }

    /// Edit that fails with [`ChatError::Conflict`] if someone else edited first.
    pub async fn edit_if_version(&self, id: MessageId, body: impl Into<String>, version: u32) -> ChatResult<Message> {
        self.edit_versioned(id, body.into(), Some(version)).await
    }

    async fn edit_versioned(&self, id: MessageId, body: String, version: Option<u32>) -> ChatResult<Message> {
        let edited = self.store.edit_versioned(id, self.viewer, body, version).await;
        self.live.record(&edited);
        let message = edited.inspect_err(|err| tracing::warn!(%id, %err, "edit failed"))?;
        self.live.on_update(message.clone());
        Ok(message)
    }

    pub async fn delete(&self, id: MessageId) -> ChatResult<()> {
        let deleted = self.store.delete(id, self.viewer).await;
        self.live.record(&deleted);
        deleted.inspect_err(|err| tracing::warn!(%id, %err, "delete failed"))?;
        self.live.on_delete(id);
        Ok(())
    }

    pub async fn mark_read(&self, ids: &[MessageId]) -> ChatResult<Vec<Message>> {
        let marked = self.store.mark_read(ids, self.viewer).await;
        self.apply_marked(marked)
    }

    pub async fn mark_all_read(&self) -> ChatResult<Vec<Message>> {
        let marked = self.store.mark_conversation_read(self.key, self.viewer).await;
        self.apply_marked(marked)
    }

    /// Reloads the whole history from the store.
    pub async fn reload(&self) -> ChatResult<()> {
        let key = self.key;
        let store = &self.store;
        self.live.begin_resync();
        let history = retry::with_backoff(&self.retry, "reload history", || store.list(key)).await;
        self.live.record(&history);
        self.live.on_resync(history?);
        Ok(())
    }

    pub fn close(self) {}

    fn apply_marked(&self, marked: ChatResult<Vec<Message>>) -> ChatResult<Vec<Message>> {
        self.live.record(&marked);
        let changed = marked?;
        for message in &changed {
            self.live.on_update(message.clone());
        }
        Ok(changed)
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.token.cancel();
        self.typing.stop_typing(self.viewer, self.key);
        tracing::info!(key = %self.key, viewer = %self.viewer, "chat session closed");
    }
}
