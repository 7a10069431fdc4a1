use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::StreamExt;
use serde::Serialize;
use tokio::{
    sync::{Notify, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    conversation::ConversationKey,
    error::ChatError,
    retry::{self, RetryPolicy},
    store::{EventSource, EventStream, Message, MessageId, MessageStore, StoreEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    /// Not (yet) connected and still trying. Also the state before the first connect.
    Reconnecting,
    /// Retries exhausted; waiting for [`RealtimeSync::reconnect_now`].
    Disconnected,
}

/// Receives remote changes for one conversation.
///
/// Delivery is at-least-once, so every method must be idempotent: re-applying
/// an insert, update or delete that already landed is a no-op.
pub trait SyncHandler: Send + Sync + 'static {
    fn on_insert(&self, message: Message);
    fn on_update(&self, message: Message);
    fn on_delete(&self, id: MessageId);
    /// A full history fetch is about to start. Changes delivered from here on
    /// may be newer than what that fetch returns.
    fn begin_resync(&self) {}
    /// Full history as of the fetch announced by [`SyncHandler::begin_resync`].
    fn on_resync(&self, messages: Vec<Message>);
}

struct Inner {
    source: Arc<dyn EventSource>,
    store: Arc<dyn MessageStore>,
    policy: RetryPolicy,
    retry_now: Notify,
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, watch::Receiver<ConnectionStatus>>>,
    shutdown: CancellationToken,
}

/// Bridges store mutations made by other clients into this client's views.
#[derive(Clone)]
pub struct RealtimeSync {
    inner: Arc<Inner>,
}

impl RealtimeSync {
    pub fn new(source: Arc<dyn EventSource>, store: Arc<dyn MessageStore>, policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                store,
                policy,
                retry_now: Notify::new(),
                next_id: AtomicU64::new(0),
                live: Mutex::default(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn subscribe(&self, key: ConversationKey, handler: Arc<dyn SyncHandler>) -> SubscriptionHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Reconnecting);
        self.inner
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, status_rx.clone());

        let token = self.inner.shutdown.child_token();
        let link = Link {
            inner: self.inner.clone(),
            key,
            handler,
            status: status_tx,
            token: token.clone(),
        };
        tokio::spawn(link.run());

        SubscriptionHandle {
            id,
            key,
            inner: self.inner.clone(),
            status: status_rx,
            token,
        }
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        drop(handle);
    }

    /// Worst status across open subscriptions; `Connected` when there are none.
    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|status| *status.borrow())
            .max()
            .unwrap_or(ConnectionStatus::Connected)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Wakes subscriptions that gave up, starting a fresh round of attempts.
    pub fn reconnect_now(&self) {
        self.inner.retry_now.notify_waiters();
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

/// One open subscription. Dropping it unsubscribes.
pub struct SubscriptionHandle {
    id: u64,
    key: ConversationKey,
    inner: Arc<Inner>,
    status: watch::Receiver<ConnectionStatus>,
    token: CancellationToken,
}

impl SubscriptionHandle {
    pub fn key(&self) -> ConversationKey {
        self.key
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Resolves once the first connect attempt round settled, either way.
    pub async fn ready(&self) -> ConnectionStatus {
        let mut status = self.status.clone();
        match status.wait_for(|s| *s != ConnectionStatus::Reconnecting).await {
            Ok(settled) => *settled,
            Err(_) => ConnectionStatus::Disconnected,
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.token.cancel();
        self.inner
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        tracing::debug!(key = %self.key, "realtime subscription closed");
    }
}

/// The task behind a [`SubscriptionHandle`].
struct Link {
    inner: Arc<Inner>,
    key: ConversationKey,
    handler: Arc<dyn SyncHandler>,
    status: watch::Sender<ConnectionStatus>,
    token: CancellationToken,
}

impl Link {
    async fn run(self) {
        let policy = self.inner.policy;
        let mut reconnecting = false;
        // consecutive rounds that failed to reconcile or dropped right after connecting
        let mut failures = 0;

        loop {
            let Some(mut events) = self.connect().await else {
                return;
            };

            if reconnecting && !self.reconcile().await {
                drop(events);
                failures += 1;
            } else {
                self.status.send_replace(ConnectionStatus::Connected);
                tracing::info!(key = %self.key, "realtime connected");

                let up_since = Instant::now();
                if !self.pump(&mut events).await {
                    return;
                }

                tracing::warn!(key = %self.key, error = %ChatError::SubscriptionLost, "reconnecting");
                self.status.send_replace(ConnectionStatus::Reconnecting);
                reconnecting = true;
                if up_since.elapsed() < policy.max_delay {
                    failures += 1;
                } else {
                    failures = 0;
                }
            }

            if failures == 0 {
                continue;
            }
            if failures < policy.max_attempts {
                let delay = policy.delay_for(failures);
                tracing::debug!(key = %self.key, failures, ?delay, "backing off before reconnect");
                tokio::select! {
                    _ = self.token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                tracing::error!(key = %self.key, failures, "realtime unstable, giving up");
                if !self.park().await {
                    return;
                }
                failures = 0;
            }
        }
    }

    /// Connects with bounded backoff. After the last attempt the link parks in
    /// `Disconnected` until a manual retry. `None` means cancelled.
    async fn connect(&self) -> Option<EventStream> {
        let policy = self.inner.policy;
        let mut attempt = 1;

        loop {
            let err = tokio::select! {
                _ = self.token.cancelled() => return None,
                connected = self.inner.source.connect(self.key) => match connected {
                    Ok(events) => return Some(events),
                    Err(err) => err,
                },
            };

            if attempt < policy.max_attempts {
                let delay = policy.delay_for(attempt);
                tracing::debug!(key = %self.key, %err, attempt, ?delay, "connect failed");
                tokio::select! {
                    _ = self.token.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
                continue;
            }

            tracing::error!(key = %self.key, %err, "realtime disconnected, giving up");
            if !self.park().await {
                return None;
            }
            attempt = 1;
        }
    }

    /// Sits in `Disconnected` until [`RealtimeSync::reconnect_now`]. `false` means cancelled.
    async fn park(&self) -> bool {
        // registered before publishing, so a retry issued on seeing `Disconnected` is not lost
        let retry = self.inner.retry_now.notified();
        tokio::pin!(retry);
        retry.as_mut().enable();

        self.status.send_replace(ConnectionStatus::Disconnected);
        tokio::select! {
            _ = self.token.cancelled() => return false,
            _ = retry => {}
        }
        self.status.send_replace(ConnectionStatus::Reconnecting);
        true
    }

    /// Re-fetches the whole conversation instead of trusting anything buffered.
    async fn reconcile(&self) -> bool {
        let store = self.inner.store.clone();
        let key = self.key;
        self.handler.begin_resync();
        let fetched = tokio::select! {
            _ = self.token.cancelled() => return false,
            fetched = retry::with_backoff(&self.inner.policy, "reconcile", || store.list(key)) => fetched,
        };

        match fetched {
            Ok(messages) => {
                tracing::info!(%key, count = messages.len(), "reconciled after reconnect");
                self.handler.on_resync(messages);
                true
            }
            Err(err) => {
                tracing::warn!(%key, %err, "reconcile failed");
                false
            }
        }
    }

    /// Forwards events until the stream ends (`true`) or the link is cancelled (`false`).
    async fn pump(&self, events: &mut EventStream) -> bool {
        loop {
            let event = tokio::select! {
                _ = self.token.cancelled() => return false,
                event = events.next() => event,
            };
            match event {
                Some(StoreEvent::Inserted(message)) => self.handler.on_insert(message),
                Some(StoreEvent::Updated(message)) => self.handler.on_update(message),
                Some(StoreEvent::Deleted { id, .. }) => self.handler.on_delete(id),
                None => return true,
            }
        }
    }
}
