use std::{collections::HashMap, sync::Arc};

use futures_util::StreamExt;
use serde::Serialize;
use tokio::{
    sync::{Notify, watch},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::UnreadConfig,
    conversation::UserId,
    error::ChatResult,
    retry::{self, RetryPolicy},
    store::{EventSource, EventStream, MessageStore, StoreEvent},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnreadSummary {
    pub total: usize,
    pub by_counterparty: HashMap<UserId, usize>,
}

impl UnreadSummary {
    pub fn count_for(&self, counterparty: UserId) -> usize {
        self.by_counterparty.get(&counterparty).copied().unwrap_or(0)
    }
}

/// Unread counts derived from the store on every call. Nothing is kept
/// between calls, so however many triggers fire, a count can never drift.
#[derive(Clone)]
pub struct UnreadCounter {
    store: Arc<dyn MessageStore>,
    retry: RetryPolicy,
}

impl UnreadCounter {
    pub fn new(store: Arc<dyn MessageStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub async fn count_for(&self, user: UserId, counterparty: UserId) -> ChatResult<usize> {
        Ok(self.summary(user).await?.count_for(counterparty))
    }

    pub async fn total_for(&self, user: UserId) -> ChatResult<usize> {
        Ok(self.summary(user).await?.total)
    }

    pub async fn summary(&self, user: UserId) -> ChatResult<UnreadSummary> {
        let by_counterparty = retry::with_backoff(&self.retry, "unread count", || {
            self.store.unread_by_counterparty(user)
        })
        .await?;

        Ok(UnreadSummary {
            total: by_counterparty.values().sum(),
            by_counterparty,
        })
    }

    /// Keeps a live summary for `user`, recomputed on a poll interval and on
    /// every store event touching one of their conversations.
    pub fn watch(&self, user: UserId, source: Arc<dyn EventSource>, config: UnreadConfig) -> UnreadWatcher {
        let (tx, rx) = watch::channel(UnreadSummary::default());
        let token = CancellationToken::new();
        let refresh = Arc::new(Notify::new());

        let task = Refresher {
            counter: self.clone(),
            source,
            user,
            config,
            tx,
            refresh: refresh.clone(),
        };
        tokio::spawn(task.run(token.clone()));

        UnreadWatcher { rx, token, refresh }
    }
}

struct Refresher {
    counter: UnreadCounter,
    source: Arc<dyn EventSource>,
    user: UserId,
    config: UnreadConfig,
    tx: watch::Sender<UnreadSummary>,
    refresh: Arc<Notify>,
}

enum Trigger {
    Poll,
    Push(Option<StoreEvent>),
    Manual,
}

impl Refresher {
    async fn run(self, token: CancellationToken) {
        let mut ticks = tokio::time::interval(self.config.poll_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events = self.connect().await;

        loop {
            let trigger = tokio::select! {
                _ = token.cancelled() => break,
                _ = ticks.tick() => Trigger::Poll,
                event = next_event(&mut events) => Trigger::Push(event),
                _ = self.refresh.notified() => Trigger::Manual,
            };

            match trigger {
                Trigger::Poll => {
                    if events.is_none() {
                        events = self.connect().await;
                    }
                }
                Trigger::Push(Some(event)) if !self.affects_count(&event) => continue,
                Trigger::Push(Some(_)) | Trigger::Manual => {}
                Trigger::Push(None) => {
                    tracing::debug!(user = %self.user, "unread push feed ended, polling only");
                    events = None;
                }
            }

            self.recompute().await;
        }
    }

    async fn connect(&self) -> Option<EventStream> {
        match self.source.connect_user(self.user).await {
            Ok(events) => Some(events),
            Err(err) => {
                tracing::warn!(user = %self.user, %err, "unread push feed unavailable");
                None
            }
        }
    }

    fn affects_count(&self, event: &StoreEvent) -> bool {
        match event {
            StoreEvent::Inserted(message) | StoreEvent::Updated(message) => {
                message.recipient() == Some(self.user)
            }
            StoreEvent::Deleted { .. } => true,
        }
    }

    async fn recompute(&self) {
        match self.counter.summary(self.user).await {
            Ok(summary) => {
                self.tx.send_if_modified(|current| {
                    if *current == summary {
                        return false;
                    }
                    tracing::debug!(user = %self.user, total = summary.total, "unread changed");
                    *current = summary;
                    true
                });
            }
            Err(err) => tracing::warn!(user = %self.user, %err, "unread recompute failed"),
        }
    }
}

async fn next_event(events: &mut Option<EventStream>) -> Option<StoreEvent> {
    match events {
        Some(events) => events.next().await,
        None => std::future::pending().await,
    }
}

/// Live unread summary for one user. Dropping it stops the refresh task.
pub struct UnreadWatcher {
    rx: watch::Receiver<UnreadSummary>,
    token: CancellationToken,
    refresh: Arc<Notify>,
}

impl UnreadWatcher {
    pub fn current(&self) -> UnreadSummary {
        self.rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UnreadSummary> {
        self.rx.clone()
    }

    /// Waits until the summary satisfies `ready`.
    pub async fn wait_until(&self, mut ready: impl FnMut(&UnreadSummary) -> bool) -> UnreadSummary {
        let mut rx = self.rx.clone();
        match rx.wait_for(|summary| ready(summary)).await {
            Ok(summary) => summary.clone(),
            Err(_) => self.current(),
        }
    }

    /// Recomputes now instead of waiting for the next poll or push.
    pub fn refresh(&self) {
        self.refresh.notify_one();
    }
}

impl Drop for UnreadWatcher {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
