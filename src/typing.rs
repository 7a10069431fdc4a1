use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use serde::Serialize;
use tokio::{sync::broadcast, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::TypingConfig,
    conversation::{ConversationKey, UserId},
    error::{ChatError, ChatResult},
};

/// Fire-and-forget "is typing" signal. Never persisted, never replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TypingEvent {
    pub user_id: UserId,
    pub conversation_key: ConversationKey,
    pub is_typing: bool,
}

type Slot = (UserId, ConversationKey);

struct Typing {
    generation: u64,
    expires_at: Instant,
    timer: CancellationToken,
}

struct Inner {
    config: TypingConfig,
    active: Mutex<HashMap<Slot, Typing>>,
    generations: AtomicU64,
    events: broadcast::Sender<TypingEvent>,
    shutdown: CancellationToken,
}

/// Per (user, conversation) `Idle -> Typing -> Idle` machine with a
/// self-expiring timer. Repeated keystrokes only push the deadline out.
#[derive(Clone)]
pub struct TypingIndicatorChannel {
    inner: Arc<Inner>,
}

impl TypingIndicatorChannel {
    pub fn new(config: TypingConfig) -> Self {
        Self::with_capacity(config, 256)
    }

    /// `capacity` bounds how far a slow subscriber may fall behind before it
    /// resynchronises from current state.
    pub fn with_capacity(config: TypingConfig, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                active: Mutex::default(),
                generations: AtomicU64::new(0),
                events: broadcast::channel(capacity).0,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn notify_typing(&self, user: UserId, key: ConversationKey) -> ChatResult<()> {
        check_member(user, key)?;
        let expires_at = Instant::now() + self.inner.config.expiry;

        let (generation, timer) = {
            let mut active = self.inner.active.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(typing) = active.get_mut(&(user, key)) {
                typing.expires_at = expires_at;
                return Ok(());
            }
            let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
            let timer = self.inner.shutdown.child_token();
            active.insert(
                (user, key),
                Typing {
                    generation,
                    expires_at,
                    timer: timer.clone(),
                },
            );
            (generation, timer)
        };

        tracing::debug!(%user, %key, "typing started");
        self.broadcast(user, key, true);
        tokio::spawn(self.clone().expire_later((user, key), generation, timer));
        Ok(())
    }

    /// Goes idle right away. Returns whether the user was typing.
    pub fn stop_typing(&self, user: UserId, key: ConversationKey) -> bool {
        let removed = self
            .inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(user, key));

        match removed {
            Some(typing) => {
                typing.timer.cancel();
                tracing::debug!(%user, %key, "typing stopped");
                self.broadcast(user, key, false);
                true
            }
            None => false,
        }
    }

    pub fn is_typing(&self, user: UserId, key: ConversationKey) -> bool {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(user, key))
            .is_some_and(|typing| typing.expires_at > Instant::now())
    }

    pub fn typing_in(&self, key: ConversationKey) -> Vec<UserId> {
        let now = Instant::now();
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|((_, k), typing)| *k == key && typing.expires_at > now)
            .map(|((user, _), _)| *user)
            .collect()
    }

    /// Raw event feed, for transports that filter on their own.
    pub fn events(&self) -> broadcast::Receiver<TypingEvent> {
        self.inner.events.subscribe()
    }

    /// Delivers typing changes in `key` from anyone but `viewer`.
    pub fn subscribe<F>(&self, key: ConversationKey, viewer: UserId, mut on_event: F) -> TypingSubscription
    where
        F: FnMut(TypingEvent) + Send + 'static,
    {
        let token = self.inner.shutdown.child_token();
        let cancelled = token.clone();
        let mut rx = self.events();
        let channel = self.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancelled.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(event) if event.conversation_key == key && event.user_id != viewer => on_event(event),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // a dropped stop would leave the peer typing forever
                        tracing::debug!(%key, skipped, "typing subscriber lagged, resyncing");
                        let (a, b) = key.members();
                        for user_id in [a, b].into_iter().filter(|user| *user != viewer) {
                            on_event(TypingEvent {
                                user_id,
                                conversation_key: key,
                                is_typing: channel.is_typing(user_id, key),
                            });
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        TypingSubscription { token }
    }

    /// Cancels every pending expiry timer and subscription.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    fn broadcast(&self, user_id: UserId, conversation_key: ConversationKey, is_typing: bool) {
        let _ = self.inner.events.send(TypingEvent {
            user_id,
            conversation_key,
            is_typing,
        });
    }

    async fn expire_later(self, slot: Slot, generation: u64, timer: CancellationToken) {
        loop {
            let deadline = {
                let active = self.inner.active.lock().unwrap_or_else(PoisonError::into_inner);
                match active.get(&slot) {
                    Some(typing) if typing.generation == generation => typing.expires_at,
                    _ => return,
                }
            };

            tokio::select! {
                _ = timer.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {}
            }

            let expired = {
                let mut active = self.inner.active.lock().unwrap_or_else(PoisonError::into_inner);
                let state = active
                    .get(&slot)
                    .filter(|typing| typing.generation == generation)
                    .map(|typing| typing.expires_at <= Instant::now());
                match state {
                    Some(true) => {
                        active.remove(&slot);
                        true
                    }
                    Some(false) => false,
                    None => return,
                }
            };

            if expired {
                let (user, key) = slot;
                tracing::debug!(%user, %key, "typing expired");
                self.broadcast(user, key, false);
                return;
            }
        }
    }
}

fn check_member(user: UserId, key: ConversationKey) -> ChatResult<()> {
    if !key.contains(user) {
        return Err(ChatError::validation(format!("{user} is not part of conversation {key}")));
    }
    Ok(())
}

/// Keeps a typing observer alive; dropping it stops delivery.
pub struct TypingSubscription {
    token: CancellationToken,
}

impl TypingSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for TypingSubscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    fn setup() -> (TypingIndicatorChannel, UserId, UserId, ConversationKey) {
        let coach = UserId::new();
        let trainee = UserId::new();
        let key = ConversationKey::between(coach, trainee).unwrap();
        let channel = TypingIndicatorChannel::new(TypingConfig {
            expiry: Duration::from_secs(3),
        });
        (channel, coach, trainee, key)
    }

    fn watch(
        channel: &TypingIndicatorChannel,
        key: ConversationKey,
        viewer: UserId,
    ) -> (TypingSubscription, mpsc::UnboundedReceiver<TypingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = channel.subscribe(key, viewer, move |event| {
            let _ = tx.send(event);
        });
        (sub, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn expires_without_fresh_keystrokes() {
        let (channel, coach, trainee, key) = setup();
        let (_sub, mut seen) = watch(&channel, key, coach);

        channel.notify_typing(trainee, key).unwrap();
        assert!(seen.recv().await.unwrap().is_typing);
        let started = Instant::now();

        let stopped = seen.recv().await.unwrap();
        assert!(!stopped.is_typing);
        assert_eq!(Instant::now() - started, Duration::from_secs(3));
        assert!(!channel.is_typing(trainee, key));
    }

    #[tokio::test(start_paused = true)]
    async fn keystrokes_within_window_do_not_flicker() {
        let (channel, coach, trainee, key) = setup();
        let (_sub, mut seen) = watch(&channel, key, coach);

        channel.notify_typing(trainee, key).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        channel.notify_typing(trainee, key).unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        channel.notify_typing(trainee, key).unwrap();
        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert!(channel.is_typing(trainee, key));

        assert!(seen.recv().await.unwrap().is_typing);
        assert!(seen.try_recv().is_err(), "no re-broadcast while already typing");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!seen.recv().await.unwrap().is_typing);
        assert!(!channel.is_typing(trainee, key));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_immediate_and_cancels_timer() {
        let (channel, coach, trainee, key) = setup();
        let (_sub, mut seen) = watch(&channel, key, coach);

        channel.notify_typing(trainee, key).unwrap();
        assert!(channel.stop_typing(trainee, key));
        assert!(!channel.stop_typing(trainee, key));

        assert!(seen.recv().await.unwrap().is_typing);
        assert!(!seen.recv().await.unwrap().is_typing);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(seen.try_recv().is_err(), "cancelled timer must not fire");
    }

    #[tokio::test(start_paused = true)]
    async fn one_state_per_user_and_conversation() {
        let (channel, coach, trainee, key) = setup();
        for _ in 0..10 {
            channel.notify_typing(trainee, key).unwrap();
        }
        channel.notify_typing(coach, key).unwrap();

        let mut typing = channel.typing_in(key);
        typing.sort();
        let mut expected = vec![coach, trainee];
        expected.sort();
        assert_eq!(typing, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn viewer_does_not_see_own_typing() {
        let (channel, coach, trainee, key) = setup();
        let (_sub, mut seen) = watch(&channel, key, trainee);

        channel.notify_typing(trainee, key).unwrap();
        channel.notify_typing(coach, key).unwrap();

        assert_eq!(seen.recv().await.unwrap().user_id, coach);
    }

    #[tokio::test(start_paused = true)]
    async fn lagging_subscriber_still_sees_the_stop() {
        let (_, coach, trainee, key) = setup();
        let channel = TypingIndicatorChannel::with_capacity(TypingConfig { expiry: Duration::from_secs(3) }, 1);
        let (_sub, mut seen) = watch(&channel, key, coach);

        channel.notify_typing(trainee, key).unwrap();
        assert!(seen.recv().await.unwrap().is_typing);

        // more events than the subscriber can buffer before it runs again
        channel.stop_typing(trainee, key);
        channel.notify_typing(coach, key).unwrap();
        channel.stop_typing(coach, key);

        let last = seen.recv().await.unwrap();
        assert_eq!(last.user_id, trainee);
        assert!(!last.is_typing);
    }

    #[tokio::test]
    async fn strangers_cannot_type() {
        let (channel, _, _, key) = setup();
        assert!(channel.notify_typing(UserId::new(), key).is_err());
    }
}
