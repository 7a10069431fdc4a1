use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::{
    sync::broadcast,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{config::PresenceConfig, conversation::UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PresenceSnapshot {
    pub is_online: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub is_online: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy)]
struct Beat {
    at: Instant,
    seen: OffsetDateTime,
}

struct Inner {
    config: PresenceConfig,
    beats: Mutex<HashMap<UserId, Beat>>,
    updates: broadcast::Sender<PresenceUpdate>,
    shutdown: CancellationToken,
}

/// Heartbeat-derived online state. Nobody ever reports "offline": a user drops
/// off once their last heartbeat is older than the threshold.
#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<Inner>,
}

impl PresenceTracker {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                beats: Mutex::default(),
                updates: broadcast::channel(256).0,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> PresenceConfig {
        self.inner.config
    }

    pub fn heartbeat(&self, user: UserId) {
        let now = Instant::now();
        let beat = Beat {
            at: now,
            seen: OffsetDateTime::now_utc(),
        };
        let previous = self
            .inner
            .beats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user, beat);

        if previous.is_none_or(|p| !self.fresh(p, now)) {
            tracing::info!(%user, "user online");
        }
        let _ = self.inner.updates.send(PresenceUpdate {
            user_id: user,
            is_online: true,
            last_seen: Some(beat.seen),
        });
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.beat(user).is_some_and(|beat| self.fresh(beat, Instant::now()))
    }

    pub fn last_seen(&self, user: UserId) -> Option<OffsetDateTime> {
        self.beat(user).map(|beat| beat.seen)
    }

    pub fn snapshot(&self, user: UserId) -> PresenceSnapshot {
        let now = Instant::now();
        let beat = self.beat(user);
        PresenceSnapshot {
            is_online: beat.is_some_and(|beat| self.fresh(beat, now)),
            last_seen: beat.map(|beat| beat.seen),
        }
    }

    pub fn query(&self, users: &[UserId]) -> HashMap<UserId, PresenceSnapshot> {
        users.iter().map(|user| (*user, self.snapshot(*user))).collect()
    }

    /// Pushes heartbeat updates for `users` to `on_change`, plus an offline
    /// update when a watched user's window lapses. Delivery stops when the
    /// returned subscription is dropped.
    pub fn subscribe<F>(&self, users: &[UserId], on_change: F) -> PresenceSubscription
    where
        F: FnMut(PresenceUpdate) + Send + 'static,
    {
        let token = self.inner.shutdown.child_token();
        let watcher = Watcher {
            tracker: self.clone(),
            watched: users.iter().copied().collect(),
            rx: self.inner.updates.subscribe(),
            on_change,
        };
        tokio::spawn(watcher.run(token.clone()));
        PresenceSubscription { token }
    }

    /// Cancels every subscription and heartbeat task started from this tracker.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    fn beat(&self, user: UserId) -> Option<Beat> {
        self.inner
            .beats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user)
            .copied()
    }

    fn fresh(&self, beat: Beat, now: Instant) -> bool {
        now.saturating_duration_since(beat.at) < self.inner.config.online_threshold
    }

    /// Instant at which `user` stops counting as online.
    fn goes_stale_at(&self, user: UserId) -> Option<Instant> {
        self.beat(user).map(|beat| beat.at + self.inner.config.online_threshold)
    }
}

struct Watcher<F> {
    tracker: PresenceTracker,
    watched: HashSet<UserId>,
    rx: broadcast::Receiver<PresenceUpdate>,
    on_change: F,
}

impl<F: FnMut(PresenceUpdate) + Send + 'static> Watcher<F> {
    async fn run(mut self, token: CancellationToken) {
        let mut stale_at = self.initial_deadlines();

        loop {
            let next = stale_at.values().min().copied();
            let wake = next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            let woke = tokio::select! {
                _ = token.cancelled() => break,
                update = self.rx.recv() => Some(update),
                _ = tokio::time::sleep_until(wake), if next.is_some() => None,
            };

            match woke {
                Some(Ok(update)) if self.watched.contains(&update.user_id) => {
                    if let Some(at) = self.tracker.goes_stale_at(update.user_id) {
                        stale_at.insert(update.user_id, at);
                    }
                    (self.on_change)(update);
                }
                Some(Ok(_)) => {}
                Some(Err(broadcast::error::RecvError::Lagged(_))) => stale_at = self.initial_deadlines(),
                Some(Err(broadcast::error::RecvError::Closed)) => break,
                None => self.expire(&mut stale_at),
            }
        }
    }

    fn initial_deadlines(&self) -> HashMap<UserId, Instant> {
        self.watched
            .iter()
            .filter(|user| self.tracker.is_online(**user))
            .filter_map(|user| Some((*user, self.tracker.goes_stale_at(*user)?)))
            .collect()
    }

    fn expire(&mut self, stale_at: &mut HashMap<UserId, Instant>) {
        let now = Instant::now();
        let due: Vec<UserId> = stale_at
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(user, _)| *user)
            .collect();

        for user in due {
            stale_at.remove(&user);
            if self.tracker.is_online(user) {
                // a heartbeat landed that we have not seen yet
                if let Some(at) = self.tracker.goes_stale_at(user) {
                    stale_at.insert(user, at);
                }
                continue;
            }
            tracing::info!(%user, "user offline");
            (self.on_change)(PresenceUpdate {
                user_id: user,
                is_online: false,
                last_seen: self.tracker.last_seen(user),
            });
        }
    }
}

/// Keeps a presence observer alive; dropping it stops delivery.
pub struct PresenceSubscription {
    token: CancellationToken,
}

impl PresenceSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for PresenceSubscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Sends heartbeats for the local user on a fixed interval until dropped.
pub struct Heartbeat {
    token: CancellationToken,
}

impl Heartbeat {
    pub fn spawn(tracker: &PresenceTracker, user: UserId) -> Self {
        let token = tracker.inner.shutdown.child_token();
        let tracker = tracker.clone();
        let cancelled = token.clone();

        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(tracker.config().heartbeat_interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticks.tick() => tracker.heartbeat(user),
                }
            }
        });

        Self { token }
    }

    pub fn stop(self) {}
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
