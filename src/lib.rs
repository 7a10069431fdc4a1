pub mod appresult;
pub mod clock;
pub mod config;
pub mod conversation;
pub mod error;
pub mod identity;
pub mod logging;
pub mod presence;
pub mod retry;
pub mod routes;
pub mod session;
pub mod store;
pub mod sync;
pub mod typing;
pub mod unread;

use std::sync::Arc;

use axum::{Router, extract::FromRef};
use tower_http::cors::CorsLayer;

pub use appresult::{AppError, AppResult};

use crate::{
    config::{Config, UnreadConfig},
    presence::PresenceTracker,
    store::{ChangeFeed, MessageStore},
    typing::TypingIndicatorChannel,
    unread::UnreadCounter,
};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: Arc<dyn MessageStore>,
    pub feed: ChangeFeed,
    pub presence: PresenceTracker,
    pub typing: TypingIndicatorChannel,
    pub unread: UnreadCounter,
    pub unread_config: UnreadConfig,
}

impl AppState {
    /// `store` should publish its mutations on `feed`, e.g. a
    /// [`store::PublishingStore`], or sockets will see nothing.
    pub fn new(store: Arc<dyn MessageStore>, feed: ChangeFeed, config: &Config) -> Self {
        Self {
            unread: UnreadCounter::new(store.clone(), config.retry),
            unread_config: config.unread,
            presence: PresenceTracker::new(config.presence),
            typing: TypingIndicatorChannel::new(config.typing),
            store,
            feed,
        }
    }

    /// Stops presence watchers and pending typing timers.
    pub fn shutdown(&self) {
        self.presence.shutdown();
        self.typing.shutdown();
    }
}

pub fn app(state: AppState) -> Router {
    routes::router()
        .with_state(state)
        .layer(CorsLayer::permissive())
}
