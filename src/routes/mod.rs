mod messages;
mod presence;
mod ws;

use axum::{
    Router,
    extract::{FromRequestParts, Query},
    http::request::Parts,
    routing::{get, patch, post},
};
use serde::Deserialize;

use crate::{
    AppResult, AppState,
    conversation::{Participants, Role, UserId},
    error::ChatError,
    identity::IdentityProvider,
};

/// Header carrying the already-authenticated caller.
pub const USER_HEADER: &str = "x-user-id";

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/coaches/{coach}/trainees/{trainee}/messages",
            get(messages::list).post(messages::send),
        )
        .route("/coaches/{coach}/trainees/{trainee}/read", post(messages::read_all))
        .route("/coaches/{coach}/trainees/{trainee}/typing", post(presence::typing))
        .route("/coaches/{coach}/trainees/{trainee}/ws", get(ws::conversation_ws))
        .route("/messages/read", post(messages::mark_read))
        .route("/messages/{id}", patch(messages::edit).delete(messages::delete))
        .route("/unread", get(messages::unread))
        .route("/presence", get(presence::query))
        .route("/presence/heartbeat", post(presence::heartbeat))
}

/// The user making the request, from the `x-user-id` header. WebSocket clients
/// that cannot set headers may pass `?user_id=` instead.
#[derive(Debug, Clone, Copy)]
pub struct Caller(pub UserId);

#[derive(Deserialize)]
struct CallerQuery {
    user_id: Option<UserId>,
}

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = crate::AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(value) = parts.headers.get(USER_HEADER) {
            let value = value
                .to_str()
                .map_err(|_| ChatError::validation(format!("{USER_HEADER} is not valid text")))?;
            return Ok(Self(value.parse()?));
        }

        let from_query = Query::<CallerQuery>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(query)| query.user_id);
        match from_query {
            Some(user) => Ok(Self(user)),
            None => Err(ChatError::Authorization(format!("missing {USER_HEADER}")).into()),
        }
    }
}

impl IdentityProvider for Caller {
    fn current_user(&self) -> UserId {
        self.0
    }
}

/// Resolves the thread named in the path and the caller's role in it.
fn membership(caller: &Caller, coach: UserId, trainee: UserId) -> AppResult<(Participants, Role)> {
    let participants = Participants::new(coach, trainee)?;
    let role = participants
        .role_of(caller.current_user())
        .ok_or_else(|| ChatError::Authorization(format!("{} is not in this conversation", caller.0)))?;
    Ok((participants, role))
}
