use std::collections::HashMap;

use axum::{
    Json, debug_handler,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;

use super::{Caller, membership};
use crate::{
    AppResult, AppState,
    conversation::UserId,
    presence::{PresenceSnapshot, PresenceTracker},
    typing::TypingIndicatorChannel,
};

#[derive(Deserialize)]
pub(crate) struct PresenceQuery {
    /// Comma separated user ids.
    ids: String,
}

#[derive(Deserialize)]
pub(crate) struct TypingBody {
    is_typing: bool,
}

#[debug_handler(state = AppState)]
pub async fn heartbeat(State(presence): State<PresenceTracker>, caller: Caller) -> StatusCode {
    presence.heartbeat(caller.0);
    StatusCode::NO_CONTENT
}

#[debug_handler(state = AppState)]
pub async fn query(
    State(presence): State<PresenceTracker>,
    _caller: Caller,
    Query(PresenceQuery { ids }): Query<PresenceQuery>,
) -> AppResult<Json<HashMap<UserId, PresenceSnapshot>>> {
    let users = ids
        .split(',')
        .filter(|id| !id.trim().is_empty())
        .map(str::parse)
        .collect::<Result<Vec<UserId>, _>>()?;
    Ok(Json(presence.query(&users)))
}

#[debug_handler(state = AppState)]
pub async fn typing(
    Path((coach, trainee)): Path<(UserId, UserId)>,
    State(typing): State<TypingIndicatorChannel>,
    caller: Caller,
    Json(TypingBody { is_typing }): Json<TypingBody>,
) -> AppResult<StatusCode> {
    let (participants, _) = membership(&caller, coach, trainee)?;
    if is_typing {
        typing.notify_typing(caller.0, participants.key())?;
    } else {
        typing.stop_typing(caller.0, participants.key());
    }
    Ok(StatusCode::NO_CONTENT)
}
