use std::sync::Arc;

use axum::{
    Json, debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use super::{Caller, membership};
use crate::{
    AppResult, AppState,
    conversation::UserId,
    session::{ConversationView, RenderedMessage},
    store::{Message, MessageId, MessageStore},
    typing::TypingIndicatorChannel,
    unread::{UnreadCounter, UnreadSummary},
};

#[derive(Deserialize)]
pub(crate) struct SendBody {
    body: String,
}

#[derive(Deserialize)]
pub(crate) struct EditBody {
    body: String,
    expected_version: Option<u32>,
}

#[derive(Deserialize)]
pub(crate) struct ReadBody {
    ids: Vec<MessageId>,
}

#[debug_handler(state = AppState)]
pub async fn list(
    Path((coach, trainee)): Path<(UserId, UserId)>,
    State(store): State<Arc<dyn MessageStore>>,
    caller: Caller,
) -> AppResult<Json<Vec<RenderedMessage>>> {
    let (participants, _) = membership(&caller, coach, trainee)?;
    let messages = store.list(participants.key()).await?;

    Ok(Json(ConversationView::with_history(caller.0, messages).rendered()))
}

#[debug_handler(state = AppState)]
pub async fn send(
    Path((coach, trainee)): Path<(UserId, UserId)>,
    State(store): State<Arc<dyn MessageStore>>,
    State(typing): State<TypingIndicatorChannel>,
    caller: Caller,
    Json(SendBody { body }): Json<SendBody>,
) -> AppResult<impl IntoResponse> {
    let (participants, role) = membership(&caller, coach, trainee)?;
    let key = participants.key();
    typing.stop_typing(caller.0, key);

    let message = store.append(key, caller.0, role, body).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[debug_handler(state = AppState)]
pub async fn edit(
    Path(id): Path<MessageId>,
    State(store): State<Arc<dyn MessageStore>>,
    caller: Caller,
    Json(EditBody { body, expected_version }): Json<EditBody>,
) -> AppResult<Json<Message>> {
    let message = store.edit_versioned(id, caller.0, body, expected_version).await?;
    Ok(Json(message))
}

#[debug_handler(state = AppState)]
pub async fn delete(
    Path(id): Path<MessageId>,
    State(store): State<Arc<dyn MessageStore>>,
    caller: Caller,
) -> AppResult<StatusCode> {
    store.delete(id, caller.0).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[debug_handler(state = AppState)]
pub async fn mark_read(
    State(store): State<Arc<dyn MessageStore>>,
    caller: Caller,
    Json(ReadBody { ids }): Json<ReadBody>,
) -> AppResult<Json<Vec<Message>>> {
    Ok(Json(store.mark_read(&ids, caller.0).await?))
}

#[debug_handler(state = AppState)]
pub async fn read_all(
    Path((coach, trainee)): Path<(UserId, UserId)>,
    State(store): State<Arc<dyn MessageStore>>,
    caller: Caller,
) -> AppResult<Json<Vec<Message>>> {
    let (participants, _) = membership(&caller, coach, trainee)?;
    Ok(Json(store.mark_conversation_read(participants.key(), caller.0).await?))
}

#[debug_handler(state = AppState)]
pub async fn unread(State(unread): State<UnreadCounter>, caller: Caller) -> AppResult<Json<UnreadSummary>> {
    Ok(Json(unread.summary(caller.0).await?))
}
