use axum::{
    debug_handler,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::IntoResponse,
};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use super::{Caller, membership};
use crate::{
    AppResult, AppState,
    config::UnreadConfig,
    conversation::{ConversationKey, UserId},
    presence::{Heartbeat, PresenceTracker, PresenceUpdate},
    store::{ChangeFeed, EventSource, EventStream, StoreEvent},
    typing::{TypingEvent, TypingIndicatorChannel},
    unread::{UnreadCounter, UnreadSummary},
};

/// Pushed to the client. The socket closing means events may have been
/// missed; clients re-fetch the conversation after reconnecting.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ServerFrame {
    Store(StoreEvent),
    Typing(TypingEvent),
    Presence(PresenceUpdate),
    /// The caller's unread counts across all conversations, sent when they change.
    Unread(UnreadSummary),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Typing { is_typing: bool },
    Heartbeat,
}

#[debug_handler(state = AppState)]
pub async fn conversation_ws(
    Path((coach, trainee)): Path<(UserId, UserId)>,
    State(feed): State<ChangeFeed>,
    State(typing): State<TypingIndicatorChannel>,
    State(presence): State<PresenceTracker>,
    State(unread): State<UnreadCounter>,
    State(unread_config): State<UnreadConfig>,
    caller: Caller,

    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    let (participants, _) = membership(&caller, coach, trainee)?;
    let key = participants.key();
    let user = caller.0;
    let counterparty = participants.counterparty_of(user).unwrap_or(user);
    let events = feed.connect(key).await?;

    Ok(ws.on_upgrade(async move |socket| {
        let link = Link {
            key,
            user,
            counterparty,
            typing,
            presence,
            feed,
            unread,
            unread_config,
        };
        link.serve(socket, events).await;
    }))
}

struct Link {
    key: ConversationKey,
    user: UserId,
    counterparty: UserId,
    typing: TypingIndicatorChannel,
    presence: PresenceTracker,
    feed: ChangeFeed,
    unread: UnreadCounter,
    unread_config: UnreadConfig,
}

impl Link {
    async fn serve(self, socket: WebSocket, mut events: EventStream) {
        let (mut sender, mut receiver) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let typing_tx = tx.clone();
        let _typing = self.typing.subscribe(self.key, self.user, move |event| {
            let _ = typing_tx.send(ServerFrame::Typing(event));
        });
        let _presence = self.presence.subscribe(&[self.counterparty], move |update| {
            let _ = tx.send(ServerFrame::Presence(update));
        });
        // an open socket keeps its user online
        let _heartbeat = Heartbeat::spawn(&self.presence, self.user);
        let unread = self.unread.watch(self.user, Arc::new(self.feed.clone()), self.unread_config);
        let mut unread_rx = unread.subscribe();
        tracing::info!(key = %self.key, user = %self.user, "socket opened");

        let mut send_task = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    event = events.next() => match event {
                        Some(event) => ServerFrame::Store(event),
                        None => break,
                    },
                    frame = rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                    summary = next_unread(&mut unread_rx) => match summary {
                        Some(summary) => ServerFrame::Unread(summary),
                        None => break,
                    },
                };
                let Ok(text) = serde_json::to_string(&frame) else {
                    continue;
                };
                if sender.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sender.close().await;
        });

        let (typing, presence, key, user) = (self.typing.clone(), self.presence.clone(), self.key, self.user);
        let mut recv_task = tokio::spawn(async move {
            while let Some(Ok(msg)) = receiver.next().await {
                let WsMessage::Text(text) = msg else {
                    continue;
                };
                match serde_json::from_str(text.as_str()) {
                    Ok(ClientFrame::Typing { is_typing: true }) => {
                        if let Err(err) = typing.notify_typing(user, key) {
                            tracing::debug!(%err, "typing rejected");
                        }
                    }
                    Ok(ClientFrame::Typing { is_typing: false }) => {
                        typing.stop_typing(user, key);
                    }
                    Ok(ClientFrame::Heartbeat) => presence.heartbeat(user),
                    Err(err) => tracing::debug!(%err, "ignoring client frame"),
                }
            }
        });

        tokio::select! {
            _ = &mut send_task => recv_task.abort(),
            _ = &mut recv_task => send_task.abort(),
        };

        self.typing.stop_typing(self.user, self.key);
        tracing::info!(key = %self.key, user = %self.user, "socket closed");
    }
}

async fn next_unread(rx: &mut watch::Receiver<UnreadSummary>) -> Option<UnreadSummary> {
    rx.changed().await.ok()?;
    Some(rx.borrow_and_update().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::MonotonicClock,
        conversation::Role,
        store::{Message, MessageId},
    };

    #[test]
    fn frames_carry_both_tags() {
        let coach = UserId::new();
        let key = ConversationKey::between(coach, UserId::new()).unwrap();
        let message = Message {
            id: MessageId::new(),
            conversation_key: key,
            sender_id: coach,
            sender_role: Role::Coach,
            body: "hi".into(),
            created_at: MonotonicClock::new().now(),
            updated_at: None,
            is_read: false,
            edit_version: 0,
        };

        let json = serde_json::to_value(ServerFrame::Store(StoreEvent::Inserted(message))).unwrap();
        assert_eq!(json["kind"], "store");
        assert_eq!(json["type"], "inserted");
        assert_eq!(json["body"], "hi");

        let json = serde_json::to_value(ServerFrame::Store(StoreEvent::Deleted {
            conversation_key: key,
            id: MessageId::new(),
        }))
        .unwrap();
        assert_eq!(json["type"], "deleted");

        let json = serde_json::to_value(ServerFrame::Unread(UnreadSummary {
            total: 2,
            by_counterparty: [(coach, 2)].into(),
        }))
        .unwrap();
        assert_eq!(json["kind"], "unread");
        assert_eq!(json["by_counterparty"][coach.to_string()], 2);
    }

    #[test]
    fn client_frames_parse() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"typing","is_typing":true}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Typing { is_typing: true }));
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Heartbeat));
    }
}
