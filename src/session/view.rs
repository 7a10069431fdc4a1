use std::collections::{HashMap, HashSet};

use pulldown_cmark::{Event, Options, Parser};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    conversation::{Role, UserId},
    store::{Message, MessageId},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub sender_role: Role,
    pub body: String,
    pub html: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub edited: bool,
    pub edit_version: u32,
    pub is_mine: bool,
    pub is_read: bool,
}

/// Point in a view's history, taken when a full fetch starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FetchMark(u64);

/// Local, non-authoritative copy of one conversation as seen by `viewer`.
///
/// Every `apply_*` is idempotent and order-tolerant, so duplicate or replayed
/// realtime deliveries leave the view unchanged.
#[derive(Debug, Clone)]
pub struct ConversationView {
    viewer: UserId,
    messages: Vec<Message>,
    deleted: HashSet<MessageId>,
    applied: u64,
    /// When each message in view last changed, in `applied` ticks.
    changed_at: HashMap<MessageId, u64>,
}

impl ConversationView {
    pub fn new(viewer: UserId) -> Self {
        Self {
            viewer,
            messages: Vec::new(),
            deleted: HashSet::new(),
            applied: 0,
            changed_at: HashMap::new(),
        }
    }

    pub fn with_history(viewer: UserId, messages: Vec<Message>) -> Self {
        let mut view = Self::new(viewer);
        view.merge(messages, view.fetch_mark());
        view
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn fetch_mark(&self) -> FetchMark {
        FetchMark(self.applied)
    }

    /// Folds in a full snapshot whose fetch started at `since`.
    ///
    /// The snapshot is authoritative for anything the view has not heard about
    /// since then. Local copies that changed after `since` survive: a newer copy
    /// of a fetched message wins, and a message missing from the snapshot is
    /// kept rather than dropped.
    pub fn merge(&mut self, snapshot: Vec<Message>, since: FetchMark) {
        let mut local: HashMap<MessageId, Message> =
            self.messages.drain(..).map(|message| (message.id, message)).collect();

        let mut merged = Vec::with_capacity(snapshot.len());
        for fetched in snapshot {
            if self.deleted.contains(&fetched.id) {
                continue;
            }
            match local.remove(&fetched.id) {
                Some(current) if current.supersedes(&fetched) => merged.push(current),
                _ => merged.push(fetched),
            }
        }
        merged.extend(
            local
                .into_values()
                .filter(|message| self.changed_at.get(&message.id).is_some_and(|&at| at > since.0)),
        );
        merged.sort_by_key(Message::order_key);
        merged.dedup_by_key(|message| message.id);

        let kept: HashSet<MessageId> = merged.iter().map(|message| message.id).collect();
        self.changed_at.retain(|id, _| kept.contains(id));
        self.messages = merged;
    }

    pub fn apply_insert(&mut self, message: Message) -> bool {
        if self.deleted.contains(&message.id) {
            return false;
        }
        let id = message.id;
        let changed = match self.position(&message) {
            Ok(at) => self.apply_newer(at, message),
            Err(at) => {
                self.messages.insert(at, message);
                true
            }
        };
        if changed {
            self.touch(id);
        }
        changed
    }

    /// Same as an insert: an update for a message the view has not loaded yet
    /// adds it, unless the message was deleted.
    pub fn apply_update(&mut self, message: Message) -> bool {
        self.apply_insert(message)
    }

    pub fn apply_delete(&mut self, id: MessageId) -> bool {
        self.deleted.insert(id);
        self.changed_at.remove(&id);
        let before = self.messages.len();
        self.messages.retain(|message| message.id != id);
        before != self.messages.len()
    }

    /// Incoming messages the viewer has not read yet.
    pub fn unread_incoming(&self) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|message| message.sender_id != self.viewer && !message.is_read)
            .map(|message| message.id)
            .collect()
    }

    pub fn rendered(&self) -> Vec<RenderedMessage> {
        self.messages
            .iter()
            .map(|message| RenderedMessage {
                id: message.id,
                sender_id: message.sender_id,
                sender_role: message.sender_role,
                body: message.body.clone(),
                html: render_markdown(&message.body),
                created_at: message.created_at,
                edited: message.updated_at.is_some(),
                edit_version: message.edit_version,
                is_mine: message.sender_id == self.viewer,
                is_read: message.is_read,
            })
            .collect()
    }

    fn touch(&mut self, id: MessageId) {
        self.applied += 1;
        self.changed_at.insert(id, self.applied);
    }

    fn position(&self, message: &Message) -> Result<usize, usize> {
        self.messages
            .binary_search_by_key(&message.order_key(), Message::order_key)
    }

    fn apply_newer(&mut self, at: usize, message: Message) -> bool {
        if message.supersedes(&self.messages[at]) {
            self.messages[at] = message;
            true
        } else {
            false
        }
    }
}

/// Markdown to HTML, with raw HTML in the body shown as text.
pub fn render_markdown(body: &str) -> String {
    let parser = Parser::new_ext(body, Options::ENABLE_STRIKETHROUGH).map(|event| match event {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        _ => event,
    });

    let mut html = String::new();
    pulldown_cmark::html::push_html(&mut html, parser);
    html
}
