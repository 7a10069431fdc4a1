use std::{collections::HashMap, sync::Arc};

use futures_util::future::BoxFuture;
use sqlx::{QueryBuilder, Sqlite, SqlitePool, sqlite::SqlitePoolOptions};

use super::{DEFAULT_MAX_BODY_CHARS, Message, MessageId, MessageStore, validate_body, validate_sender};
use crate::{
    clock::{self, MonotonicClock},
    conversation::{ConversationKey, Role, UserId},
    error::{ChatError, ChatResult},
};

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        conversation_key TEXT NOT NULL,
        sender_id TEXT NOT NULL,
        recipient_id TEXT NOT NULL,
        sender_role TEXT NOT NULL,
        body TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER,
        is_read BOOLEAN NOT NULL DEFAULT false,
        edit_version INTEGER NOT NULL DEFAULT 0,

        CHECK (sender_role IN ('coach', 'trainee')),
        CHECK (sender_id <> recipient_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation_order
        ON messages(conversation_key, created_at, id)",
    "CREATE INDEX IF NOT EXISTS idx_messages_unread
        ON messages(recipient_id, is_read)",
];

const COLUMNS: &str = "id,conversation_key,sender_id,sender_role,body,created_at,updated_at,is_read,edit_version";

type MessageRow = (String, String, String, String, String, i64, Option<i64>, bool, i64);

pub async fn migrate(db_pool: &SqlitePool) -> ChatResult<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(db_pool).await?;
    }
    Ok(())
}

fn decode(row: MessageRow) -> ChatResult<Message> {
    let (id, key, sender, role, body, created_at, updated_at, is_read, edit_version) = row;
    Ok(Message {
        id: id.parse()?,
        conversation_key: key.parse()?,
        sender_id: sender.parse()?,
        sender_role: role.parse()?,
        body,
        created_at: clock::from_micros(created_at),
        updated_at: updated_at.map(clock::from_micros),
        is_read,
        edit_version: u32::try_from(edit_version)
            .map_err(|_| ChatError::Storage(format!("bad edit_version {edit_version}")))?,
    })
}

fn decode_all(rows: Vec<MessageRow>) -> ChatResult<Vec<Message>> {
    let mut messages = rows.into_iter().map(decode).collect::<ChatResult<Vec<_>>>()?;
    messages.sort_by_key(Message::order_key);
    Ok(messages)
}

/// Durable [`MessageStore`] on sqlite.
#[derive(Clone)]
pub struct SqliteMessageStore {
    db_pool: SqlitePool,
    clock: Arc<MonotonicClock>,
    max_body_chars: usize,
}

impl SqliteMessageStore {
    /// Opens a pool on `url`, creates the schema and resumes the timestamp clock
    /// after the newest stored message.
    pub async fn open(url: &str) -> ChatResult<Self> {
        let options = if url.contains(":memory:") {
            // every connection to :memory: is its own database
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(16)
        };
        let db_pool = options.connect(url).await?;
        migrate(&db_pool).await?;
        Self::with_pool(db_pool).await
    }

    pub async fn with_pool(db_pool: SqlitePool) -> ChatResult<Self> {
        let (newest,): (Option<i64>,) = sqlx::query_as("SELECT MAX(created_at) FROM messages")
            .fetch_one(&db_pool)
            .await?;

        Ok(Self {
            db_pool,
            clock: Arc::new(MonotonicClock::starting_after(newest.unwrap_or(0))),
            max_body_chars: DEFAULT_MAX_BODY_CHARS,
        })
    }

    pub fn with_max_body_chars(mut self, max_body_chars: usize) -> Self {
        self.max_body_chars = max_body_chars;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db_pool
    }

    async fn fetch(&self, id: MessageId) -> ChatResult<Option<Message>> {
        let sql = format!("SELECT {COLUMNS} FROM messages WHERE id=?");
        let row: Option<MessageRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.db_pool)
            .await?;
        row.map(decode).transpose()
    }

    /// Works out why a sender-guarded statement touched no row.
    async fn explain_miss(&self, id: MessageId, requester: UserId) -> ChatResult<Message> {
        let Some(current) = self.fetch(id).await? else {
            return Err(ChatError::NotFound(format!("message {id}")));
        };
        if current.sender_id != requester {
            return Err(ChatError::Authorization(format!("{requester} did not send message {id}")));
        }
        Ok(current)
    }
}

impl MessageStore for SqliteMessageStore {
    fn append(
        &self,
        key: ConversationKey,
        sender: UserId,
        role: Role,
        body: String,
    ) -> BoxFuture<'_, ChatResult<Message>> {
        Box::pin(async move {
            validate_body(&body, self.max_body_chars)?;
            validate_sender(key, sender)?;
            let recipient = key
                .counterparty_of(sender)
                .ok_or_else(|| ChatError::validation("sender has no counterparty"))?;

            let id = MessageId::new();
            let created_at = self.clock.now_micros();
            sqlx::query(
                "INSERT INTO messages (id,conversation_key,sender_id,recipient_id,sender_role,body,created_at) \
                 VALUES (?,?,?,?,?,?,?)",
            )
            .bind(id.to_string())
            .bind(key.to_string())
            .bind(sender.to_string())
            .bind(recipient.to_string())
            .bind(role.as_str())
            .bind(&body)
            .bind(created_at)
            .execute(&self.db_pool)
            .await?;

            tracing::debug!(%id, %key, "message stored");
            Ok(Message {
                id,
                conversation_key: key,
                sender_id: sender,
                sender_role: role,
                body,
                created_at: clock::from_micros(created_at),
                updated_at: None,
                is_read: false,
                edit_version: 0,
            })
        })
    }

    fn list(&self, key: ConversationKey) -> BoxFuture<'_, ChatResult<Vec<Message>>> {
        Box::pin(async move {
            let sql = format!("SELECT {COLUMNS} FROM messages WHERE conversation_key=? ORDER BY created_at, id");
            let rows: Vec<MessageRow> = sqlx::query_as(&sql)
                .bind(key.to_string())
                .fetch_all(&self.db_pool)
                .await?;
            decode_all(rows)
        })
    }

    fn get(&self, id: MessageId) -> BoxFuture<'_, ChatResult<Message>> {
        Box::pin(async move {
            self.fetch(id)
                .await?
                .ok_or_else(|| ChatError::NotFound(format!("message {id}")))
        })
    }

    fn edit_versioned(
        &self,
        id: MessageId,
        requester: UserId,
        body: String,
        expected_version: Option<u32>,
    ) -> BoxFuture<'_, ChatResult<Message>> {
        Box::pin(async move {
            validate_body(&body, self.max_body_chars)?;
            let edited_at = self.clock.now_micros();
            let expected = expected_version.map(i64::from);

            let sql = format!(
                "UPDATE messages SET body=?, updated_at=?, edit_version=edit_version+1 \
                 WHERE id=? AND sender_id=? \
                 AND (updated_at IS NULL OR updated_at < ?) \
                 AND (? IS NULL OR edit_version = ?) \
                 RETURNING {COLUMNS}"
            );
            let row: Option<MessageRow> = sqlx::query_as(&sql)
                .bind(&body)
                .bind(edited_at)
                .bind(id.to_string())
                .bind(requester.to_string())
                .bind(edited_at)
                .bind(expected)
                .bind(expected)
                .fetch_optional(&self.db_pool)
                .await?;

            if let Some(row) = row {
                return decode(row);
            }

            let current = self.explain_miss(id, requester).await?;
            match expected_version {
                Some(expected) if current.edit_version != expected => Err(ChatError::Conflict {
                    expected,
                    actual: current.edit_version,
                }),
                // a newer edit already landed; last write wins
                _ => Ok(current),
            }
        })
    }

    fn delete(&self, id: MessageId, requester: UserId) -> BoxFuture<'_, ChatResult<Message>> {
        Box::pin(async move {
            let sql = format!("DELETE FROM messages WHERE id=? AND sender_id=? RETURNING {COLUMNS}");
            let row: Option<MessageRow> = sqlx::query_as(&sql)
                .bind(id.to_string())
                .bind(requester.to_string())
                .fetch_optional(&self.db_pool)
                .await?;

            match row {
                Some(row) => decode(row),
                None => {
                    self.explain_miss(id, requester).await?;
                    Err(ChatError::NotFound(format!("message {id}")))
                }
            }
        })
    }

    fn mark_read<'a>(
        &'a self,
        ids: &'a [MessageId],
        recipient: UserId,
    ) -> BoxFuture<'a, ChatResult<Vec<Message>>> {
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(Vec::new());
            }

            let mut query = QueryBuilder::<Sqlite>::new("UPDATE messages SET is_read=true WHERE is_read=false AND recipient_id=");
            query.push_bind(recipient.to_string());
            query.push(" AND id IN (");
            let mut in_list = query.separated(", ");
            for id in ids {
                in_list.push_bind(id.to_string());
            }
            in_list.push_unseparated(") RETURNING ");
            query.push(COLUMNS);

            let rows: Vec<MessageRow> = query.build_query_as().fetch_all(&self.db_pool).await?;
            decode_all(rows)
        })
    }

    fn mark_conversation_read(
        &self,
        key: ConversationKey,
        recipient: UserId,
    ) -> BoxFuture<'_, ChatResult<Vec<Message>>> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE messages SET is_read=true \
                 WHERE is_read=false AND conversation_key=? AND recipient_id=? \
                 RETURNING {COLUMNS}"
            );
            let rows: Vec<MessageRow> = sqlx::query_as(&sql)
                .bind(key.to_string())
                .bind(recipient.to_string())
                .fetch_all(&self.db_pool)
                .await?;
            decode_all(rows)
        })
    }

    fn unread_by_counterparty(&self, user: UserId) -> BoxFuture<'_, ChatResult<HashMap<UserId, usize>>> {
        Box::pin(async move {
            let rows: Vec<(String, i64)> = sqlx::query_as(
                "SELECT sender_id, COUNT(*) FROM messages WHERE recipient_id=? AND is_read=false GROUP BY sender_id",
            )
            .bind(user.to_string())
            .fetch_all(&self.db_pool)
            .await?;

            rows.into_iter()
                .map(|(sender, count)| -> ChatResult<(UserId, usize)> {
                    Ok((sender.parse()?, count.max(0) as usize))
                })
                .collect()
        })
    }
}
