use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{
    stream::{self, BoxStream},
    StreamExt, TryStreamExt,
};
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tokio::sync::RwLock;

use shared::domain::{MessageId, RoomId, UserId};

/// A server-confirmed chat message as kept in the local history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    pub reply_to_message_id: Option<MessageId>,
    pub sent_at: DateTime<Utc>,
    pub edited: bool,
    pub deleted: bool,
}

/// Persistence collaborator for confirmed history. Writers only ever append
/// confirmed messages; optimistic state never reaches this layer.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Idempotent per `(room_id, message_id)`: a second append of the same
    /// message is ignored.
    async fn append_confirmed_message(&self, room_id: &RoomId, message: &StoredMessage)
        -> Result<()>;

    /// Messages of one room ordered by `sent_at`, ties broken by arrival.
    fn stream_messages<'a>(&'a self, room_id: &'a RoomId)
        -> BoxStream<'a, Result<StoredMessage>>;

    async fn update_message_content(
        &self,
        room_id: &RoomId,
        message_id: &MessageId,
        content: &str,
    ) -> Result<bool>;

    async fn mark_message_deleted(&self, room_id: &RoomId, message_id: &MessageId)
        -> Result<bool>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        // Every connection to `sqlite::memory:` opens its own database.
        let max_connections = if database_url.starts_with("sqlite::memory:") {
            1
        } else {
            5
        };
        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open message store at {database_url}"))?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn list_rooms(&self) -> Result<Vec<(RoomId, i64)>> {
        let rows = sqlx::query(
            "SELECT room_id, COUNT(*) FROM messages GROUP BY room_id ORDER BY room_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list rooms")?;
        rows.into_iter()
            .map(|row| Ok((RoomId(row.try_get(0)?), row.try_get(1)?)))
            .collect()
    }

    pub async fn purge_room(&self, room_id: &RoomId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE room_id = ?")
            .bind(room_id.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to purge room {room_id}"))?;
        Ok(result.rows_affected())
    }
}

fn stored_message_from_row(row: SqliteRow) -> Result<StoredMessage> {
    Ok(StoredMessage {
        message_id: MessageId(row.try_get("message_id")?),
        room_id: RoomId(row.try_get("room_id")?),
        sender_id: UserId(row.try_get("sender_id")?),
        content: row.try_get("content")?,
        reply_to_message_id: row
            .try_get::<Option<String>, _>("reply_to_message_id")?
            .map(MessageId),
        sent_at: row.try_get("sent_at")?,
        edited: row.try_get("edited")?,
        deleted: row.try_get("deleted")?,
    })
}

#[async_trait]
impl MessageRepository for Storage {
    async fn append_confirmed_message(
        &self,
        room_id: &RoomId,
        message: &StoredMessage,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages
                (room_id, message_id, sender_id, content, reply_to_message_id, sent_at, edited, deleted)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(room_id, message_id) DO NOTHING",
        )
        .bind(room_id.as_str())
        .bind(message.message_id.as_str())
        .bind(message.sender_id.as_str())
        .bind(&message.content)
        .bind(message.reply_to_message_id.as_ref().map(|id| id.as_str()))
        .bind(message.sent_at)
        .bind(message.edited)
        .bind(message.deleted)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "failed to append message {} to room {room_id}",
                message.message_id
            )
        })?;
        Ok(())
    }

    fn stream_messages<'a>(
        &'a self,
        room_id: &'a RoomId,
    ) -> BoxStream<'a, Result<StoredMessage>> {
        sqlx::query(
            "SELECT message_id, room_id, sender_id, content, reply_to_message_id, sent_at, edited, deleted
             FROM messages
             WHERE room_id = ?
             ORDER BY sent_at ASC, seq ASC",
        )
        .bind(room_id.as_str())
        .fetch(&self.pool)
        .map_err(anyhow::Error::from)
        .and_then(|row| async move { stored_message_from_row(row) })
        .boxed()
    }

    async fn update_message_content(
        &self,
        room_id: &RoomId,
        message_id: &MessageId,
        content: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET content = ?, edited = 1 WHERE room_id = ? AND message_id = ?",
        )
        .bind(content)
        .bind(room_id.as_str())
        .bind(message_id.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to edit message {message_id}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_message_deleted(
        &self,
        room_id: &RoomId,
        message_id: &MessageId,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE messages SET deleted = 1 WHERE room_id = ? AND message_id = ?")
                .bind(room_id.as_str())
                .bind(message_id.as_str())
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to delete message {message_id}"))?;
        Ok(result.rows_affected() > 0)
    }
}

/// Process-local repository for tests and ephemeral sessions.
#[derive(Default)]
pub struct InMemoryMessageRepository {
    rooms: RwLock<HashMap<RoomId, Vec<StoredMessage>>>,
}

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, room_id: &RoomId) -> usize {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(Vec::len)
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn append_confirmed_message(
        &self,
        room_id: &RoomId,
        message: &StoredMessage,
    ) -> Result<()> {
        let mut rooms = self.rooms.write().await;
        let messages = rooms.entry(room_id.clone()).or_default();
        if messages
            .iter()
            .any(|existing| existing.message_id == message.message_id)
        {
            return Ok(());
        }
        // Stable insert: equal timestamps keep arrival order.
        let position = messages.partition_point(|existing| existing.sent_at <= message.sent_at);
        messages.insert(position, message.clone());
        Ok(())
    }

    fn stream_messages<'a>(
        &'a self,
        room_id: &'a RoomId,
    ) -> BoxStream<'a, Result<StoredMessage>> {
        stream::once(async move {
            let rooms = self.rooms.read().await;
            rooms.get(room_id).cloned().unwrap_or_default()
        })
        .flat_map(|messages| stream::iter(messages.into_iter().map(Ok)))
        .boxed()
    }

    async fn update_message_content(
        &self,
        room_id: &RoomId,
        message_id: &MessageId,
        content: &str,
    ) -> Result<bool> {
        let mut rooms = self.rooms.write().await;
        let Some(message) = rooms
            .get_mut(room_id)
            .and_then(|messages| messages.iter_mut().find(|m| &m.message_id == message_id))
        else {
            return Ok(false);
        };
        message.content = content.to_string();
        message.edited = true;
        Ok(true)
    }

    async fn mark_message_deleted(
        &self,
        room_id: &RoomId,
        message_id: &MessageId,
    ) -> Result<bool> {
        let mut rooms = self.rooms.write().await;
        let Some(message) = rooms
            .get_mut(room_id)
            .and_then(|messages| messages.iter_mut().find(|m| &m.message_id == message_id))
        else {
            return Ok(false);
        };
        message.deleted = true;
        Ok(true)
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
