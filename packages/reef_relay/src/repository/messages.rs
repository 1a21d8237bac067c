use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::{Repository, UserColumn};
use crate::cache::{CacheEntity, CacheError, PageCache, Side};
use crate::models::Message;

/// Which side of the anchor a history page is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Strictly older than the anchor (the infinite-scroll direction).
    #[default]
    Before,
    /// Strictly newer than the anchor.
    After,
}

const MESSAGE_COLUMNS: &str = "seq, message_uuid, content, created_at, room, user, system_message";

impl Repository {
    /// Persist a message and point its room at it, refreshing a cached copy
    /// of the room as well. Caching the message itself is the caller's
    /// concern.
    pub async fn add_message(&self, cache: &mut PageCache, message: &Message) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO messages (message_uuid, content, created_at, room, user, system_message)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.uuid)
        .bind(&message.content)
        .bind(message.created_at)
        .bind(&message.room_uuid)
        .bind(&message.user_uuid)
        .bind(message.system_message as i64)
        .execute(&self.pool)
        .await
        .context("Failed to insert message")?;

        sqlx::query("UPDATE rooms SET last_message = ? WHERE uuid = ?")
            .bind(&message.uuid)
            .bind(&message.room_uuid)
            .execute(&self.pool)
            .await?;

        match cache.get_room(&message.room_uuid) {
            Ok(room) => {
                let mut room = room.clone();
                room.last_message_uuid = Some(message.uuid.clone());
                cache.update(CacheEntity::Room(room))?;
            }
            Err(CacheError::NotFound(_)) => {}
            Err(defect) => return Err(defect.into()),
        }

        Ok(result.last_insert_rowid())
    }

    /// Cache-first message lookup. A storage hit resolves the room and user
    /// references through the façade (landing them in the cache as well)
    /// before backfilling the message itself.
    pub async fn fetch_message_by_uuid(
        &self,
        cache: &mut PageCache,
        uuid: &str,
    ) -> Result<Option<Message>> {
        match cache.get_message(uuid) {
            Ok(message) => return Ok(Some(message.clone())),
            Err(CacheError::NotFound(_)) => {}
            Err(defect) => return Err(defect.into()),
        }

        let query = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_uuid = ?");
        let row = sqlx::query(&query)
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let message = message_from_row(&row);
        self.fetch_room_by_uuid(cache, &message.room_uuid).await?;
        self.fetch_user_by(cache, UserColumn::Uuid, &message.user_uuid)
            .await?;
        cache.cache_to(Side::Bottom, CacheEntity::Message(message.clone()));
        Ok(Some(message))
    }

    /// An ordered page of one room's history, oldest first, at most `amount`
    /// messages, strictly before/after the anchor when one is given.
    pub async fn fetch_recent_messages(
        &self,
        amount: i64,
        room_uuid: &str,
        anchor: Option<&str>,
        direction: Direction,
    ) -> Result<Vec<Message>> {
        let rows = match (anchor, direction) {
            (None, _) => {
                let query = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE room = ? ORDER BY seq DESC LIMIT ?"
                );
                sqlx::query(&query)
                    .bind(room_uuid)
                    .bind(amount)
                    .fetch_all(&self.pool)
                    .await?
            }
            (Some(anchor), Direction::Before) => {
                let query = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE room = ?
                       AND seq < (SELECT seq FROM messages WHERE message_uuid = ?)
                     ORDER BY seq DESC LIMIT ?"
                );
                sqlx::query(&query)
                    .bind(room_uuid)
                    .bind(anchor)
                    .bind(amount)
                    .fetch_all(&self.pool)
                    .await?
            }
            (Some(anchor), Direction::After) => {
                let query = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE room = ?
                       AND seq > (SELECT seq FROM messages WHERE message_uuid = ?)
                     ORDER BY seq ASC LIMIT ?"
                );
                return Ok(sqlx::query(&query)
                    .bind(room_uuid)
                    .bind(anchor)
                    .bind(amount)
                    .fetch_all(&self.pool)
                    .await?
                    .iter()
                    .map(message_from_row)
                    .collect());
            }
        };

        // Newest-first pages flip to natural reading order.
        let mut messages: Vec<Message> = rows.iter().map(message_from_row).collect();
        messages.reverse();
        Ok(messages)
    }
}

fn message_from_row(row: &SqliteRow) -> Message {
    Message {
        seq: Some(row.get("seq")),
        uuid: row.get("message_uuid"),
        content: row.get("content"),
        created_at: row.get("created_at"),
        room_uuid: row.get("room"),
        user_uuid: row.get("user"),
        system_message: row.get::<i64, _>("system_message") != 0,
    }
}
