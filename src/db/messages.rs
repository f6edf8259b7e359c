use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use super::{optional_timestamp_column, timestamp_column, Database};
use crate::error::StorageResult;
use crate::models::{format_timestamp, Message};

const MESSAGE_COLUMNS: &str = "id, channel_id, author_id, author_name, author_avatar_url, content,
     timestamp, reply_to_message_id, edited_timestamp, is_pinned,
     attachment_urls, embed_data, message_url, has_attachments, has_embeds";

impl Database {
    /// Stores a message unless `(channel_id, id)` is already present.
    ///
    /// Returns `true` when a new row was written. A key collision is not an
    /// error and never overwrites the stored row.
    pub fn insert_message(&self, message: &Message) -> StorageResult<bool> {
        debug!(
            "Database: Saving message {} from user {} in channel {}",
            message.id, message.author_id, message.channel_id
        );
        let changed = self.conn().execute(
            &format!(
                "INSERT INTO messages ({MESSAGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(channel_id, id) DO NOTHING"
            ),
            params![
                message.id,
                message.channel_id,
                message.author_id,
                message.author_name,
                message.author_avatar_url,
                message.content,
                format_timestamp(&message.timestamp),
                message.reply_to_message_id,
                message.edited_timestamp.as_ref().map(format_timestamp),
                message.is_pinned,
                message.attachment_urls,
                message.embed_data,
                message.message_url,
                message.has_attachments,
                message.has_embeds,
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn get_message(&self, channel_id: &str, id: &str) -> StorageResult<Option<Message>> {
        let conn = self.conn();
        let message = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE channel_id = ?1 AND id = ?2"),
                [channel_id, id],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }

    /// Looks a message up by id alone. When the id exists in several channels
    /// the earliest stored copy wins.
    pub fn find_message(&self, id: &str) -> StorageResult<Option<Message>> {
        let conn = self.conn();
        let message = conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1
                     ORDER BY rowid LIMIT 1"
                ),
                [id],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }

    /// Most recent first.
    pub fn get_messages_by_channel(
        &self,
        channel_id: &str,
        limit: usize,
        offset: usize,
    ) -> StorageResult<Vec<Message>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE channel_id = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(
            params![channel_id, limit as i64, offset as i64],
            message_from_row,
        )?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Direct replies to `message_id`, oldest first.
    pub fn get_replies(&self, message_id: &str) -> StorageResult<Vec<Message>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE reply_to_message_id = ?1
             ORDER BY timestamp ASC, id ASC"
        ))?;
        let rows = stmt.query_map([message_id], message_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn get_latest_message_timestamp(
        &self,
        channel_id: &str,
    ) -> StorageResult<Option<DateTime<Utc>>> {
        let conn = self.conn();
        let latest = conn.query_row(
            "SELECT MAX(timestamp) AS latest FROM messages WHERE channel_id = ?1",
            [channel_id],
            |row| optional_timestamp_column(row, "latest"),
        )?;
        Ok(latest)
    }

    pub fn count_messages(&self, channel_id: &str) -> StorageResult<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE channel_id = ?1",
            [channel_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get("id")?,
        channel_id: row.get("channel_id")?,
        author_id: row.get("author_id")?,
        author_name: row.get("author_name")?,
        author_avatar_url: row.get("author_avatar_url")?,
        content: row.get("content")?,
        timestamp: timestamp_column(row, "timestamp")?,
        reply_to_message_id: row.get("reply_to_message_id")?,
        edited_timestamp: optional_timestamp_column(row, "edited_timestamp")?,
        is_pinned: row.get("is_pinned")?,
        attachment_urls: row.get("attachment_urls")?,
        embed_data: row.get("embed_data")?,
        message_url: row.get("message_url")?,
        has_attachments: row.get("has_attachments")?,
        has_embeds: row.get("has_embeds")?,
    })
}
