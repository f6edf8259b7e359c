use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::StorageResult;
use crate::models::{format_timestamp, parse_timestamp, Channel, Server};

mod jobs;
mod messages;
pub mod schema;

/// Durable message store. All writers share one connection behind a mutex, so
/// writes are serialized and reads see committed state.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(config: &Config) -> StorageResult<Self> {
        Self::open(&config.database_url)
    }

    pub fn open(path: &str) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        if path != ":memory:" {
            // WAL lets readers proceed while a scrape is writing.
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied statement
        // behind, so a poisoned guard is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn execute_init(&self) -> StorageResult<()> {
        info!("Database: Initializing schema...");
        self.conn().execute_batch(schema::SCHEMA)?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    /// Drops every table and recreates the schema.
    pub fn reset(&self) -> StorageResult<()> {
        info!("Database: Dropping all tables");
        self.conn().execute_batch(schema::DROP_ALL)?;
        self.execute_init()
    }

    /// Runs a store operation on the blocking pool so async callers never hold
    /// the connection lock on a runtime worker.
    pub async fn run_blocking<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Database) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    // --- Servers ---

    /// Inserts a server unless one with the same id exists. Returns whether a
    /// row was written; an existing server keeps its name.
    pub fn insert_server(&self, server: &Server) -> StorageResult<bool> {
        let changed = self.conn().execute(
            "INSERT INTO servers (id, name, scraped_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO NOTHING",
            params![
                server.id,
                server.name,
                server.scraped_at.as_ref().map(format_timestamp)
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn get_server(&self, id: &str) -> StorageResult<Option<Server>> {
        let conn = self.conn();
        let server = conn
            .query_row(
                "SELECT id, name, scraped_at FROM servers WHERE id = ?1",
                [id],
                server_from_row,
            )
            .optional()?;
        Ok(server)
    }

    pub fn list_servers(&self) -> StorageResult<Vec<Server>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, name, scraped_at FROM servers ORDER BY name")?;
        let rows = stmt.query_map([], server_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn mark_server_scraped(&self, id: &str, at: DateTime<Utc>) -> StorageResult<()> {
        self.conn().execute(
            "UPDATE servers SET scraped_at = ?1 WHERE id = ?2",
            params![format_timestamp(&at), id],
        )?;
        Ok(())
    }

    // --- Channels ---

    /// Inserts a channel unless one with the same id exists. The owning server
    /// must already be stored.
    pub fn insert_channel(&self, channel: &Channel) -> StorageResult<bool> {
        let changed = self.conn().execute(
            "INSERT INTO channels
             (id, server_id, name, message_count, last_message_id, last_message_timestamp, last_scraped)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO NOTHING",
            params![
                channel.id,
                channel.server_id,
                channel.name,
                channel.message_count,
                channel.last_message_id,
                channel.last_message_timestamp.as_ref().map(format_timestamp),
                channel.last_scraped.as_ref().map(format_timestamp),
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn get_channel(&self, id: &str) -> StorageResult<Option<Channel>> {
        let conn = self.conn();
        let channel = conn
            .query_row(
                "SELECT id, server_id, name, message_count, last_message_id,
                        last_message_timestamp, last_scraped
                 FROM channels WHERE id = ?1",
                [id],
                channel_from_row,
            )
            .optional()?;
        Ok(channel)
    }

    pub fn list_channels_by_server(&self, server_id: &str) -> StorageResult<Vec<Channel>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, server_id, name, message_count, last_message_id,
                    last_message_timestamp, last_scraped
             FROM channels WHERE server_id = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map([server_id], channel_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Records the outcome of a finished pass: syncs `message_count` with
    /// the rows stored for the channel, stamps `last_scraped`, and advances
    /// the last-message marker when `newest` is more recent than what is
    /// stored. Rows written by earlier unfinished jobs are counted too.
    pub fn update_channel_after_scrape(
        &self,
        channel_id: &str,
        newest: Option<(&str, DateTime<Utc>)>,
    ) -> StorageResult<()> {
        let (last_id, last_ts) = match newest {
            Some((id, ts)) => (Some(id), Some(format_timestamp(&ts))),
            None => (None, None),
        };

        // SET expressions all read the pre-update row, so both CASEs compare
        // against the old marker.
        self.conn().execute(
            "UPDATE channels
             SET last_scraped = ?1,
                 message_count = MAX(
                     message_count,
                     (SELECT COUNT(*) FROM messages WHERE messages.channel_id = ?4)
                 ),
                 last_message_id = CASE
                     WHEN ?3 IS NOT NULL AND (last_message_timestamp IS NULL OR ?3 > last_message_timestamp)
                     THEN ?2 ELSE last_message_id END,
                 last_message_timestamp = CASE
                     WHEN ?3 IS NOT NULL AND (last_message_timestamp IS NULL OR ?3 > last_message_timestamp)
                     THEN ?3 ELSE last_message_timestamp END
             WHERE id = ?4",
            params![format_timestamp(&Utc::now()), last_id, last_ts, channel_id],
        )?;
        Ok(())
    }
}

/// Reads a required RFC 3339 text column.
pub(crate) fn timestamp_column(row: &Row<'_>, name: &str) -> rusqlite::Result<DateTime<Utc>> {
    let idx = row.as_ref().column_index(name)?;
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid timestamp '{}'", raw).into(),
        )
    })
}

/// Reads a nullable RFC 3339 text column.
pub(crate) fn optional_timestamp_column(
    row: &Row<'_>,
    name: &str,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let idx = row.as_ref().column_index(name)?;
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(raw) => parse_timestamp(&raw).map(Some).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                format!("invalid timestamp '{}'", raw).into(),
            )
        }),
    }
}

fn server_from_row(row: &Row<'_>) -> rusqlite::Result<Server> {
    Ok(Server {
        id: row.get("id")?,
        name: row.get("name")?,
        scraped_at: optional_timestamp_column(row, "scraped_at")?,
    })
}

fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: row.get("id")?,
        server_id: row.get("server_id")?,
        name: row.get("name")?,
        message_count: row.get("message_count")?,
        last_message_id: row.get("last_message_id")?,
        last_message_timestamp: optional_timestamp_column(row, "last_message_timestamp")?,
        last_scraped: optional_timestamp_column(row, "last_scraped")?,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::models::Message;

    pub fn memory_db() -> Database {
        let db = Database::open(":memory:").unwrap();
        db.execute_init().unwrap();
        db
    }

    /// In-memory store seeded with server `g1` and channel `c1`.
    pub fn seeded_db() -> Database {
        let db = memory_db();
        db.insert_server(&Server::new("g1", "Guild")).unwrap();
        db.insert_channel(&Channel::new("c1", "g1", "general")).unwrap();
        db
    }

    pub fn message(id: &str, channel_id: &str, ts: &str, reply_to: Option<&str>) -> Message {
        Message {
            id: id.to_string(),
            channel_id: channel_id.to_string(),
            author_id: "u1".to_string(),
            author_name: "Alice".to_string(),
            author_avatar_url: None,
            content: Some(format!("message {}", id)),
            timestamp: parse_timestamp(ts).unwrap(),
            reply_to_message_id: reply_to.map(str::to_string),
            edited_timestamp: None,
            is_pinned: false,
            attachment_urls: None,
            embed_data: None,
            message_url: format!("https://discord.com/channels/g1/{}/{}", channel_id, id),
            has_attachments: false,
            has_embeds: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_db_init_is_idempotent() {
        let db = memory_db();
        db.execute_init().unwrap();

        let conn = db.conn();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(tables, vec!["channels", "messages", "scrape_jobs", "servers"]);
    }

    #[test]
    fn test_server_insert_ignores_duplicates() {
        let db = memory_db();

        assert!(db.insert_server(&Server::new("g1", "Original")).unwrap());
        assert!(!db.insert_server(&Server::new("g1", "Renamed")).unwrap());

        let server = db.get_server("g1").unwrap().unwrap();
        assert_eq!(server.name, "Original");
        assert_eq!(db.list_servers().unwrap().len(), 1);
    }

    #[test]
    fn test_channel_requires_existing_server() {
        let db = memory_db();
        let result = db.insert_channel(&Channel::new("c1", "missing", "general"));
        assert!(result.is_err(), "foreign key violation must surface");

        db.insert_server(&Server::new("g1", "Guild")).unwrap();
        assert!(db.insert_channel(&Channel::new("c1", "g1", "general")).unwrap());
        assert!(!db.insert_channel(&Channel::new("c1", "g1", "renamed")).unwrap());

        let channels = db.list_channels_by_server("g1").unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "general");
        assert_eq!(channels[0].message_count, 0);
    }

    #[test]
    fn test_update_channel_after_scrape_only_moves_forward() {
        let db = seeded_db();
        let newer = parse_timestamp("2024-03-01T00:00:00Z").unwrap();
        let older = parse_timestamp("2024-01-01T00:00:00Z").unwrap();

        db.insert_message(&message("m1", "c1", "2024-01-01T00:00:00Z", None))
            .unwrap();
        db.insert_message(&message("m9", "c1", "2024-03-01T00:00:00Z", None))
            .unwrap();

        db.update_channel_after_scrape("c1", Some(("m9", newer))).unwrap();
        db.update_channel_after_scrape("c1", Some(("m1", older))).unwrap();
        db.update_channel_after_scrape("c1", None).unwrap();

        let channel = db.get_channel("c1").unwrap().unwrap();
        assert_eq!(channel.message_count, 2);
        assert_eq!(channel.last_message_id.as_deref(), Some("m9"));
        assert_eq!(channel.last_message_timestamp, Some(newer));
        assert!(channel.last_scraped.is_some());
    }

    #[test]
    fn test_reset_clears_everything() {
        let db = seeded_db();
        db.insert_message(&message("m1", "c1", "2024-01-01T00:00:00Z", None))
            .unwrap();

        db.reset().unwrap();
        assert!(db.get_server("g1").unwrap().is_none());
        assert!(db.get_channel("c1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_blocking() {
        let db = seeded_db();
        let channel = db
            .run_blocking(|db| db.get_channel("c1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(channel.server_id, "g1");
    }
}
