//! SQLite schema for the archive. Timestamps are RFC 3339 UTC text with
//! millisecond precision so that `ORDER BY timestamp` is chronological.

pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS servers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        scraped_at TEXT
    );

    CREATE TABLE IF NOT EXISTS channels (
        id TEXT PRIMARY KEY,
        server_id TEXT NOT NULL REFERENCES servers (id),
        name TEXT NOT NULL,
        message_count INTEGER NOT NULL DEFAULT 0,
        last_message_id TEXT,
        last_message_timestamp TEXT,
        last_scraped TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_channels_server ON channels (server_id);

    -- The same message id may exist in two channels; each is its own row.
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT NOT NULL,
        channel_id TEXT NOT NULL REFERENCES channels (id),
        author_id TEXT NOT NULL,
        author_name TEXT NOT NULL,
        author_avatar_url TEXT,
        content TEXT,
        timestamp TEXT NOT NULL,
        reply_to_message_id TEXT,
        edited_timestamp TEXT,
        is_pinned BOOLEAN NOT NULL DEFAULT FALSE,
        attachment_urls TEXT,
        embed_data TEXT,
        message_url TEXT NOT NULL,
        has_attachments BOOLEAN NOT NULL DEFAULT FALSE,
        has_embeds BOOLEAN NOT NULL DEFAULT FALSE,
        PRIMARY KEY (channel_id, id)
    );
    CREATE INDEX IF NOT EXISTS idx_messages_channel_date ON messages (channel_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_messages_reply_to ON messages (reply_to_message_id);

    CREATE TABLE IF NOT EXISTS scrape_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        channel_id TEXT NOT NULL REFERENCES channels (id),
        status TEXT NOT NULL
            CHECK (status IN ('pending', 'running', 'completed', 'failed', 'interrupted')),
        scrape_type TEXT NOT NULL CHECK (scrape_type IN ('full', 'incremental')),
        started_at TEXT NOT NULL,
        completed_at TEXT,
        messages_scraped INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        resumed_from_job_id INTEGER REFERENCES scrape_jobs (id),
        -- Refreshed by the owning process while the job is running.
        heartbeat_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_scrape_jobs_status ON scrape_jobs (status);
";

pub const DROP_ALL: &str = "
    DROP TABLE IF EXISTS scrape_jobs;
    DROP TABLE IF EXISTS messages;
    DROP TABLE IF EXISTS channels;
    DROP TABLE IF EXISTS servers;
";
