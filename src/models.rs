//! Domain types shared by the store, the normalizer, the orchestrator and the
//! thread reconstructor.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub scraped_at: Option<DateTime<Utc>>,
}

impl Server {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            scraped_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub server_id: String,
    pub name: String,
    pub message_count: i64,
    pub last_message_id: Option<String>,
    pub last_message_timestamp: Option<DateTime<Utc>>,
    pub last_scraped: Option<DateTime<Utc>>,
}

impl Channel {
    pub fn new(
        id: impl Into<String>,
        server_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            server_id: server_id.into(),
            name: name.into(),
            message_count: 0,
            last_message_id: None,
            last_message_timestamp: None,
            last_scraped: None,
        }
    }
}

/// A stored chat message. Keyed by `(channel_id, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub author_name: String,
    pub author_avatar_url: Option<String>,
    pub content: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub reply_to_message_id: Option<String>,
    pub edited_timestamp: Option<DateTime<Utc>>,
    pub is_pinned: bool,
    /// JSON array of URLs, kept in extraction order.
    pub attachment_urls: Option<String>,
    /// JSON-encoded embed structure.
    pub embed_data: Option<String>,
    pub message_url: String,
    pub has_attachments: bool,
    pub has_embeds: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Interrupted
        )
    }

    /// Whether `completed_at` is stamped when a job enters this status.
    pub fn stamps_completion(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Status transitions only move forward: pending → running → {completed, failed}.
    /// A pending job may fail before it ever runs. `interrupted` is only entered
    /// from `running`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Interrupted)
        )
    }

    /// Statuses from which a job may legally move into `next`.
    pub(crate) fn predecessors(next: JobStatus) -> &'static [JobStatus] {
        use JobStatus::*;
        match next {
            Pending => &[],
            Running => &[Pending],
            Completed => &[Running],
            Failed => &[Pending, Running],
            Interrupted => &[Running],
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "interrupted" => Ok(JobStatus::Interrupted),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrapeType {
    /// No lower time bound; walks the whole history backwards.
    Full,
    /// Bounded below by the channel's last known message timestamp.
    Incremental,
}

impl ScrapeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeType::Full => "full",
            ScrapeType::Incremental => "incremental",
        }
    }
}

impl fmt::Display for ScrapeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScrapeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(ScrapeType::Full),
            "incremental" => Ok(ScrapeType::Incremental),
            other => Err(format!(
                "scrape_type must be \"full\" or \"incremental\", got '{}'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: i64,
    pub channel_id: String,
    pub status: JobStatus,
    pub scrape_type: ScrapeType,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub messages_scraped: i64,
    pub error_message: Option<String>,
    pub resumed_from_job_id: Option<i64>,
    /// Last liveness stamp from the process running the job.
    pub heartbeat_at: Option<DateTime<Utc>>,
}

/// A boolean-ish flag as emitted by extraction sources: a real boolean, an
/// integer (`0` / `1`), or nothing at all.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Flag {
    Bool(bool),
    Int(i64),
}

impl Flag {
    pub fn is_set(flag: Option<Flag>) -> bool {
        match flag {
            Some(Flag::Bool(b)) => b,
            Some(Flag::Int(n)) => n != 0,
            None => false,
        }
    }
}

impl From<bool> for Flag {
    fn from(b: bool) -> Self {
        Flag::Bool(b)
    }
}

/// One message as yielded by an extraction source, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    pub author_id: String,
    pub author_name: String,
    #[serde(default)]
    pub author_avatar_url: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    /// ISO-8601.
    pub timestamp: String,
    #[serde(default)]
    pub reply_to_message_id: Option<String>,
    #[serde(default)]
    pub edited_timestamp: Option<String>,
    #[serde(default)]
    pub is_pinned: Option<Flag>,
    #[serde(default)]
    pub attachment_urls: Option<Vec<String>>,
    #[serde(default)]
    pub embed_data: Option<serde_json::Value>,
    #[serde(default)]
    pub has_attachments: Option<Flag>,
    #[serde(default)]
    pub has_embeds: Option<Flag>,
}

/// Storage representation of a timestamp. Fixed precision keeps lexical
/// ordering in SQLite identical to chronological ordering.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
