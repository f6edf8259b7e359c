//! The extraction source capability.
//!
//! A source hands out independent [`SourceSession`]s, one per job. A session
//! is stateful and strictly sequential: pull a batch, advance, repeat until
//! `advance` reports that nothing further exists. Whether the backing
//! implementation is a scrollable UI or a paginated API is invisible to the
//! orchestrator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ScrapeError;
use crate::models::{RawRecord, ScrapeType};

pub mod discord_api;

pub use discord_api::DiscordApiSource;

/// What a job asks the source to extract.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRequest {
    pub server_id: String,
    pub channel_id: String,
    pub scrape_type: ScrapeType,
    /// Records at or before this instant are already archived. The source
    /// decides how to use it to stop early; `None` means walk the full history.
    pub lower_bound: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ExtractionSource: Send + Sync {
    fn name(&self) -> &str;

    /// Opens a new session for `request`. Failures are reported as
    /// [`ScrapeError::SourceAcquisition`].
    async fn open(&self, request: &SourceRequest) -> Result<Box<dyn SourceSession>, ScrapeError>;
}

#[async_trait]
pub trait SourceSession: Send {
    /// Records currently visible. May be empty and may overlap with records
    /// returned by earlier batches of the same session.
    async fn next_batch(&mut self) -> Result<Vec<RawRecord>, ScrapeError>;

    /// Moves further back in history. Returns `false` once no further data
    /// exists.
    async fn advance(&mut self) -> Result<bool, ScrapeError>;

    /// Releases whatever the session holds. Called exactly once, on every
    /// exit path.
    async fn close(&mut self) -> Result<(), ScrapeError>;
}
