//! Extraction source backed by Discord's REST API.
//!
//! Pages backwards through `GET /channels/{id}/messages` with a `before`
//! cursor. Discord returns newest first, so the last record of a page is the
//! cursor for the next one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ExtractionSource, SourceRequest, SourceSession};
use crate::config::{Config, ScrapingSettings};
use crate::error::ScrapeError;
use crate::models::{parse_timestamp, Flag, RawRecord};

const AVATAR_CDN: &str = "https://cdn.discordapp.com/avatars";
const REPLY_MESSAGE_TYPE: u8 = 19;
const MAX_RATE_LIMIT_RETRIES: u32 = 3;
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(30);

pub struct DiscordApiSource {
    client: reqwest::Client,
    base_url: String,
    page_size: u32,
    page_delay: Duration,
}

impl DiscordApiSource {
    pub fn new(
        token: &str,
        base_url: &str,
        page_size: u32,
        page_delay: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ScrapeError> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bot {}", token))
            .map_err(|e| ScrapeError::SourceAcquisition(format!("invalid bot token: {}", e)))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()
            .map_err(|e| {
                ScrapeError::SourceAcquisition(format!("failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            page_size: page_size.clamp(1, 100),
            page_delay,
        })
    }

    pub fn from_config(config: &Config, scraping: &ScrapingSettings) -> anyhow::Result<Self> {
        let source = Self::new(
            config.require_token()?,
            &config.discord_api_base,
            scraping.messages_per_batch,
            Duration::from_millis(scraping.scroll_delay_ms),
            Duration::from_secs(config.source_timeout_secs),
        )?;
        Ok(source)
    }
}

#[async_trait]
impl ExtractionSource for DiscordApiSource {
    fn name(&self) -> &str {
        "discord-api"
    }

    async fn open(&self, request: &SourceRequest) -> Result<Box<dyn SourceSession>, ScrapeError> {
        let channel_url = format!("{}/channels/{}", self.base_url, request.channel_id);
        debug!("Discord API: Checking access to channel {}", request.channel_id);

        let response = self
            .client
            .get(&channel_url)
            .send()
            .await
            .map_err(|e| ScrapeError::SourceAcquisition(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScrapeError::SourceAcquisition(format!(
                "Discord API error: {} - {}",
                status.as_u16(),
                body
            )));
        }

        info!(
            "Discord API: Opened channel {} (lower bound: {:?})",
            request.channel_id, request.lower_bound
        );
        Ok(Box::new(DiscordApiSession {
            client: self.client.clone(),
            messages_url: format!("{}/messages", channel_url),
            page_size: self.page_size,
            page_delay: self.page_delay,
            lower_bound: request.lower_bound,
            before: None,
            page: None,
        }))
    }
}

struct DiscordApiSession {
    client: reqwest::Client,
    messages_url: String,
    page_size: u32,
    page_delay: Duration,
    lower_bound: Option<DateTime<Utc>>,
    before: Option<String>,
    /// The page at the current cursor, fetched lazily.
    page: Option<Vec<ApiMessage>>,
}

impl DiscordApiSession {
    async fn fetch_page(&self) -> Result<Vec<ApiMessage>, ScrapeError> {
        let mut query = vec![("limit", self.page_size.to_string())];
        if let Some(before) = &self.before {
            query.push(("before", before.clone()));
        }

        let mut attempt = 0;
        loop {
            let response = self
                .client
                .get(&self.messages_url)
                .query(&query)
                .send()
                .await
                .map_err(|e| ScrapeError::Extraction(format!("request failed: {}", e)))?;

            let status = response.status();
            if status.is_success() {
                return response.json::<Vec<ApiMessage>>().await.map_err(|e| {
                    ScrapeError::Extraction(format!("invalid messages payload: {}", e))
                });
            }

            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_RATE_LIMIT_RETRIES {
                attempt += 1;
                let wait = retry_after(&body).min(MAX_RATE_LIMIT_WAIT);
                warn!(attempt, ?wait, "Discord API: Rate limited, backing off");
                tokio::time::sleep(wait).await;
                continue;
            }

            return Err(ScrapeError::Extraction(format!(
                "Discord API error: {} - {}",
                status.as_u16(),
                body
            )));
        }
    }

    /// Fetches the page at the current cursor unless it is already loaded.
    async fn load_page(&mut self) -> Result<(), ScrapeError> {
        if self.page.is_none() {
            let page = self.fetch_page().await?;
            debug!(
                "Discord API: Fetched {} messages before {:?}",
                page.len(),
                self.before
            );
            self.page = Some(page);
        }
        Ok(())
    }

    fn is_archived(&self, message: &ApiMessage) -> bool {
        match (self.lower_bound, parse_timestamp(&message.timestamp)) {
            (Some(bound), Some(ts)) => ts <= bound,
            _ => false,
        }
    }
}

#[async_trait]
impl SourceSession for DiscordApiSession {
    async fn next_batch(&mut self) -> Result<Vec<RawRecord>, ScrapeError> {
        self.load_page().await?;
        let page = self.page.as_deref().unwrap_or_default();
        Ok(page
            .iter()
            .filter(|m| !self.is_archived(m))
            .map(ApiMessage::to_raw_record)
            .collect())
    }

    async fn advance(&mut self) -> Result<bool, ScrapeError> {
        self.load_page().await?;
        let page = self.page.as_deref().unwrap_or_default();

        let Some(oldest) = page.last() else {
            return Ok(false);
        };
        let short_page = page.len() < self.page_size as usize;
        let next_cursor = oldest.id.clone();
        let reached_bound = page.iter().any(|m| self.is_archived(m));

        if short_page || reached_bound {
            return Ok(false);
        }

        self.before = Some(next_cursor);
        self.page = None;
        if !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }
        Ok(true)
    }

    async fn close(&mut self) -> Result<(), ScrapeError> {
        self.page = None;
        debug!("Discord API: Closed session for {}", self.messages_url);
        Ok(())
    }
}

fn retry_after(body: &str) -> Duration {
    #[derive(Deserialize)]
    struct RateLimit {
        retry_after: f64,
    }
    serde_json::from_str::<RateLimit>(body)
        .ok()
        .filter(|r| r.retry_after.is_finite() && r.retry_after >= 0.0)
        .map(|r| Duration::from_secs_f64(r.retry_after))
        .unwrap_or_else(|| Duration::from_secs(1))
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    id: String,
    #[serde(rename = "type", default)]
    kind: u8,
    #[serde(default)]
    content: Option<String>,
    timestamp: String,
    #[serde(default)]
    edited_timestamp: Option<String>,
    #[serde(default)]
    pinned: bool,
    author: ApiUser,
    #[serde(default)]
    attachments: Vec<ApiAttachment>,
    #[serde(default)]
    embeds: Vec<serde_json::Value>,
    #[serde(default)]
    message_reference: Option<ApiMessageReference>,
    #[serde(default)]
    referenced_message: Option<ApiReferencedMessage>,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: String,
    username: String,
    #[serde(default)]
    avatar: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiAttachment {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ApiMessageReference {
    #[serde(default)]
    message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiReferencedMessage {
    id: String,
}

impl ApiMessage {
    fn reply_target(&self) -> Option<String> {
        if let Some(referenced) = &self.referenced_message {
            return Some(referenced.id.clone());
        }
        if self.kind == REPLY_MESSAGE_TYPE {
            return self
                .message_reference
                .as_ref()
                .and_then(|r| r.message_id.clone());
        }
        None
    }

    fn to_raw_record(&self) -> RawRecord {
        let attachment_urls: Vec<String> =
            self.attachments.iter().map(|a| a.url.clone()).collect();

        RawRecord {
            id: self.id.clone(),
            author_id: self.author.id.clone(),
            author_name: self.author.username.clone(),
            author_avatar_url: self
                .author
                .avatar
                .as_ref()
                .map(|hash| format!("{}/{}/{}.png", AVATAR_CDN, self.author.id, hash)),
            content: self.content.clone(),
            timestamp: self.timestamp.clone(),
            reply_to_message_id: self.reply_target(),
            edited_timestamp: self.edited_timestamp.clone(),
            is_pinned: Some(Flag::Bool(self.pinned)),
            has_attachments: Some(Flag::Bool(!attachment_urls.is_empty())),
            attachment_urls: (!attachment_urls.is_empty()).then_some(attachment_urls),
            has_embeds: Some(Flag::Bool(!self.embeds.is_empty())),
            embed_data: (!self.embeds.is_empty())
                .then(|| serde_json::Value::Array(self.embeds.clone())),
        }
    }
}
