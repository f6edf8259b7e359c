use dotenvy::dotenv;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Process-level settings read from the environment (and `.env`).
#[derive(Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub scrape_config_path: String,
    pub discord_token: Option<String>,
    pub discord_api_base: String,
    pub source_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        Ok(Config {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/scrollback.db".to_string()),
            scrape_config_path: env::var("SCRAPE_CONFIG")
                .unwrap_or_else(|_| "scrape-config.toml".to_string()),
            discord_token: env::var("DISCORD_TOKEN").ok().filter(|t| !t.is_empty()),
            discord_api_base: env::var("DISCORD_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            source_timeout_secs: env::var("SOURCE_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("SOURCE_TIMEOUT_SECS must be a valid u64"))?,
        })
    }

    /// The bot token, required by anything that talks to the Discord API.
    pub fn require_token(&self) -> anyhow::Result<&str> {
        self.discord_token
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("DISCORD_TOKEN must be set"))
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url)
            .field("scrape_config_path", &self.scrape_config_path)
            .field(
                "discord_token",
                &self.discord_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("discord_api_base", &self.discord_api_base)
            .field("source_timeout_secs", &self.source_timeout_secs)
            .finish()
    }
}

/// Contents of the scrape configuration file: scraping knobs plus the
/// servers and channels that may be scraped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeConfig {
    #[serde(default)]
    pub scraping: ScrapingSettings,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapingSettings {
    /// Pause between advance steps; also the retry backoff.
    pub scroll_delay_ms: u64,
    /// Page size requested from paginated sources (1..=100).
    pub messages_per_batch: u32,
    /// Extra attempts allowed for a failing advance step.
    pub max_retries: u32,
    /// Upper bound on batch iterations per job.
    pub max_iterations: u32,
    /// Timeout for opening the source and for each batch / advance step.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub step_timeout: Duration,
    /// How often a running job refreshes its heartbeat. A `running` job
    /// silent for three intervals is treated as abandoned.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub heartbeat_interval: Duration,
}

impl ScrapingSettings {
    /// Age after which a running job's heartbeat counts as stale.
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}

impl Default for ScrapingSettings {
    fn default() -> Self {
        Self {
            scroll_delay_ms: 1500,
            messages_per_batch: 100,
            max_retries: 3,
            max_iterations: 10_000,
            step_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub id: String,
    pub name: String,
}

/// Where a configured channel lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLocation {
    pub server_id: String,
    pub server_name: String,
    pub channel_id: String,
    pub channel_name: String,
}

/// Resolves a channel id to its owning server. `None` means the channel is
/// not configured and must not be scraped.
pub trait ChannelDirectory: Send + Sync {
    fn resolve(&self, channel_id: &str) -> Option<ChannelLocation>;
}

impl ScrapeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ScrapeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let scraping = &self.scraping;
        if !(1..=100).contains(&scraping.messages_per_batch) {
            return Err(ConfigError::Invalid(
                "scraping.messages_per_batch must be between 1 and 100".to_string(),
            ));
        }
        if scraping.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "scraping.max_iterations must be greater than 0".to_string(),
            ));
        }
        if scraping.step_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "scraping.step_timeout must be greater than 0".to_string(),
            ));
        }
        if scraping.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "scraping.heartbeat_interval must be greater than 0".to_string(),
            ));
        }

        let mut server_ids = HashSet::new();
        let mut channel_ids = HashSet::new();
        for server in &self.servers {
            if server.id.trim().is_empty() || server.name.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "Each server must have id and name".to_string(),
                ));
            }
            if !server_ids.insert(server.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate server ID: {}",
                    server.id
                )));
            }
            for channel in &server.channels {
                if channel.id.trim().is_empty() || channel.name.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "Each channel must have id and name (server: {})",
                        server.id
                    )));
                }
                if !channel_ids.insert(channel.id.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "Duplicate channel ID: {}",
                        channel.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn channel_count(&self) -> usize {
        self.servers.iter().map(|s| s.channels.len()).sum()
    }
}

impl ChannelDirectory for ScrapeConfig {
    fn resolve(&self, channel_id: &str) -> Option<ChannelLocation> {
        self.servers.iter().find_map(|server| {
            server
                .channels
                .iter()
                .find(|ch| ch.id == channel_id)
                .map(|ch| ChannelLocation {
                    server_id: server.id.clone(),
                    server_name: server.name.clone(),
                    channel_id: ch.id.clone(),
                    channel_name: ch.name.clone(),
                })
        })
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn serialize_duration<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [scraping]
        scroll_delay_ms = 250
        messages_per_batch = 50
        max_retries = 2
        step_timeout = "45s"
        heartbeat_interval = "5s"

        [[servers]]
        id = "g1"
        name = "Guild"

        [[servers.channels]]
        id = "c1"
        name = "general"

        [[servers.channels]]
        id = "c2"
        name = "random"

        [[servers]]
        id = "g2"
        name = "Other"
    "#;

    #[test]
    fn test_parse_and_resolve() {
        let config = ScrapeConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.scraping.scroll_delay_ms, 250);
        assert_eq!(config.scraping.messages_per_batch, 50);
        assert_eq!(config.scraping.step_timeout, Duration::from_secs(45));
        assert_eq!(config.scraping.stale_after(), Duration::from_secs(15));
        // Unset keys fall back to defaults.
        assert_eq!(config.scraping.max_iterations, 10_000);
        assert_eq!(config.channel_count(), 2);

        let location = config.resolve("c2").unwrap();
        assert_eq!(location.server_id, "g1");
        assert_eq!(location.server_name, "Guild");
        assert_eq!(location.channel_name, "random");
        assert!(config.resolve("c3").is_none());
    }

    #[test]
    fn test_validation_rejects_duplicates() {
        let dup_channel = r#"
            [[servers]]
            id = "g1"
            name = "A"
            [[servers.channels]]
            id = "c1"
            name = "x"
            [[servers]]
            id = "g2"
            name = "B"
            [[servers.channels]]
            id = "c1"
            name = "y"
        "#;
        let err = ScrapeConfig::from_toml(dup_channel).unwrap_err();
        assert!(err.to_string().contains("Duplicate channel ID: c1"));

        let dup_server = r#"
            [[servers]]
            id = "g1"
            name = "A"
            [[servers]]
            id = "g1"
            name = "B"
        "#;
        let err = ScrapeConfig::from_toml(dup_server).unwrap_err();
        assert!(err.to_string().contains("Duplicate server ID: g1"));
    }

    #[test]
    fn test_validation_rejects_bad_scraping_values() {
        let err = ScrapeConfig::from_toml("[scraping]\nmessages_per_batch = 500\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = ScrapeConfig::from_toml("[scraping]\nstep_timeout = \"soon\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = ScrapeConfig::load(file.path()).unwrap();
        assert_eq!(config.servers.len(), 2);

        let missing = ScrapeConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(missing, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_config_debug_redacts_token() {
        let config = Config {
            database_url: ":memory:".to_string(),
            scrape_config_path: "scrape-config.toml".to_string(),
            discord_token: Some("secret_bot_token".to_string()),
            discord_api_base: DEFAULT_API_BASE.to_string(),
            source_timeout_secs: 30,
        };
        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("secret_bot_token"));
        assert!(debug_output.contains("[REDACTED]"));
        assert_eq!(config.require_token().unwrap(), "secret_bot_token");
    }
}
