//! Configuration loading and management
//!
//! Handles parsing of `.taskboard.toml` configuration files.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::task::UserId;

pub const CONFIG_FILE_NAME: &str = ".taskboard.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Signed-in user
    #[serde(default)]
    pub user: UserConfig,

    /// Change feed configuration
    #[serde(default)]
    pub feed: FeedConfig,

    /// Reconciliation store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// View defaults
    #[serde(default)]
    pub views: ViewsConfig,
}

/// The user the client acts as.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl UserConfig {
    pub fn user_id(&self) -> Option<UserId> {
        self.id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(UserId::new)
    }
}

/// Change feed configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Signals buffered between the feed reader and the session
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Base delay between reconnect attempts, multiplied by the attempt number
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// Consecutive failed connects before the subscription gives up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_channel_capacity() -> usize {
    256
}

fn default_reconnect_backoff_ms() -> u64 {
    500
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl FeedConfig {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn reconnect_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms.saturating_mul(u64::from(attempt)))
    }

    fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(Error::InvalidConfig(
                "feed.channel_capacity must be >= 1".to_string(),
            ));
        }
        if self.reconnect_backoff_ms > 60_000 {
            return Err(Error::InvalidConfig(
                "feed.reconnect_backoff_ms must be <= 60000".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reconciliation store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Apply local mutations before the server confirms them
    #[serde(default = "default_true")]
    pub optimistic: bool,

    /// Events held while waiting for a seed before the buffer is discarded
    #[serde(default = "default_buffer_limit")]
    pub buffer_limit: usize,
}

fn default_true() -> bool {
    true
}

fn default_buffer_limit() -> usize {
    crate::store::DEFAULT_BUFFER_LIMIT
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            optimistic: true,
            buffer_limit: default_buffer_limit(),
        }
    }
}

impl StoreConfig {
    fn validate(&self) -> Result<()> {
        if self.buffer_limit == 0 {
            return Err(Error::InvalidConfig(
                "store.buffer_limit must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which projection a view opens with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    All,
    Mine,
    Day,
}

impl ViewKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "all" => Some(ViewKind::All),
            "mine" => Some(ViewKind::Mine),
            "day" => Some(ViewKind::Day),
            _ => None,
        }
    }
}

/// View defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewsConfig {
    #[serde(default = "default_view")]
    pub default: String,
}

fn default_view() -> String {
    "all".to_string()
}

impl Default for ViewsConfig {
    fn default() -> Self {
        Self {
            default: default_view(),
        }
    }
}

impl ViewsConfig {
    pub fn default_kind(&self) -> ViewKind {
        ViewKind::parse(&self.default).unwrap_or(ViewKind::All)
    }

    fn validate(&self) -> Result<()> {
        if ViewKind::parse(&self.default).is_none() {
            return Err(Error::InvalidConfig(format!(
                "views.default: invalid view '{}' (expected all|mine|day)",
                self.default
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a `.taskboard.toml` file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path`, or return defaults when it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.feed.validate()?;
        self.store.validate()?;
        self.views.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_expected() {
        let config = Config::default();
        assert_eq!(config.user.user_id(), None);
        assert_eq!(config.feed.channel_capacity, 256);
        assert_eq!(config.feed.reconnect_backoff_ms, 500);
        assert_eq!(config.feed.max_reconnect_attempts, 5);
        assert!(config.store.optimistic);
        assert_eq!(config.store.buffer_limit, 1024);
        assert_eq!(config.views.default_kind(), ViewKind::All);
    }

    #[test]
    fn backoff_is_linear() {
        let feed = FeedConfig {
            reconnect_backoff_ms: 250,
            ..FeedConfig::default()
        };
        assert_eq!(feed.reconnect_backoff(1), Duration::from_millis(250));
        assert_eq!(feed.reconnect_backoff(4), Duration::from_secs(1));
    }

    #[test]
    fn load_parses_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        let content = r#"
[user]
id = "  u-42 "
email = "me@example.com"

[feed]
channel_capacity = 16
max_reconnect_attempts = 0

[store]
optimistic = false

[views]
default = "Mine"
"#;
        std::fs::write(&path, content).expect("write config");

        let config = Config::load(&path).expect("load config");
        assert_eq!(config.user.user_id(), Some(UserId::new("u-42")));
        assert_eq!(config.feed.channel_capacity, 16);
        assert_eq!(config.feed.reconnect_backoff_ms, 500);
        assert_eq!(config.feed.max_reconnect_attempts, 0);
        assert!(!config.store.optimistic);
        assert_eq!(config.store.buffer_limit, 1024);
        assert_eq!(config.views.default_kind(), ViewKind::Mine);
    }

    #[test]
    fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);

        std::fs::write(&path, "[views]\ndefault = \"week\"\n").expect("write config");
        let err = Config::load(&path).expect_err("invalid view");
        assert!(matches!(err, Error::InvalidConfig(_)));

        std::fs::write(&path, "[store]\nbuffer_limit = 0\n").expect("write config");
        let err = Config::load(&path).expect_err("zero buffer");
        assert!(err.to_string().contains("store.buffer_limit"));
    }

    #[test]
    fn save_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut config = Config::default();
        config.user.id = Some("u1".to_string());
        config.save(&path).expect("save");
        assert_eq!(Config::load(&path).expect("load"), config);
    }
}
