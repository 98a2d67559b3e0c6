//! Configuration loader and validator for the syndication bot.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub telegram: Telegram,
    pub channels: Channels,
    pub translation: Translation,
    pub routing: Routing,
    pub links: Links,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub data_dir: String,
    /// Edited messages are reprocessed after this many seconds, so rapid
    /// edit bursts collapse into one update.
    pub edit_debounce_seconds: u64,
    /// Edits to messages older than this are ignored.
    pub edit_max_age_days: i64,
}

/// Messaging-platform session settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Telegram {
    pub bot_token: String,
    /// When set, the watch set is restricted to sources owned by this
    /// account id. Otherwise all active sources are watched.
    pub api_id: Option<i64>,
}

/// Well-known service channels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channels {
    /// Archive channel receiving an unmodified forward of every post.
    pub backup: i64,
    /// Review channel receiving rejected-but-ambiguous posts.
    pub review: i64,
}

/// Translation backends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Translation {
    pub deepl_key: String,
    pub target_lang: String,
}

/// Content-based destination routing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Routing {
    pub openrouter_key: String,
    pub model: String,
}

/// Base URLs for the attribution footer anchors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Links {
    /// Public link base of the backup channel, e.g. `https://t.me/nn_backup`.
    pub backup_base: String,
    /// Public link base of the source-details channel.
    pub detail_base: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.edit_max_age_days <= 0 {
        return Err(ConfigError::Invalid("app.edit_max_age_days must be > 0"));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }

    if cfg.channels.backup == 0 {
        return Err(ConfigError::Invalid("channels.backup must be set"));
    }
    if cfg.channels.review == 0 {
        return Err(ConfigError::Invalid("channels.review must be set"));
    }

    if cfg.translation.deepl_key.trim().is_empty() {
        return Err(ConfigError::Invalid("translation.deepl_key must be non-empty"));
    }
    if cfg.translation.target_lang.trim().is_empty() {
        return Err(ConfigError::Invalid("translation.target_lang must be non-empty"));
    }

    if cfg.routing.openrouter_key.trim().is_empty() {
        return Err(ConfigError::Invalid("routing.openrouter_key must be non-empty"));
    }
    if cfg.routing.model.trim().is_empty() {
        return Err(ConfigError::Invalid("routing.model must be non-empty"));
    }

    if cfg.links.backup_base.trim().is_empty() {
        return Err(ConfigError::Invalid("links.backup_base must be non-empty"));
    }
    if cfg.links.detail_base.trim().is_empty() {
        return Err(ConfigError::Invalid("links.detail_base must be non-empty"));
    }

    Ok(())
}

/// Example YAML configuration, also used as a fixture by tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  edit_debounce_seconds: 60
  edit_max_age_days: 7

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  api_id: 1723195

channels:
  backup: -1001861018052
  review: -1001895734902

translation:
  deepl_key: "YOUR_DEEPL_KEY"
  target_lang: "de"

routing:
  openrouter_key: "YOUR_OPENROUTER_KEY"
  model: "anthropic/claude-3.5-sonnet"

links:
  backup_base: "https://t.me/nn_backup"
  detail_base: "https://t.me/nn_sources"
"#
}
