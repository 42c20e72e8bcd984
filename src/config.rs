//! Configuration loading and validation.

use crate::TopicId;
use crate::error::{ConfigError, Result};
use crate::messaging::identity::BotFingerprint;

use anyhow::Context as _;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

const TOKEN_ENV: &str = "TOPICBOT_TELEGRAM_TOKEN";
const CHAT_ID_ENV: &str = "TOPICBOT_TELEGRAM_CHAT_ID";
const INSTANCE_DIR_ENV: &str = "TOPICBOT_DIR";

/// Topicbot configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Instance directory (config file, logs).
    pub instance_dir: PathBuf,

    /// Telegram bot credentials and topic bindings.
    pub telegram: TelegramConfig,

    /// Long-poll and buffer tuning.
    pub polling: PollingConfig,
}

/// Primary bot token, group chat, and topic-bound agent tokens.
#[derive(Clone)]
pub struct TelegramConfig {
    pub token: String,
    /// The forum group all topics live in.
    pub chat_id: i64,
    /// Topic id to agent bot token.
    pub agents: BTreeMap<TopicId, String>,
}

impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let agents: BTreeMap<_, _> = self
            .agents
            .iter()
            .map(|(topic_id, token)| (*topic_id, BotFingerprint::from_token(token)))
            .collect();
        f.debug_struct("TelegramConfig")
            .field("token", &"[redacted]")
            .field("chat_id", &self.chat_id)
            .field("agents", &agents)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Server-side long-poll timeout.
    pub timeout_secs: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Merge channel capacity shared by all pollers.
    pub merge_capacity: usize,
    pub sent_index_capacity: usize,
    /// Update ids remembered per bot for duplicate suppression.
    pub dedup_window: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            merge_capacity: 256,
            sent_index_capacity: 2048,
            dedup_window: 1024,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    messaging: TomlMessaging,
    #[serde(default)]
    polling: PollingConfig,
}

#[derive(Debug, Default, Deserialize)]
struct TomlMessaging {
    telegram: Option<TomlTelegram>,
}

#[derive(Debug, Default, Deserialize)]
struct TomlTelegram {
    token: Option<String>,
    chat_id: Option<i64>,
    #[serde(default)]
    agents: BTreeMap<String, String>,
}

/// Default instance directory: `$TOPICBOT_DIR`, else `<data dir>/topicbot`.
pub fn default_instance_dir() -> PathBuf {
    std::env::var_os(INSTANCE_DIR_ENV)
        .map(PathBuf::from)
        .or_else(|| dirs::data_dir().map(|dir| dir.join("topicbot")))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

impl Config {
    /// Load `<instance dir>/config.toml`, or build from the environment alone
    /// if there is no config file.
    pub fn load() -> Result<Self> {
        let instance_dir = default_instance_dir();

        std::fs::create_dir_all(&instance_dir).with_context(|| {
            format!("failed to create instance directory: {}", instance_dir.display())
        })?;

        let config_path = instance_dir.join("config.toml");
        if config_path.exists() {
            return Self::load_from_path(&config_path);
        }

        tracing::info!(path = %config_path.display(), "no config file, using environment only");
        Self::from_toml(
            "",
            &config_path.display().to_string(),
            instance_dir,
            &|name| std::env::var(name).ok(),
        )
    }

    /// Load from a specific config file path. The instance directory is the
    /// file's parent.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|error| ConfigError::Load {
            path: path.display().to_string(),
            source: error.into(),
        })?;

        let instance_dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(default_instance_dir);

        Self::from_toml(
            &content,
            &path.display().to_string(),
            instance_dir,
            &|name| std::env::var(name).ok(),
        )
    }

    /// Parse, apply environment overrides, and validate.
    fn from_toml(
        content: &str,
        source: &str,
        instance_dir: PathBuf,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut document: toml_edit::DocumentMut =
            content.parse().map_err(|error: toml_edit::TomlError| ConfigError::Parse {
                path: source.to_owned(),
                message: error.to_string(),
            })?;

        if migrate_legacy_telegram(&mut document)? {
            tracing::warn!(
                path = source,
                "config uses legacy top-level telegram keys; run `topicbot migrate-config` to update it"
            );
        }

        let raw: TomlConfig =
            toml::from_str(&document.to_string()).map_err(|error| ConfigError::Parse {
                path: source.to_owned(),
                message: error.to_string(),
            })?;

        let telegram = raw.messaging.telegram.unwrap_or_default();

        let token = env(TOKEN_ENV)
            .or(telegram.token)
            .ok_or_else(|| ConfigError::MissingKey("messaging.telegram.token".into()))?;

        let chat_id = match env(CHAT_ID_ENV) {
            Some(value) => value.trim().parse::<i64>().map_err(|_| {
                ConfigError::Invalid(format!("{CHAT_ID_ENV} must be an integer chat id, got {value:?}"))
            })?,
            None => telegram
                .chat_id
                .ok_or_else(|| ConfigError::MissingKey("messaging.telegram.chat_id".into()))?,
        };

        let mut agents = BTreeMap::new();
        for (topic_key, agent_token) in telegram.agents {
            let topic_id = topic_key.trim().parse::<TopicId>().map_err(|_| {
                ConfigError::Invalid(format!(
                    "agent topic key {topic_key:?} is not an integer topic id"
                ))
            })?;
            if agents.insert(topic_id, agent_token).is_some() {
                return Err(ConfigError::Invalid(format!("topic {topic_id} is bound more than once")).into());
            }
        }

        let config = Self {
            instance_dir,
            telegram: TelegramConfig {
                token,
                chat_id,
                agents,
            },
            polling: raw.polling,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the rules that must hold before any connection is opened.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let telegram = &self.telegram;

        if telegram.token.trim().is_empty() {
            return Err(ConfigError::Invalid("primary bot token must not be empty".into()));
        }

        let mut seen: HashMap<&str, TopicId> = HashMap::new();
        for (topic_id, token) in &telegram.agents {
            if token.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "agent token for topic {topic_id} must not be empty"
                )));
            }
            if token == &telegram.token {
                return Err(ConfigError::Invalid(format!(
                    "agent token for topic {topic_id} must not match the primary bot token"
                )));
            }
            if let Some(existing) = seen.insert(token.as_str(), *topic_id) {
                return Err(ConfigError::Invalid(format!(
                    "agent token for topic {topic_id} is a duplicate of another agent (topic {existing})"
                )));
            }
        }

        let polling = &self.polling;
        for (name, value) in [
            ("merge_capacity", polling.merge_capacity),
            ("sent_index_capacity", polling.sent_index_capacity),
            ("dedup_window", polling.dedup_window),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("polling.{name} must be greater than zero")));
            }
        }
        if polling.initial_backoff_ms == 0 {
            return Err(ConfigError::Invalid(
                "polling.initial_backoff_ms must be greater than zero".into(),
            ));
        }
        if polling.max_backoff_ms < polling.initial_backoff_ms {
            return Err(ConfigError::Invalid(
                "polling.max_backoff_ms must not be less than polling.initial_backoff_ms".into(),
            ));
        }

        Ok(())
    }

    /// Number of bots this config will start.
    pub fn bot_count(&self) -> usize {
        1 + self.telegram.agents.len()
    }
}

/// Move legacy top-level `bot_token` / `chat_id` keys into
/// `[messaging.telegram]`, keeping the rest of the document untouched. Keys
/// already present under `[messaging.telegram]` win. Returns whether anything
/// changed.
pub fn migrate_legacy_telegram(
    document: &mut toml_edit::DocumentMut,
) -> std::result::Result<bool, ConfigError> {
    let legacy_token = document.remove("bot_token");
    let legacy_chat_id = document.remove("chat_id");
    if legacy_token.is_none() && legacy_chat_id.is_none() {
        return Ok(false);
    }

    if document.get("messaging").is_none() {
        let mut messaging = toml_edit::Table::new();
        messaging.set_implicit(true);
        document["messaging"] = toml_edit::Item::Table(messaging);
    }
    let messaging = document["messaging"]
        .as_table_mut()
        .ok_or_else(|| ConfigError::Invalid("`messaging` must be a table".into()))?;

    if !messaging.contains_key("telegram") {
        messaging["telegram"] = toml_edit::Item::Table(toml_edit::Table::new());
    }
    let telegram = messaging["telegram"]
        .as_table_mut()
        .ok_or_else(|| ConfigError::Invalid("`messaging.telegram` must be a table".into()))?;

    for (key, value) in [("token", legacy_token), ("chat_id", legacy_chat_id)] {
        if let Some(value) = value
            && !telegram.contains_key(key)
        {
            telegram.insert(key, value);
        }
    }

    Ok(true)
}

/// Rewrite a config file in place with legacy keys migrated. Returns whether
/// the file was changed.
pub fn migrate_config_file(path: &Path) -> Result<bool> {
    let content = std::fs::read_to_string(path).map_err(|error| ConfigError::Load {
        path: path.display().to_string(),
        source: error.into(),
    })?;

    let mut document: toml_edit::DocumentMut =
        content.parse().map_err(|error: toml_edit::TomlError| ConfigError::Parse {
            path: path.display().to_string(),
            message: error.to_string(),
        })?;

    if !migrate_legacy_telegram(&mut document)? {
        return Ok(false);
    }

    std::fs::write(path, document.to_string())
        .with_context(|| format!("failed to write migrated config: {}", path.display()))?;
    tracing::info!(path = %path.display(), "migrated legacy telegram config keys");
    Ok(true)
}
