//! Server settings
//!
//! Every setting comes from a `CHAT_*` environment variable with a default.
//! `main` loads a `.env` file first, if one exists.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Listen address, `host:port`
    pub addr: String,
    /// History file written on shutdown and read on startup
    pub backup_file: PathBuf,
    /// Name shown in the welcome banner
    pub chat_name: String,
    /// Broadcast messages replayed to a first-time user
    pub history_len: usize,
    /// Broadcasts allowed per user per `rate_window`
    pub rate_limit: u32,
    pub rate_window: Duration,
    /// Maximum age of restored messages
    pub message_ttl: Duration,
    /// Tick of the delayed delivery loop
    pub delivery_interval: Duration,
    /// Disconnect sessions silent for this long
    pub idle_timeout: Option<Duration>,
    /// Whether `/stop` from a client shuts the server down
    pub allow_remote_stop: bool,
    /// Generated messages added to the history at startup
    pub seed_messages: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
            backup_file: PathBuf::from("messages.json"),
            chat_name: "Public".to_string(),
            history_len: 3,
            rate_limit: 5,
            rate_window: Duration::from_secs(3600),
            message_ttl: Duration::from_secs(3600),
            delivery_interval: Duration::from_secs(1),
            idle_timeout: None,
            allow_remote_stop: true,
            seed_messages: 0,
        }
    }
}

impl Settings {
    /// Load settings from the process environment
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Settings::default();

        let host = lookup("CHAT_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port: u16 = parse_or(&lookup, "CHAT_PORT", 8000)?;

        Ok(Self {
            addr: format!("{}:{}", host, port),
            backup_file: lookup("CHAT_BACKUP_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.backup_file),
            chat_name: lookup("CHAT_NAME").unwrap_or(defaults.chat_name),
            history_len: parse_or(&lookup, "CHAT_HISTORY_LEN", defaults.history_len)?,
            rate_limit: parse_or(&lookup, "CHAT_RATE_LIMIT", defaults.rate_limit)?,
            rate_window: Duration::from_secs(parse_or(&lookup, "CHAT_RATE_WINDOW_SECS", 3600)?),
            message_ttl: Duration::from_secs(parse_or(&lookup, "CHAT_MESSAGE_TTL_SECS", 3600)?),
            delivery_interval: Duration::from_millis(parse_or(
                &lookup,
                "CHAT_DELIVERY_INTERVAL_MS",
                1000,
            )?),
            idle_timeout: parse_opt::<u64>(&lookup, "CHAT_IDLE_TIMEOUT_SECS")?
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            allow_remote_stop: parse_or(&lookup, "CHAT_ALLOW_REMOTE_STOP", true)?,
            seed_messages: parse_or(&lookup, "CHAT_SEED_MESSAGES", defaults.seed_messages)?,
        })
    }
}

fn parse_opt<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, AppError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| AppError::Config(format!("{}='{}': {}", key, raw, e))),
        None => Ok(None),
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AppError>
where
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}
