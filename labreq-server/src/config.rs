use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

#[derive(Clone)]
pub struct Config {
    pub telegram_bot_token: String,
    /// Group chat the /register command is restricted to. When unset,
    /// registration is accepted from any group chat.
    pub telegram_group_id: Option<i64>,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// Delivery attempt ceiling for the notification relay (first try
    /// included).
    pub delivery_max_attempts: u32,
    /// Long-poll timeout for the bot dispatcher, in seconds.
    pub bot_poll_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let telegram_bot_token = env::var("TELEGRAM_BOT_TOKEN")
            .context("TELEGRAM_BOT_TOKEN environment variable is required")?;

        let telegram_group_id = parse_optional_group_id(env::var("TELEGRAM_GROUP_ID").ok())
            .context("TELEGRAM_GROUP_ID must be a valid chat id")?;

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let delivery_max_attempts = env::var("DELIVERY_MAX_ATTEMPTS")
            .unwrap_or_else(|_| "3".to_string())
            .parse::<u32>()
            .context("DELIVERY_MAX_ATTEMPTS must be a valid number")?;

        let bot_poll_timeout_secs = env::var("BOT_POLL_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse::<u64>()
            .context("BOT_POLL_TIMEOUT_SECS must be a valid number")?;

        Ok(Config {
            telegram_bot_token,
            telegram_group_id,
            port,
            state_dir,
            delivery_max_attempts,
            bot_poll_timeout_secs,
        })
    }
}

/// Parse TELEGRAM_GROUP_ID from an optional string value.
///
/// Missing, empty, or whitespace-only values mean "no group restriction".
/// A present but non-numeric value is a configuration error, not a silent
/// default.
pub fn parse_optional_group_id(value: Option<String>) -> Result<Option<i64>> {
    match value {
        None => Ok(None),
        Some(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let id = trimmed
                .parse::<i64>()
                .with_context(|| format!("not a valid chat id: {:?}", raw))?;
            Ok(Some(id))
        }
    }
}
