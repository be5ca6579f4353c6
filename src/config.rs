use std::fmt;
use std::time::Duration;

use serenity::model::id::UserId;

use crate::error::ConfigError;

pub const DEFAULT_PREFIX: &str = "!";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Process configuration, read once at startup.
#[derive(Clone)]
pub struct Config {
    pub token: String,
    pub port: u16,
    pub prefix: String,
    pub owner_id: Option<UserId>,
    pub idle_timeout: Duration,
}

impl Config {
    /// Loads `.env` (if there is one) and reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let token = lookup("DISCORD_TOKEN")
            .filter(|token| !token.trim().is_empty())
            .ok_or(ConfigError::Missing("DISCORD_TOKEN"))?;

        let port = match lookup("PORT") {
            Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { key: "PORT", value })?,
            None => DEFAULT_PORT,
        };

        let prefix = lookup("COMMAND_PREFIX")
            .filter(|prefix| !prefix.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PREFIX.to_string());

        let owner_id = match lookup("OWNER_ID") {
            Some(value) if !value.trim().is_empty() => {
                let id: u64 = value.trim().parse().map_err(|_| ConfigError::Invalid { key: "OWNER_ID", value })?;
                Some(UserId(id))
            }
            _ => None,
        };

        let idle_timeout = match lookup("IDLE_TIMEOUT_SECS") {
            Some(value) => {
                let secs: u64 = value.trim().parse().map_err(|_| ConfigError::Invalid { key: "IDLE_TIMEOUT_SECS", value })?;
                Duration::from_secs(secs)
            }
            None => DEFAULT_IDLE_TIMEOUT,
        };

        Ok(Self {
            token,
            port,
            prefix,
            owner_id,
            idle_timeout,
        })
    }
}

// The token never ends up in logs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("token", &"<redacted>")
            .field("port", &self.port)
            .field("prefix", &self.prefix)
            .field("owner_id", &self.owner_id)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}
