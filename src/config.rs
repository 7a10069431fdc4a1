use std::{str::FromStr, time::Duration};

use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy)]
pub struct PresenceConfig {
    /// A user is online while their last heartbeat is younger than this.
    pub online_threshold: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            online_threshold: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TypingConfig {
    pub expiry: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self { expiry: Duration::from_secs(3) }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UnreadConfig {
    pub poll_interval: Duration,
}

impl Default for UnreadConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(30) }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Quiet time before collected incoming messages are marked read.
    pub mark_read_batch: Duration,
    pub max_body_chars: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mark_read_batch: Duration::from_millis(250),
            max_body_chars: 4_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app_env: String,
    pub log_level: String,
    pub database_url: String,
    pub bind_addr: String,
    pub presence: PresenceConfig,
    pub typing: TypingConfig,
    pub unread: UnreadConfig,
    pub session: SessionConfig,
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_env: "development".to_owned(),
            log_level: "info".to_owned(),
            database_url: "sqlite://coachline.db?mode=rwc".to_owned(),
            bind_addr: "0.0.0.0:8080".to_owned(),
            presence: PresenceConfig::default(),
            typing: TypingConfig::default(),
            unread: UnreadConfig::default(),
            session: SessionConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// Reads `.env` if present, then the process environment; unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            app_env: var_or("APP_ENV", defaults.app_env),
            log_level: var_or("LOG_LEVEL", defaults.log_level),
            database_url: var_or("DATABASE_URL", defaults.database_url),
            bind_addr: var_or("BIND_ADDR", defaults.bind_addr),
            presence: PresenceConfig {
                online_threshold: millis_or("PRESENCE_THRESHOLD_MS", defaults.presence.online_threshold)?,
                heartbeat_interval: millis_or("HEARTBEAT_INTERVAL_MS", defaults.presence.heartbeat_interval)?,
            },
            typing: TypingConfig {
                expiry: millis_or("TYPING_EXPIRY_MS", defaults.typing.expiry)?,
            },
            unread: UnreadConfig {
                poll_interval: millis_or("UNREAD_POLL_INTERVAL_MS", defaults.unread.poll_interval)?,
            },
            session: SessionConfig {
                mark_read_batch: millis_or("MARK_READ_BATCH_MS", defaults.session.mark_read_batch)?,
                max_body_chars: parsed_or("MAX_BODY_CHARS", defaults.session.max_body_chars)?,
            },
            retry: RetryPolicy {
                max_attempts: parsed_or("RECONNECT_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
                base_delay: millis_or("RETRY_BASE_MS", defaults.retry.base_delay)?,
                max_delay: millis_or("RETRY_MAX_MS", defaults.retry.max_delay)?,
            },
        })
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }
}

fn var_or(name: &'static str, default: String) -> String {
    dotenv::var(name).unwrap_or(default)
}

fn parsed_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match dotenv::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(default),
    }
}

fn millis_or(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let millis = parsed_or(name, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}
