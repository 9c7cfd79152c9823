use std::collections::HashMap;
use std::env;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Shortest accepted HMAC secret for bearer tokens
const MIN_JWT_SECRET_LEN: usize = 32;

/// Value of `FUNDSYNC_DATABASE_PATH` that selects a throwaway in-memory store
pub const IN_MEMORY_DATABASE: &str = ":memory:";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: String,
    pub jwt_secret: String,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: String,
    pub auth_clock_skew: Duration,
    pub rate_limit_window: Duration,
    pub sync_push_rate_limit_per_window: u32,
    pub sync_pull_rate_limit_per_window: u32,
    pub max_batch_size: usize,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_path", &self.database_path)
            .field("jwt_secret", &"[REDACTED]")
            .field("jwt_issuer", &self.jwt_issuer)
            .field("jwt_audience", &self.jwt_audience)
            .field("auth_clock_skew", &self.auth_clock_skew)
            .field("rate_limit_window", &self.rate_limit_window)
            .field(
                "sync_push_rate_limit_per_window",
                &self.sync_push_rate_limit_per_window,
            )
            .field(
                "sync_pull_rate_limit_per_window",
                &self.sync_pull_rate_limit_per_window,
            )
            .field("max_batch_size", &self.max_batch_size)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "FUNDSYNC_BIND_ADDR", "127.0.0.1:8080");
        let database_path = required_trimmed(&lookup, "FUNDSYNC_DATABASE_PATH")?;

        let jwt_secret = required_trimmed(&lookup, "FUNDSYNC_JWT_SECRET")?;
        if jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::Invalid(format!(
                "FUNDSYNC_JWT_SECRET must be at least {MIN_JWT_SECRET_LEN} bytes"
            )));
        }
        let jwt_issuer = optional_trimmed(&lookup, "FUNDSYNC_JWT_ISSUER");
        let jwt_audience = value_or_default(&lookup, "FUNDSYNC_JWT_AUDIENCE", "authenticated");

        let auth_clock_skew_secs: u64 =
            bounded(&lookup, "AUTH_CLOCK_SKEW_SECS", "60", 0..=300)?;
        let rate_limit_window_secs: u64 =
            bounded(&lookup, "RATE_LIMIT_WINDOW_SECS", "60", 10..=3_600)?;
        let sync_push_rate_limit_per_window =
            bounded(&lookup, "SYNC_PUSH_RATE_LIMIT_PER_WINDOW", "30", 1..=1_000)?;
        let sync_pull_rate_limit_per_window =
            bounded(&lookup, "SYNC_PULL_RATE_LIMIT_PER_WINDOW", "120", 1..=5_000)?;
        let max_batch_size = bounded(&lookup, "SYNC_MAX_BATCH_SIZE", "500", 1..=5_000)?;

        Ok(Self {
            bind_addr,
            database_path,
            jwt_secret,
            jwt_issuer,
            jwt_audience,
            auth_clock_skew: Duration::from_secs(auth_clock_skew_secs),
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            sync_push_rate_limit_per_window,
            sync_pull_rate_limit_per_window,
            max_batch_size,
        })
    }

    pub fn uses_in_memory_database(&self) -> bool {
        self.database_path == IN_MEMORY_DATABASE
    }
}

/// Parse an integer variable and check it against `range`.
fn bounded<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: &str,
    range: RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + fmt::Display,
{
    let describe = || {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    };
    let value = value_or_default(lookup, name, default)
        .parse::<T>()
        .map_err(|_| describe())?;
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(describe())
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
