//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on malformed values. The database URL
//! is wrapped in `secrecy::SecretString` to keep it out of logs.

use crate::destination::DEFAULT_QUEUE_PREFIX;
use crate::error::{Error, Result};
use secrecy::SecretString;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which broker backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// In-process broker. Messages do not outlive the process.
    Memory,
    /// Postgres with the pgmq extension.
    Pgmq,
}

impl FromStr for DriverKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(DriverKind::Memory),
            "pgmq" => Ok(DriverKind::Pgmq),
            other => Err(Error::Config(format!(
                "unknown QUEUE_DRIVER {other:?} (expected \"memory\" or \"pgmq\")"
            ))),
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub driver: DriverKind,
    pub database_url: Option<SecretString>,
    pub topics_file: PathBuf,
    pub queue_prefix: String,
    pub max_attempts: u32,
    pub receive_timeout: Duration,
    pub shutdown_grace: Duration,
    /// pgmq visibility timeout, in seconds.
    pub visibility_timeout: i32,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let driver = match lookup("QUEUE_DRIVER") {
            Some(value) => value.parse()?,
            None => DriverKind::Memory,
        };
        let database_url = lookup("DATABASE_URL").map(SecretString::from);
        if driver == DriverKind::Pgmq && database_url.is_none() {
            return Err(Error::Config(
                "required environment variable DATABASE_URL is not set".to_string(),
            ));
        }

        let max_attempts: u32 = parsed(&lookup, "MAX_ATTEMPTS", 5)?;
        if max_attempts == 0 {
            return Err(Error::Config("MAX_ATTEMPTS must be at least 1".to_string()));
        }

        Ok(Self {
            driver,
            database_url,
            topics_file: lookup("TOPICS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("topics.toml")),
            queue_prefix: lookup("QUEUE_PREFIX").unwrap_or_else(|| DEFAULT_QUEUE_PREFIX.to_string()),
            max_attempts,
            receive_timeout: Duration::from_millis(parsed(&lookup, "RECEIVE_TIMEOUT_MS", 1000)?),
            shutdown_grace: Duration::from_millis(parsed(&lookup, "SHUTDOWN_GRACE_MS", 10_000)?),
            visibility_timeout: parsed(&lookup, "VISIBILITY_TIMEOUT_SECS", 30)?,
            otel_endpoint: lookup("OTEL_ENDPOINT"),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn parsed<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {name} {raw:?}: {e}"))),
        None => Ok(default),
    }
}
