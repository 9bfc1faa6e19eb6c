//! Runtime configuration for the loader.
//!
//! Everything is read from the environment exactly once in `main` and then
//! handed to the pipeline by reference. Pipeline code never looks at the
//! environment itself. A `.env` file, when present, is loaded into the
//! environment first; variables already set win.

use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::env;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_INPUT_PATH: &str = "users_data.json";
pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1;
const DEFAULT_DB_PORT: u16 = 5432;
const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("failed to load {}: {reason}", .path.display())]
    EnvFile { path: PathBuf, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Load `KEY=value` pairs from `path` into the process environment.
///
/// Returns `Ok(false)` when the file does not exist. Variables that are
/// already set are left alone.
pub fn load_env_file(path: &Path) -> Result<bool, ConfigError> {
    match dotenvy::from_path(path) {
        Ok(()) => Ok(true),
        Err(err) if err.not_found() => Ok(false),
        Err(err) => Err(ConfigError::EnvFile {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }),
    }
}

fn env_string(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key).unwrap_or_else(|| default.to_string())
}

fn env_required(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<String, ConfigError> {
    lookup(key).ok_or(ConfigError::Missing(key))
}

fn env_parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|err| ConfigError::invalid(key, &value, err.to_string())),
        None => Ok(default),
    }
}

fn env_non_zero(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: usize,
) -> Result<NonZeroUsize, ConfigError> {
    let value = env_parse::<usize>(lookup, key, default)?;
    NonZeroUsize::new(value)
        .ok_or_else(|| ConfigError::invalid(key, &value.to_string(), "must be greater than zero"))
}

/// What to do with a user whose address insert fails part-way through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddressFailurePolicy {
    /// Discard the user and every address already staged for it.
    #[default]
    Rollback,
    /// Keep the user and the addresses inserted before the failing one.
    CommitPartial,
}

impl FromStr for AddressFailurePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "rollback" => Ok(AddressFailurePolicy::Rollback),
            "commit_partial" | "commit-partial" => Ok(AddressFailurePolicy::CommitPartial),
            other => Err(format!(
                "unknown policy '{other}', expected 'rollback' or 'commit_partial'"
            )),
        }
    }
}

/// Settings for the ingestion pipeline itself.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub input_path: PathBuf,
    pub workers: NonZeroUsize,
    pub queue_capacity: NonZeroUsize,
    pub address_failure_policy: AddressFailurePolicy,
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            input_path: PathBuf::from(env_string(&lookup, "INGEST_INPUT_PATH", DEFAULT_INPUT_PATH)),
            workers: env_non_zero(&lookup, "INGEST_WORKERS", DEFAULT_WORKERS)?,
            queue_capacity: env_non_zero(&lookup, "INGEST_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?,
            address_failure_policy: env_parse(
                &lookup,
                "INGEST_ADDRESS_FAILURE_POLICY",
                AddressFailurePolicy::default(),
            )?,
        })
    }

    /// Same settings with a different worker count.
    pub fn with_workers(mut self, workers: NonZeroUsize) -> Self {
        self.workers = workers;
        self
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            input_path: PathBuf::from(DEFAULT_INPUT_PATH),
            workers: NonZeroUsize::new(DEFAULT_WORKERS).unwrap_or(NonZeroUsize::MIN),
            queue_capacity: NonZeroUsize::MIN,
            address_failure_policy: AddressFailurePolicy::default(),
        }
    }
}

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
    Url(String),
    Parts {
        host: String,
        user: String,
        password: String,
        database: String,
        port: u16,
        ssl_mode: String,
    },
}

/// Connection settings for the PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub target: DatabaseTarget,
    /// Defaults to the worker count when unset.
    pub max_connections: Option<u32>,
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// `DATABASE_URL` wins when present; otherwise the individual `DB_*`
    /// variables are required.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let target = match lookup("DATABASE_URL") {
            Some(url) => DatabaseTarget::Url(url),
            None => DatabaseTarget::Parts {
                host: env_required(&lookup, "DB_HOST")?,
                user: env_required(&lookup, "DB_USER")?,
                password: env_required(&lookup, "DB_PASSWORD")?,
                database: env_required(&lookup, "DB_NAME")?,
                port: env_parse(&lookup, "DB_PORT", DEFAULT_DB_PORT)?,
                ssl_mode: env_string(&lookup, "DB_SSLMODE", "disable"),
            },
        };

        let max_connections = env_parse::<u32>(&lookup, "DB_MAX_CONNECTIONS", 0)
            .map(|max| (max > 0).then_some(max))?;

        Ok(Self {
            target,
            max_connections,
            acquire_timeout: Duration::from_millis(env_parse(
                &lookup,
                "DB_ACQUIRE_TIMEOUT_MS",
                DEFAULT_ACQUIRE_TIMEOUT_MS,
            )?),
        })
    }

    pub fn connect_options(&self) -> Result<PgConnectOptions, ConfigError> {
        match &self.target {
            DatabaseTarget::Url(url) => url
                .parse::<PgConnectOptions>()
                .map_err(|err| ConfigError::invalid("DATABASE_URL", "<redacted>", err.to_string())),
            DatabaseTarget::Parts {
                host,
                user,
                password,
                database,
                port,
                ssl_mode,
            } => {
                let ssl_mode = ssl_mode
                    .parse::<PgSslMode>()
                    .map_err(|err| ConfigError::invalid("DB_SSLMODE", ssl_mode, err.to_string()))?;

                Ok(PgConnectOptions::new()
                    .host(host)
                    .port(*port)
                    .username(user)
                    .password(password)
                    .database(database)
                    .ssl_mode(ssl_mode))
            }
        }
    }
}
