//! Configuration
//!
//! `Config::default()` is the single source of default values. User input
//! is merged against it with [`Config::merged_with_defaults`]: zero numeric
//! fields fall back to the default, booleans and enums are taken as given,
//! and [`Config::validate`] rejects anything left invalid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::AuthMethod;
use crate::client::{OverwritePolicy, ProgressSink};
use crate::error::Error;
use crate::retry::{BackoffStrategy, RetryConfig};
use crate::transport::HostKeyPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub transfer: TransferConfig,
}

/// Remote endpoint and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub method: AuthMethod,

    #[serde(default)]
    pub host_key: HostKeyPolicy,
}

/// Pool sizing, timeouts and retry policies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// TCP connect + SSH handshake timeout in milliseconds
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Upper bound on concurrently open sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Free sessions idle longer than this are evicted (milliseconds)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Retry policy for creating one session
    #[serde(default)]
    pub retry: RetryConfig,

    /// Retry policy for waiting on a full pool
    #[serde(default = "default_acquire_retry")]
    pub acquire_retry: RetryConfig,
}

/// Transfer defaults, overridable per call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Copy buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Create missing parent directories of the destination
    #[serde(default = "default_true")]
    pub create_dirs: bool,

    /// Copy permission bits from source to destination
    #[serde(default)]
    pub preserve_permissions: bool,

    #[serde(default)]
    pub overwrite: OverwritePolicy,

    #[serde(skip)]
    pub progress: Option<ProgressSink>,
}

fn default_port() -> u16 {
    22
}

fn default_dial_timeout_ms() -> u64 {
    10_000
}

fn default_max_connections() -> usize {
    5
}

fn default_idle_timeout_ms() -> u64 {
    5 * 60 * 1000
}

fn default_acquire_retry() -> RetryConfig {
    RetryConfig::new(
        50,
        BackoffStrategy::jitter(Duration::from_millis(100), Duration::from_millis(100)),
    )
}

fn default_buffer_size() -> usize {
    32 * 1024
}

fn default_true() -> bool {
    true
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            method: AuthMethod::default(),
            host_key: HostKeyPolicy::default(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_dial_timeout_ms(),
            max_connections: default_max_connections(),
            idle_timeout_ms: default_idle_timeout_ms(),
            retry: RetryConfig::default(),
            acquire_retry: default_acquire_retry(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            create_dirs: default_true(),
            preserve_permissions: false,
            overwrite: OverwritePolicy::default(),
            progress: None,
        }
    }
}

impl AuthConfig {
    pub fn merged_with_defaults(self) -> Self {
        let defaults = Self::default();
        Self {
            port: if self.port == 0 { defaults.port } else { self.port },
            ..self
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn merge_retry(user: RetryConfig, defaults: RetryConfig) -> RetryConfig {
    RetryConfig {
        max_attempts: if user.max_attempts == 0 {
            defaults.max_attempts
        } else {
            user.max_attempts
        },
        backoff: user.backoff,
    }
}

impl ConnectionConfig {
    pub fn merged_with_defaults(self) -> Self {
        let defaults = Self::default();
        Self {
            dial_timeout_ms: nonzero_or(self.dial_timeout_ms, defaults.dial_timeout_ms),
            max_connections: nonzero_or(self.max_connections, defaults.max_connections),
            idle_timeout_ms: nonzero_or(self.idle_timeout_ms, defaults.idle_timeout_ms),
            retry: merge_retry(self.retry, defaults.retry),
            acquire_retry: merge_retry(self.acquire_retry, defaults.acquire_retry),
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl TransferConfig {
    pub fn merged_with_defaults(self) -> Self {
        let defaults = Self::default();
        Self {
            buffer_size: nonzero_or(self.buffer_size, defaults.buffer_size),
            ..self
        }
    }
}

fn nonzero_or<T: Default + PartialEq>(value: T, fallback: T) -> T {
    if value == T::default() {
        fallback
    } else {
        value
    }
}

impl Config {
    pub fn merged_with_defaults(self) -> Self {
        Self {
            auth: self.auth.merged_with_defaults(),
            connection: self.connection.merged_with_defaults(),
            transfer: self.transfer.merged_with_defaults(),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.auth.host.trim().is_empty() {
            return Err(Error::config("host is required"));
        }
        if self.auth.username.trim().is_empty() {
            return Err(Error::config("username is required"));
        }
        if self.auth.port == 0 {
            return Err(Error::config("port must be non-zero"));
        }
        if self.connection.max_connections == 0 {
            return Err(Error::config("max_connections must be at least 1"));
        }
        if self.transfer.buffer_size == 0 {
            return Err(Error::config("buffer_size must be positive"));
        }

        self.connection
            .retry
            .validate()
            .map_err(|e| Error::config(format!("connection.retry: {}", strip_prefix(e))))?;
        self.connection
            .acquire_retry
            .validate()
            .map_err(|e| Error::config(format!("connection.acquire_retry: {}", strip_prefix(e))))?;

        Ok(())
    }

    /// Parse, merge with defaults and validate.
    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("invalid JSON configuration: {}", e)))?;
        let config = config.merged_with_defaults();
        config.validate()?;
        Ok(config)
    }

    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        debug!("Loading configuration from {:?}", path);

        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&contents)
    }
}

fn strip_prefix(err: Error) -> String {
    match err {
        Error::Config(msg) => msg,
        other => other.to_string(),
    }
}
