//! # Configuration
//!
//! Purpose: Describe the backend target, pool sizing, retry behavior and
//! facade defaults in plain structs that can be built in code or loaded from
//! JSON.
//!
//! ## Design Principles
//! 1. **Fail Fast**: `validate` runs at construction time so invalid values
//!    never surface on first use.
//! 2. **Immutable After Build**: The pool copies its config once and never
//!    mutates it.
//! 3. **Redacted Secrets**: Passwords never appear in `Debug` or `Display`.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Default number of retries after the first failed connect attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default number of keys requested per scan chunk by the bulk delete.
pub const DEFAULT_SCAN_CHUNK_SIZE: u32 = 1000;

/// Backend connection parameters.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct BackendParams {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Optional ACL user name.
    pub username: Option<String>,
    /// Optional password; sent with AUTH after connect.
    pub password: Option<String>,
    /// Logical database selected right after connect.
    pub database: u32,
}

impl BackendParams {
    /// Returns "host:port" for socket connects.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for BackendParams {
    fn default() -> Self {
        BackendParams {
            host: "127.0.0.1".to_string(),
            port: 6379,
            username: None,
            password: None,
            database: 0,
        }
    }
}

impl fmt::Debug for BackendParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .finish()
    }
}

impl fmt::Display for BackendParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.username {
            Some(user) => write!(f, "{}@{}:{}/{}", user, self.host, self.port, self.database),
            None => write!(f, "{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

/// Pool sizing and waiting behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Informational pool name; generated when absent.
    pub name: Option<String>,
    /// Connections opened by `warm_up`.
    pub min_size: usize,
    /// Hard cap on live connections (idle + in use + being created).
    pub max_size: usize,
    /// Number of priority levels; acquire priorities are clamped below it.
    pub priority_range: u8,
    /// Maximum time an acquire may wait in the queue, unbounded when absent.
    pub acquire_timeout_ms: Option<u64>,
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }

    /// Checks sizing invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::invalid("pool.max_size", "must be at least 1"));
        }
        if self.min_size > self.max_size {
            return Err(ConfigError::invalid(
                "pool.min_size",
                format!("{} exceeds max_size {}", self.min_size, self.max_size),
            ));
        }
        if self.priority_range == 0 {
            return Err(ConfigError::invalid("pool.priority_range", "must be at least 1"));
        }
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(ConfigError::invalid("pool.name", "must not be blank"));
            }
        }
        Ok(())
    }

    /// Returns the configured name or a freshly generated unique one.
    pub fn resolved_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("kvpool-{}", uuid::Uuid::new_v4()),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            name: None,
            min_size: 0,
            max_size: 10,
            priority_range: 1,
            acquire_timeout_ms: None,
        }
    }
}

/// Bounded retry policy for connection creation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_backoff_ms: u64,
    /// Upper bound for the retry delay.
    pub max_retry_backoff_ms: u64,
    /// Per-attempt connect timeout.
    pub connect_timeout_ms: Option<u64>,
}

impl RetryPolicy {
    /// Total attempts allowed for one create operation.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        let delay = self.retry_backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_retry_backoff_ms))
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: 100,
            max_retry_backoff_ms: 2_000,
            connect_timeout_ms: Some(5_000),
        }
    }
}

/// Full client configuration: backend, pool, retries and facade defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub backend: BackendParams,
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    /// TTL attached by convenience writes; must be positive when present.
    pub default_ttl_secs: Option<u64>,
    /// Keys requested per scan chunk by the bulk delete.
    pub scan_chunk_size: u32,
}

impl ClientConfig {
    /// Parses and validates a JSON document.
    ///
    /// Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        validate_default_ttl(self.default_ttl_secs)?;
        if self.scan_chunk_size == 0 {
            return Err(ConfigError::invalid("scan_chunk_size", "must be at least 1"));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            backend: BackendParams::default(),
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            default_ttl_secs: None,
            scan_chunk_size: DEFAULT_SCAN_CHUNK_SIZE,
        }
    }
}

/// Accepts an absent TTL or a positive number of seconds.
pub fn validate_default_ttl(ttl: Option<u64>) -> Result<(), ConfigError> {
    match ttl {
        Some(0) => Err(ConfigError::invalid("default_ttl_secs", "must be a positive integer")),
        _ => Ok(()),
    }
}
