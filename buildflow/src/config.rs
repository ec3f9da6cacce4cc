//! Engine configuration.
//!
//! Every field has a serde default so partial JSON documents load, and
//! `BUILDFLOW_*` environment variables override individual values.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::EngineError;
use crate::worker::RetryConfig;

/// Build lock acquisition settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Longest a handler waits for the build lock.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Lease length; a crashed holder's lock expires after this.
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    /// First backoff step between acquisition attempts.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Backoff cap between acquisition attempts.
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

fn default_max_wait_ms() -> u64 {
    5_000
}

fn default_lease_ttl_ms() -> u64 {
    30_000
}

fn default_retry_base_ms() -> u64 {
    50
}

fn default_retry_max_ms() -> u64 {
    500
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: default_max_wait_ms(),
            lease_ttl_ms: default_lease_ttl_ms(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

impl LockConfig {
    /// Sets the maximum wait.
    #[must_use]
    pub fn with_max_wait_ms(mut self, ms: u64) -> Self {
        self.max_wait_ms = ms;
        self
    }

    /// Sets the lease TTL.
    #[must_use]
    pub fn with_lease_ttl_ms(mut self, ms: u64) -> Self {
        self.lease_ttl_ms = ms;
        self
    }

    /// Maximum wait as a duration.
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Lease TTL as a duration.
    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }
}

/// Mutex group defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutexConfig {
    /// Queue timeout used when a group declares none.
    #[serde(default = "default_mutex_timeout_minutes")]
    pub default_timeout_minutes: u32,
    /// How often a blocked waiter re-checks the queue head, as a backstop to notification.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_mutex_timeout_minutes() -> u32 {
    900
}

fn default_poll_interval_ms() -> u64 {
    200
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            default_timeout_minutes: default_mutex_timeout_minutes(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Handler loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Capacity of the in-process event channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Handlers slower than this log at warn level.
    #[serde(default = "default_slow_handler_ms")]
    pub slow_handler_ms: u64,
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_slow_handler_ms() -> u64 {
    1_000
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            slow_handler_ms: default_slow_handler_ms(),
        }
    }
}

/// Worker client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Retry policy for engine calls.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Pause between claims while the engine answers `Wait`.
    #[serde(default = "default_claim_poll_ms")]
    pub claim_poll_ms: u64,
}

fn default_claim_poll_ms() -> u64 {
    500
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            claim_poll_ms: default_claim_poll_ms(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Build lock.
    #[serde(default)]
    pub lock: LockConfig,
    /// Mutex groups.
    #[serde(default)]
    pub mutex: MutexConfig,
    /// Event handlers.
    #[serde(default)]
    pub handler: HandlerConfig,
    /// Worker client.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Logging.
    #[serde(default)]
    pub logging: LogConfig,
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lock configuration.
    #[must_use]
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Sets the worker retry policy.
    #[must_use]
    pub fn with_worker_retry(mut self, retry: RetryConfig) -> Self {
        self.worker.retry = retry;
        self
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads defaults overridden by `BUILDFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, EngineError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies overrides from `lookup`, then validates.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BUILDFLOW_LOCK_MAX_WAIT_MS") {
            self.lock.max_wait_ms = parse_var("BUILDFLOW_LOCK_MAX_WAIT_MS", &v)?;
        }
        if let Some(v) = lookup("BUILDFLOW_LOCK_LEASE_TTL_MS") {
            self.lock.lease_ttl_ms = parse_var("BUILDFLOW_LOCK_LEASE_TTL_MS", &v)?;
        }
        if let Some(v) = lookup("BUILDFLOW_MUTEX_DEFAULT_TIMEOUT_MINUTES") {
            self.mutex.default_timeout_minutes =
                parse_var("BUILDFLOW_MUTEX_DEFAULT_TIMEOUT_MINUTES", &v)?;
        }
        if let Some(v) = lookup("BUILDFLOW_WORKER_MAX_ATTEMPTS") {
            self.worker.retry.max_attempts = parse_var("BUILDFLOW_WORKER_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("BUILDFLOW_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("BUILDFLOW_LOG_JSON") {
            self.logging.json = parse_var("BUILDFLOW_LOG_JSON", &v)?;
        }
        self.validate()
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.lock.lease_ttl_ms == 0 {
            return Err(EngineError::Config("lock.lease_ttl_ms must be positive".to_string()));
        }
        if self.lock.retry_base_ms > self.lock.retry_max_ms {
            return Err(EngineError::Config(
                "lock.retry_base_ms must not exceed lock.retry_max_ms".to_string(),
            ));
        }
        if self.handler.channel_capacity == 0 {
            return Err(EngineError::Config(
                "handler.channel_capacity must be positive".to_string(),
            ));
        }
        if self.worker.retry.max_attempts == 0 {
            return Err(EngineError::Config(
                "worker.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, EngineError> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::Config(format!("invalid value for {key}: {value:?}")))
}
