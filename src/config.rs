//! Configuration management for Slomo.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SlomoError};
use crate::ratelimit::{WindowPolicy, DEFAULT_CAPACITY, DEFAULT_WINDOW};

/// Prefix for environment variable overrides, e.g. `SLOMO__LIMITER__CAPACITY=50`.
const ENV_PREFIX: &str = "SLOMO";

/// Main configuration for the Slomo service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlomoConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission limits
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Request log store
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// What the gate does when it cannot consult the request log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Answer with a server error; nothing reaches the wrapped handler
    #[default]
    FailClosed,
    /// Let the request through unlimited when the store is unreachable,
    /// times out or stays contended. A corrupt log is still a server error.
    FailOpen,
}

/// Admission limits and request log handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Length of the trailing window in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Requests admitted per window
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Store key holding the request log
    #[serde(default = "default_log_key")]
    pub log_key: String,

    /// How many times a lost compare-and-swap is retried
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,

    /// Upper bound of the jittered pause between retries, in milliseconds
    #[serde(default = "default_conflict_backoff_ms")]
    pub conflict_backoff_ms: u64,

    /// Behaviour when the store is unreachable, times out or stays contended
    #[serde(default)]
    pub on_store_failure: FailurePolicy,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            capacity: default_capacity(),
            log_key: default_log_key(),
            max_conflict_retries: default_max_conflict_retries(),
            conflict_backoff_ms: default_conflict_backoff_ms(),
            on_store_failure: FailurePolicy::default(),
        }
    }
}

impl LimiterConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn conflict_backoff(&self) -> Duration {
        Duration::from_millis(self.conflict_backoff_ms)
    }

    /// The window policy described by this configuration.
    pub fn policy(&self) -> WindowPolicy {
        WindowPolicy::new(self.window(), self.capacity)
    }
}

fn default_window_secs() -> u64 {
    DEFAULT_WINDOW.as_secs()
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_log_key() -> String {
    "requests".to_string()
}

fn default_max_conflict_retries() -> u32 {
    16
}

fn default_conflict_backoff_ms() -> u64 {
    5
}

/// Which backend holds the request log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local; only suitable for a single instance
    #[default]
    Memory,
    /// Shared Redis server
    Redis,
}

/// Request log store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL, required for the Redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Deadline for each store operation in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_store_timeout_ms() -> u64 {
    1000
}

impl SlomoConfig {
    /// Load configuration from a file path, with environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(Some(path.as_ref()), ENV_PREFIX)
    }

    /// Load configuration from defaults and environment overrides only.
    pub fn from_env() -> Result<Self> {
        Self::load(None, ENV_PREFIX)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SlomoConfig = serde_yaml::from_str(yaml)
            .map_err(|e| SlomoError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn load(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }

        let config: SlomoConfig = builder
            .add_source(
                ::config::Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| SlomoError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the gate cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.window_secs == 0 {
            return Err(SlomoError::Config("limiter.window_secs must be positive".to_string()));
        }
        if self.limiter.log_key.is_empty() {
            return Err(SlomoError::Config("limiter.log_key must not be empty".to_string()));
        }
        if self.store.timeout_ms == 0 {
            return Err(SlomoError::Config("store.timeout_ms must be positive".to_string()));
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(SlomoError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }
        Ok(())
    }
}
