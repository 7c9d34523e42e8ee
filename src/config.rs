//! Configuration management for Floodgate limiters.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LimiterError, Result};
use crate::ratelimit::quota::{DEFAULT_BUCKET_NUM, DEFAULT_SLACK};
use crate::ratelimit::{Algorithm, Codec, Quota};
use crate::storage::RetryPolicy;

/// Configuration for a single limiter.
///
/// Built once, validated into a [`Quota`], and never mutated by the limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Logical limiter name; also keys distributed state
    pub name: String,

    /// Limiting algorithm
    pub algorithm: Algorithm,

    /// Window unit in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Maximum requests per window unit
    pub max_requests: u64,

    /// Sliding-window buckets (counter only)
    #[serde(default = "default_bucket_num")]
    pub bucket_num: u32,

    /// Burst slack in requests (leaky bucket only)
    #[serde(default = "default_slack")]
    pub slack: u32,

    /// Where limiter state lives
    #[serde(default)]
    pub storage: StorageConfig,

    /// Lock and expiry settings for distributed storage
    #[serde(default)]
    pub distributed: DistributedConfig,

    /// Wire format for persisted state
    #[serde(default)]
    pub codec: Codec,
}

/// Storage backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    /// In-process mutex, no persistence
    #[default]
    Local,
    /// Shared state in a Redis server
    Redis {
        /// `host:port` or `redis://` URL
        address: String,
    },
}

/// Settings for distributed lock and state handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Lock acquisition retry policy
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Expiry of a held lock in milliseconds
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    /// Expiry of persisted state in seconds
    #[serde(default = "default_state_ttl_secs")]
    pub state_ttl_secs: u64,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            lock_ttl_ms: default_lock_ttl_ms(),
            state_ttl_secs: default_state_ttl_secs(),
        }
    }
}

impl DistributedConfig {
    /// Expiry of a held lock.
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    /// Expiry of persisted state.
    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }
}

fn default_window_ms() -> u64 {
    1000
}

fn default_bucket_num() -> u32 {
    DEFAULT_BUCKET_NUM
}

fn default_slack() -> u32 {
    DEFAULT_SLACK
}

fn default_lock_ttl_ms() -> u64 {
    8000
}

fn default_state_ttl_secs() -> u64 {
    180
}

impl LimiterConfig {
    /// Create a configuration with default options.
    pub fn new(name: &str, algorithm: Algorithm, window: Duration, max_requests: u64) -> Self {
        Self {
            name: name.to_string(),
            algorithm,
            window_ms: window.as_millis() as u64,
            max_requests,
            bucket_num: default_bucket_num(),
            slack: default_slack(),
            storage: StorageConfig::default(),
            distributed: DistributedConfig::default(),
            codec: Codec::default(),
        }
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse limiter config: {}", e)))
    }

    /// The window unit.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Check every option and produce the quota the limiter runs with.
    pub fn validate(&self) -> Result<Quota> {
        if self.name.trim().is_empty() {
            return Err(LimiterError::Config("limiter name is required".to_string()));
        }
        if self.window_ms == 0 {
            return Err(LimiterError::Config("window must be positive".to_string()));
        }
        if self.max_requests == 0 {
            return Err(LimiterError::Config(
                "max_requests must be positive".to_string(),
            ));
        }

        match self.algorithm {
            Algorithm::Counter => {
                if self.bucket_num == 0 {
                    return Err(LimiterError::Config(
                        "bucket_num must be positive".to_string(),
                    ));
                }
                if self.window_ms < self.bucket_num as u64 {
                    return Err(LimiterError::Config(format!(
                        "window of {}ms cannot be split into {} buckets",
                        self.window_ms, self.bucket_num
                    )));
                }
            }
            Algorithm::LeakyBucket | Algorithm::TokenBucket => {
                if (self.window_ms as u128) * 1_000_000 < self.max_requests as u128 {
                    return Err(LimiterError::Config(format!(
                        "{} requests per {}ms is finer than one nanosecond per request",
                        self.max_requests, self.window_ms
                    )));
                }
            }
        }

        if let StorageConfig::Redis { address } = &self.storage {
            if address.trim().is_empty() {
                return Err(LimiterError::Config(
                    "redis storage requires an address".to_string(),
                ));
            }
        }
        if self.distributed.lock_ttl_ms == 0 || self.distributed.state_ttl_secs == 0 {
            return Err(LimiterError::Config(
                "distributed lock and state expiry must be positive".to_string(),
            ));
        }

        Ok(Quota::new(
            self.window(),
            self.max_requests,
            self.bucket_num,
            self.slack,
        ))
    }
}
