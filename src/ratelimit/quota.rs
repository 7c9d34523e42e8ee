//! Quota, algorithm selection and per-request decisions.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LimiterError;

/// Default number of buckets in a sliding window.
pub const DEFAULT_BUCKET_NUM: u32 = 10;
/// Default leaky-bucket slack, in requests.
pub const DEFAULT_SLACK: u32 = 5;

/// The limiting algorithm a limiter runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Sliding-window counter
    Counter,
    /// Leaky bucket with bounded slack
    LeakyBucket,
    /// Token bucket refilled at a fixed rate
    TokenBucket,
}

impl Algorithm {
    /// The configuration name of this algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Counter => "counter",
            Algorithm::LeakyBucket => "leaky_bucket",
            Algorithm::TokenBucket => "token_bucket",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "counter" | "sliding_window" => Ok(Algorithm::Counter),
            "leaky" | "leaky_bucket" => Ok(Algorithm::LeakyBucket),
            "token" | "token_bucket" => Ok(Algorithm::TokenBucket),
            other => Err(LimiterError::Config(format!("unknown algorithm '{}'", other))),
        }
    }
}

/// An immutable quota: at most `max_requests` per `unit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    unit: Duration,
    max_requests: u64,
    bucket_num: u32,
    slack: u32,
}

impl Quota {
    /// Create a quota. Validation happens in the limiter configuration.
    pub(crate) fn new(unit: Duration, max_requests: u64, bucket_num: u32, slack: u32) -> Self {
        Self {
            unit,
            max_requests,
            bucket_num,
            slack,
        }
    }

    /// The span the quota applies over.
    pub fn unit(&self) -> Duration {
        self.unit
    }

    /// The ceiling of requests per unit.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Number of sliding-window buckets.
    pub fn bucket_num(&self) -> u32 {
        self.bucket_num
    }

    /// Leaky-bucket slack, in requests.
    pub fn slack(&self) -> u32 {
        self.slack
    }

    /// The unit in nanoseconds.
    pub(crate) fn unit_nanos(&self) -> i64 {
        i64::try_from(self.unit.as_nanos()).unwrap_or(i64::MAX)
    }

    /// Spacing between requests at the full rate, in nanoseconds.
    pub(crate) fn interval_nanos(&self) -> i64 {
        self.unit_nanos() / self.max_requests.max(1) as i64
    }
}

/// The outcome of an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed now
    pub allowed: bool,
    /// How long a denied caller should wait before retrying; zero when allowed
    pub wait: Duration,
}

impl Decision {
    /// An admitted request.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            wait: Duration::ZERO,
        }
    }

    /// A denied request that should retry after `wait`.
    pub fn deny(wait: Duration) -> Self {
        Self {
            allowed: false,
            wait,
        }
    }
}
