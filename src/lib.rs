//! Floodgate - Rate Limiting Primitives
//!
//! This crate implements three rate limiting algorithms (sliding-window
//! counter, leaky bucket and token bucket) over a storage abstraction that
//! runs each of them either against an in-process lock or against a
//! distributed lock with state persisted in a shared key-value store.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DistributedConfig, LimiterConfig, StorageConfig};
pub use error::{LimiterError, Result};
pub use ratelimit::{Algorithm, Codec, Decision, Quota, RateLimiter, RateLimiterBuilder};
