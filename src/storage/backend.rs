//! Key-value and lock service trait for distributed limiter state.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// The external service shared by every process taking part in a limit.
///
/// This abstracts over the concrete store (an in-process map for tests and
/// embedding, Redis for a real fleet) so `DistributedStorage` can work with
/// either. Implementations report transport failures as
/// [`LimiterError::Persist`](crate::error::LimiterError::Persist).
#[async_trait]
pub trait KvBackend: Send + Sync + std::fmt::Debug {
    /// Try once to take the named lock for `owner`, expiring after `ttl`.
    ///
    /// Returns `Ok(false)` when another owner holds the lock.
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Release the named lock if it is held by `owner`.
    ///
    /// Returns `Ok(false)` when the lock was not held by `owner`.
    async fn unlock(&self, key: &str, owner: &str) -> Result<bool>;

    /// Read a value. Missing and expired keys read as `None`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a value, replacing any previous one, expiring after `ttl`.
    async fn set_with_expiry(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
}
