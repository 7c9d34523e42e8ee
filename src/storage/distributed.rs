//! Distributed storage: an external named lock plus an external key-value store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{
    AtomicStorage, KvBackend, LocalStorage, RemoteLock, StorageGuard, LOCK_KEY_SUFFIX,
    STATE_KEY_SUFFIX,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{LimiterError, Result};

/// Default expiry for persisted limiter state.
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(180);
/// Default expiry for a held distributed lock.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(8);

/// Bounded retry policy for distributed lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Fixed delay between attempts, in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl RetryPolicy {
    /// Create a policy with the given retry count and fixed backoff.
    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self {
            retries,
            backoff_ms: backoff.as_millis() as u64,
        }
    }

    /// The delay between attempts.
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

/// Storage whose lock and state live in a [`KvBackend`] shared by a fleet.
///
/// The lock key and the state key are both derived from the limiter name, so
/// limiters with different names never serialize against each other. Callers
/// inside one process queue on a local lock first and only the winner talks
/// to the backend lock.
#[derive(Debug)]
pub struct DistributedStorage {
    backend: Arc<dyn KvBackend>,
    lock_key: String,
    state_key: String,
    /// Identifies this handle as the lock owner
    owner: String,
    local: LocalStorage,
    retry: RetryPolicy,
    lock_ttl: Duration,
    state_ttl: Duration,
    /// Sleeps the retry backoff
    clock: Arc<dyn Clock>,
}

impl DistributedStorage {
    /// Create a handle for the limiter called `name` with default policies.
    pub fn new(backend: Arc<dyn KvBackend>, name: &str) -> Self {
        Self {
            backend,
            lock_key: format!("{}{}", name, LOCK_KEY_SUFFIX),
            state_key: format!("{}{}", name, STATE_KEY_SUFFIX),
            owner: uuid::Uuid::new_v4().to_string(),
            local: LocalStorage::new(),
            retry: RetryPolicy::default(),
            lock_ttl: DEFAULT_LOCK_TTL,
            state_ttl: DEFAULT_STATE_TTL,
            clock: Arc::new(SystemClock),
        }
    }

    /// Override the clock that sleeps the retry backoff.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the lock retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the expiry of a held lock.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Override the expiry of persisted state.
    pub fn with_state_ttl(mut self, ttl: Duration) -> Self {
        self.state_ttl = ttl;
        self
    }

    /// The key the limiter state is stored under.
    pub fn state_key(&self) -> &str {
        &self.state_key
    }

    /// The key of the lock guarding the state.
    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Take the backend lock, retrying per the policy.
    async fn acquire_remote(&self) -> Result<()> {
        let mut attempt = 0;
        loop {
            let failure = match self
                .backend
                .try_lock(&self.lock_key, &self.owner, self.lock_ttl)
                .await
            {
                Ok(true) => {
                    trace!(key = %self.lock_key, attempt = attempt, "Acquired distributed lock");
                    return Ok(());
                }
                Ok(false) => "lock is held by another owner".to_string(),
                Err(e) => e.to_string(),
            };

            if attempt >= self.retry.retries {
                return Err(LimiterError::Lock(format!(
                    "failed to acquire {} after {} attempts: {}",
                    self.lock_key,
                    attempt + 1,
                    failure
                )));
            }
            attempt += 1;

            warn!(
                key = %self.lock_key,
                attempt = attempt,
                reason = %failure,
                "Distributed lock unavailable, retrying"
            );
            self.clock.sleep(self.retry.backoff()).await;
        }
    }
}

#[async_trait]
impl AtomicStorage for DistributedStorage {
    async fn lock(&self) -> Result<StorageGuard> {
        // Dropping the local guard on any failure or cancellation below
        // returns the permit.
        let mut guard = self.local.lock().await?;
        self.acquire_remote().await?;
        guard.remote = Some(RemoteLock {
            backend: self.backend.clone(),
            key: self.lock_key.clone(),
            owner: self.owner.clone(),
        });
        Ok(guard)
    }

    async fn unlock(&self, mut guard: StorageGuard) -> Result<()> {
        let released = match &guard.remote {
            Some(remote) if remote.key == self.lock_key => remote.release().await,
            _ => {
                return Err(LimiterError::Unlock(format!(
                    "{} is not held by this guard",
                    self.lock_key
                )))
            }
        };
        guard.remote = None;
        drop(guard);

        match released {
            Ok(true) => Ok(()),
            // The lock expired while we held it and may now belong to someone else.
            Ok(false) => Err(LimiterError::Unlock(format!(
                "{} is not held by this limiter",
                self.lock_key
            ))),
            Err(e) => Err(LimiterError::Unlock(e.to_string())),
        }
    }

    async fn store(&self, data: Vec<u8>) -> Result<()> {
        debug!(key = %self.state_key, bytes = data.len(), "Persisting limiter state");
        self.backend
            .set_with_expiry(&self.state_key, data, self.state_ttl)
            .await
    }

    async fn restore(&self) -> Result<Option<Vec<u8>>> {
        let data = self.backend.get(&self.state_key).await?;
        trace!(key = %self.state_key, found = data.is_some(), "Restored limiter state");
        Ok(data)
    }

    fn is_persistent(&self) -> bool {
        true
    }
}
