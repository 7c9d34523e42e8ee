//! Locking and persistence for limiter state.
//!
//! Every limiter owns one [`AtomicStorage`] handle. The handle provides the
//! mutual exclusion around the limiter's critical section and, when the state
//! is shared between processes, the place that state is persisted between
//! critical sections.

mod backend;
mod distributed;
mod local;
mod memory;
#[cfg(feature = "redis")]
mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};

use crate::error::Result;

pub use backend::KvBackend;
pub use distributed::{DistributedStorage, RetryPolicy};
pub use local::LocalStorage;
pub use memory::MemoryBackend;
#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;

/// Suffix appended to a limiter name to form its state key.
pub const STATE_KEY_SUFFIX: &str = "_LimiterData";
/// Suffix appended to a limiter name to form its lock key.
pub const LOCK_KEY_SUFFIX: &str = "_LimiterLock";

/// A held storage lock.
///
/// Hand the guard back to [`AtomicStorage::unlock`] to release the lock and
/// learn whether the release succeeded. A guard dropped without that, for
/// example when the future holding it is cancelled, still releases the lock:
/// the local permit is returned and a held backend lock is released from a
/// spawned task.
#[must_use = "dropping the guard releases the lock"]
#[derive(Debug, Default)]
pub struct StorageGuard {
    permit: Option<OwnedSemaphorePermit>,
    remote: Option<RemoteLock>,
}

impl StorageGuard {
    /// A guard that holds nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// A guard holding a semaphore permit until it is dropped.
    pub fn from_permit(permit: OwnedSemaphorePermit) -> Self {
        Self {
            permit: Some(permit),
            remote: None,
        }
    }

    /// Whether this guard holds a local permit.
    pub fn holds_permit(&self) -> bool {
        self.permit.is_some()
    }
}

impl Drop for StorageGuard {
    fn drop(&mut self) {
        let Some(remote) = self.remote.take() else {
            return;
        };
        // The permit is kept until the backend lock is gone, so the next local
        // caller cannot race the release.
        let permit = self.permit.take();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(key = %remote.key, "Releasing abandoned distributed lock");
                handle.spawn(async move {
                    if let Err(e) = remote.release().await {
                        warn!(key = %remote.key, error = %e, "Failed to release abandoned lock");
                    }
                    drop(permit);
                });
            }
            Err(_) => {
                warn!(key = %remote.key, "No runtime to release abandoned lock, leaving it to expire");
            }
        }
    }
}

/// A backend lock held under an owner token.
#[derive(Debug)]
struct RemoteLock {
    backend: Arc<dyn KvBackend>,
    key: String,
    owner: String,
}

impl RemoteLock {
    /// Release the lock. `Ok(false)` means it was no longer ours.
    async fn release(&self) -> Result<bool> {
        self.backend.unlock(&self.key, &self.owner).await
    }
}

/// Lock plus persistence behind one interface.
///
/// Callers hand every guard returned by `lock` back to `unlock`, and only
/// call `store` and `restore` while holding a guard.
#[async_trait]
pub trait AtomicStorage: Send + Sync + std::fmt::Debug {
    /// Acquire the lock guarding the limiter state.
    async fn lock(&self) -> Result<StorageGuard>;

    /// Release the lock held by `guard`. Fails if the guard does not hold
    /// this handle's lock, or the lock was lost while held.
    async fn unlock(&self, guard: StorageGuard) -> Result<()>;

    /// Persist the complete encoded state, replacing any previous value.
    async fn store(&self, data: Vec<u8>) -> Result<()>;

    /// Read the persisted state. `None` means no state has been stored or it expired.
    async fn restore(&self) -> Result<Option<Vec<u8>>>;

    /// Whether `store` and `restore` reach a shared store.
    ///
    /// Limiters skip encoding their state entirely when this is `false`.
    fn is_persistent(&self) -> bool;
}
