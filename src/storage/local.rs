//! In-process storage: a plain mutex and no persistence.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::{AtomicStorage, StorageGuard};
use crate::error::{LimiterError, Result};

/// Storage for limiters whose state lives only in the owning process.
///
/// The lock is a single-permit semaphore whose permit travels inside the
/// returned [`StorageGuard`]. State stays resident in the limiter, so `store`
/// and `restore` do nothing.
#[derive(Debug)]
pub struct LocalStorage {
    permit: Arc<Semaphore>,
}

impl LocalStorage {
    /// Create an unlocked local storage handle.
    pub fn new() -> Self {
        Self {
            permit: Arc::new(Semaphore::new(1)),
        }
    }
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AtomicStorage for LocalStorage {
    async fn lock(&self) -> Result<StorageGuard> {
        let permit = self
            .permit
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| LimiterError::Lock(e.to_string()))?;
        Ok(StorageGuard::from_permit(permit))
    }

    async fn unlock(&self, guard: StorageGuard) -> Result<()> {
        if !guard.holds_permit() {
            return Err(LimiterError::Unlock("local lock is not held".to_string()));
        }
        drop(guard);
        Ok(())
    }

    async fn store(&self, _data: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn restore(&self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn is_persistent(&self) -> bool {
        false
    }
}
