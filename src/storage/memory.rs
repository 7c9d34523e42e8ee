//! In-process key-value backend with expiring entries.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::KvBackend;
use crate::error::Result;

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// A [`KvBackend`] kept in process memory.
///
/// Several limiters sharing one `Arc<MemoryBackend>` behave like processes
/// sharing a remote store: they coordinate only through its locks and keys.
/// Expired entries are dropped lazily when touched.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    values: DashMap<String, Expiring<Vec<u8>>>,
    locks: DashMap<String, Expiring<String>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live values currently stored.
    pub fn len(&self) -> usize {
        self.values.iter().filter(|e| e.is_live()).count()
    }

    /// Whether no live values are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a value regardless of its expiry.
    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.values.remove(key).map(|(_, v)| v.value)
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().is_live() {
                    trace!(key = %key, holder = %held.get().value, "Lock busy");
                    return Ok(false);
                }
                held.insert(Expiring::new(owner.to_string(), ttl));
                Ok(true)
            }
            Entry::Vacant(slot) => {
                slot.insert(Expiring::new(owner.to_string(), ttl));
                Ok(true)
            }
        }
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<bool> {
        let removed = self
            .locks
            .remove_if(key, |_, held| held.value == owner && held.is_live());
        Ok(removed.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.values.get(key) {
            if entry.is_live() {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.values.remove_if(key, |_, v| !v.is_live());
        Ok(None)
    }

    async fn set_with_expiry(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.values.insert(key.to_string(), Expiring::new(value, ttl));
        Ok(())
    }
}
