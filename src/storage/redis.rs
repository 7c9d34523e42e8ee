//! Redis-backed key-value and lock service.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::info;

use super::KvBackend;
use crate::error::{LimiterError, Result};

/// Deletes the lock only when it still belongs to the caller.
const UNLOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// A [`KvBackend`] talking to a Redis server.
///
/// Locks are `SET key owner NX PX ttl`; unlocking compares the owner before
/// deleting. State values are written with `SET key value PX ttl`.
#[derive(Clone)]
pub struct RedisBackend {
    address: String,
    conn: ConnectionManager,
    unlock: Script,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("address", &self.address)
            .finish()
    }
}

impl RedisBackend {
    /// Connect to the Redis server at `address` (`host:port` or a `redis://` URL).
    pub async fn connect(address: &str) -> Result<Self> {
        let url = if address.contains("://") {
            address.to_string()
        } else {
            format!("redis://{}/", address)
        };

        info!(address = %url, "Connecting to Redis");
        let client = redis::Client::open(url.as_str()).map_err(persist_error)?;
        let conn = ConnectionManager::new(client).await.map_err(persist_error)?;

        Ok(Self {
            address: url,
            conn,
            unlock: Script::new(UNLOCK_SCRIPT),
        })
    }

    /// The URL this backend is connected to.
    pub fn address(&self) -> &str {
        &self.address
    }
}

fn persist_error(e: redis::RedisError) -> LimiterError {
    LimiterError::Persist(e.to_string())
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(persist_error)?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .unlock
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(persist_error)?;
        Ok(deleted == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(persist_error)
    }

    async fn set_with_expiry(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut conn)
            .await
            .map_err(persist_error)
    }
}
