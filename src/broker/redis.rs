//! Redis-backed broker.
//!
//! Lists are used LPUSH-in / RPOP-out so queues stay FIFO, hashes collect the
//! per-task partial results, and plain keys with TTLs carry progress
//! snapshots and worker liveness. The `ConnectionManager` handles
//! reconnection automatically.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{Broker, BrokerError};

impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        BrokerError::Backend(e.to_string())
    }
}

/// Queue broker backed by Redis.
pub struct RedisBroker {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
}

impl RedisBroker {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        Ok(Self { redis })
    }

    /// Creates a broker from an existing ConnectionManager.
    ///
    /// Useful when sharing a connection pool across multiple components.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn append(&self, queue: &str, payload: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(queue, payload).await?;
        Ok(())
    }

    async fn pop_head(&self, queue: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.redis.clone();
        let payload: Option<String> = conn.rpop(queue, None).await?;
        Ok(payload)
    }

    async fn len(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(queue).await?;
        Ok(len)
    }

    async fn clear(&self, queue: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(queue).await?;
        Ok(())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    async fn hash_len(&self, key: &str) -> Result<usize, BrokerError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.hlen(key).await?;
        Ok(len)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn del(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        conn.expire::<_, ()>(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, BrokerError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        // MGET with a single key collapses to a scalar reply, so fetch
        // one-key requests through GET to keep the return shape uniform.
        if keys.len() == 1 {
            let value: Option<String> = conn.get(&keys[0]).await?;
            return Ok(vec![value]);
        }

        let values: Vec<Option<String>> = conn.mget(keys).await?;
        Ok(values)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.redis.clone();
        let mut keys = Vec::new();

        let mut iter: redis::AsyncIter<String> = conn.scan_match(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }

        Ok(keys)
    }
}
