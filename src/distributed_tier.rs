//! Distributed cache tier
//!
//! The shared backend behind all processes. The engine only needs get with a
//! distinguished miss, set with a TTL, and delete; anything speaking that
//! contract can back the tier. A Redis implementation is bundled.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::BoxError;

/// Shared key/value backend for the distributed tier.
#[async_trait]
pub trait DistributedBackend: Send + Sync + 'static {
    /// Fetch the payload under `key`. `Ok(None)` is a miss, not an error.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BoxError>;

    /// Store the payload under `key` for `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), BoxError>;

    /// Remove the payload under `key`.
    async fn delete(&self, key: &str) -> Result<(), BoxError>;
}

/// Redis-backed distributed tier.
///
/// The connection manager multiplexes one connection and is cloned per call,
/// so a single `RedisTier` is safely shared by every request in the process.
pub struct RedisTier {
    conn: redis::aio::ConnectionManager,
}

impl RedisTier {
    pub async fn connect(client: redis::Client) -> Result<Self, redis::RedisError> {
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl DistributedBackend for RedisTier {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BoxError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), BoxError> {
        let mut conn = self.conn.clone();
        // SET EX rejects a zero expiry.
        let ttl_seconds = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, ttl_seconds).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BoxError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}
