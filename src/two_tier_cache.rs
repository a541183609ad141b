//! Two-tier cache-aside engine
//!
//! Read path: request-local tier, then the shared distributed tier, then the
//! registered source. Concurrent misses for one key collapse into a single
//! distributed read and a single source load. Write-back and delete against
//! the distributed tier run synchronously or through the background queue.
//!
//! Engines are cheap and built per request; the dedup coordinator,
//! distributed backend, and write queue behind them are process-wide.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::debug;

use crate::config::CacheConfig;
use crate::dedup::{DedupError, LOAD_GROUP, READ_GROUP};
use crate::error::{BoxError, CacheError};
use crate::local_tier::LocalTier;
use crate::request_store::RequestStore;
use crate::runtime::CacheRuntime;
use crate::write_queue::WriteJob;

/// Caller-supplied load function for the byte engine.
pub type SourceFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Option<Vec<u8>>, BoxError>> + Send + Sync>;

pub struct TwoTierCache {
    runtime: Arc<CacheRuntime>,
    local: LocalTier,
    distributed_enabled: bool,
    config: CacheConfig,
    source: Option<SourceFn>,
}

impl TwoTierCache {
    pub fn new(runtime: Arc<CacheRuntime>, store: Arc<dyn RequestStore>) -> Self {
        Self {
            local: LocalTier::new(store),
            distributed_enabled: runtime.distributed().is_some(),
            config: CacheConfig::default(),
            source: None,
            runtime,
        }
    }

    /// Register the load function invoked on a full miss.
    pub fn set_source<F, Fut>(mut self, source: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Vec<u8>>, BoxError>> + Send + 'static,
    {
        self.source = Some(Arc::new(move || source().boxed()));
        self
    }

    /// Namespace keys as `"{prefix}:{key}"`.
    pub fn set_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.prefix = prefix.into();
        self
    }

    /// Distributed-tier TTL. Defaults to 5 minutes.
    pub fn set_expiration(mut self, expiration: Duration) -> Self {
        self.config.expiration = expiration;
        self
    }

    /// Write back through the background queue instead of synchronously.
    /// Defaults to off.
    pub fn set_async_write(mut self, enabled: bool) -> Self {
        self.config.async_write = enabled;
        self
    }

    /// Collapse concurrent distributed reads and source loads per key.
    /// Defaults to on.
    pub fn set_dedup(mut self, enabled: bool) -> Self {
        self.config.dedup = enabled;
        self
    }

    /// Bound on waiting for an in-flight source load. Defaults to 20 seconds.
    pub fn set_load_timeout(mut self, timeout: Duration) -> Self {
        self.config.load_timeout = timeout;
        self
    }

    /// Drop the distributed tier for this engine; only the local tier and
    /// the source remain.
    pub fn disable_distributed_tier(mut self) -> Self {
        self.distributed_enabled = false;
        self
    }

    /// Fetch `key` through the tiers, loading from the source on a full miss.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.get_with_ttl(key, None).await
    }

    /// As [`TwoTierCache::get`], overriding the configured TTL for the
    /// write-back of this call.
    pub async fn get_with_ttl(
        &self,
        key: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let key = self.full_key(key);

        if let Some(bytes) = self.local.get(&key)? {
            debug!(key = %key, "local tier hit");
            return Ok(Some(bytes));
        }

        if let Some(bytes) = self.read_distributed(&key).await? {
            debug!(key = %key, "distributed tier hit");
            self.local.set(&key, bytes.clone());
            return Ok(Some(bytes));
        }

        let Some(bytes) = self.load_source(&key).await? else {
            return Ok(None);
        };
        self.local.set(&key, bytes.clone());
        self.write_back(&key, bytes.clone(), ttl).await?;
        Ok(Some(bytes))
    }

    /// Remove `key` from the local tier and the distributed tier.
    ///
    /// The local entry is gone when this returns. With `asynchronous` the
    /// distributed delete is submitted to the background queue and this
    /// returns immediately; otherwise its error propagates.
    pub async fn delete(&self, key: &str, asynchronous: bool) -> Result<(), CacheError> {
        let key = self.full_key(key);
        self.delete_key(&key, asynchronous).await
    }

    pub(crate) async fn delete_key(&self, key: &str, asynchronous: bool) -> Result<(), CacheError> {
        self.local.remove(key);
        if !self.distributed_enabled {
            return Ok(());
        }
        let Some(backend) = self.runtime.distributed() else {
            return Ok(());
        };
        if !asynchronous {
            return backend.delete(key).await.map_err(CacheError::Distributed);
        }
        self.runtime.submit_write(WriteJob::Delete {
            key: key.to_owned(),
        });
        Ok(())
    }

    pub(crate) fn full_key(&self, key: &str) -> String {
        if self.config.prefix.is_empty() {
            key.to_owned()
        } else {
            format!("{}:{}", self.config.prefix, key)
        }
    }

    pub(crate) fn local(&self) -> &LocalTier {
        &self.local
    }

    pub(crate) fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn runtime(&self) -> &Arc<CacheRuntime> {
        &self.runtime
    }

    /// Read `key` from the distributed tier through the read dedup group.
    /// `Ok(None)` covers both a miss and a disabled tier.
    pub(crate) async fn read_distributed(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        if !self.distributed_enabled {
            return Ok(None);
        }
        let Some(backend) = self.runtime.distributed() else {
            return Ok(None);
        };
        if !self.config.dedup {
            return backend.get(key).await.map_err(CacheError::Distributed);
        }
        let group = self.runtime.dedup().group(READ_GROUP);
        let backend = Arc::clone(backend);
        let owned = key.to_owned();
        group
            .run(key, move || async move { backend.get(&owned).await })
            .await
            .map_err(|e| match e {
                DedupError::Op(e) => CacheError::Distributed(e),
                DedupError::Timeout(d) => CacheError::DedupTimeout(d),
                e @ DedupError::Cancelled => CacheError::Distributed(e.into()),
            })
    }

    async fn load_source(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let Some(source) = &self.source else {
            return Err(CacheError::SourceUndefined);
        };
        if !self.config.dedup {
            return source().await.map_err(CacheError::Source);
        }
        debug!(key = %key, "cache miss, loading from source");
        let group = self.runtime.dedup().group(LOAD_GROUP);
        group
            .run_detached(key, source(), self.config.load_timeout)
            .await
            .map_err(|e| match e {
                DedupError::Op(e) => CacheError::Source(e),
                DedupError::Timeout(d) => CacheError::DedupTimeout(d),
                e @ DedupError::Cancelled => CacheError::Source(e.into()),
            })
    }

    /// Write `bytes` to the distributed tier, synchronously or through the
    /// queue per configuration.
    pub(crate) async fn write_back(
        &self,
        key: &str,
        bytes: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        if !self.distributed_enabled {
            return Ok(());
        }
        let Some(backend) = self.runtime.distributed() else {
            return Ok(());
        };
        let expire = ttl.unwrap_or(self.config.expiration);
        if !self.config.async_write {
            return backend
                .set(key, bytes, expire)
                .await
                .map_err(CacheError::Distributed);
        }
        self.runtime.submit_write(WriteJob::Set {
            key: key.to_owned(),
            value: bytes,
            ttl: expire,
        });
        Ok(())
    }
}
