//! Entity cache
//!
//! Typed specialization of the two-tier engine: the key is derived from the
//! entity's declared type key and identity, payloads are JSON, and the load
//! function populates a caller-supplied target in place. Dedup, TTL, and
//! async-write semantics are the byte engine's.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::CacheConfig;
use crate::dedup::{DedupError, LOAD_GROUP};
use crate::error::{BoxError, CacheError};
use crate::request_store::RequestStore;
use crate::runtime::CacheRuntime;
use crate::two_tier_cache::TwoTierCache;

/// A value cacheable by type and identity.
///
/// The type key is declared explicitly rather than derived from the Rust
/// type name, so a rename can never silently change live cache keys.
pub trait CacheEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stable type segment of the cache key, e.g. `"User"`.
    fn type_key() -> &'static str;

    /// Identity segment of the cache key, e.g. the primary key.
    fn identity(&self) -> String;
}

/// Caller-supplied load function populating an entity in place.
pub type EntitySourceFn<E> =
    Arc<dyn for<'a> Fn(&'a mut E) -> BoxFuture<'a, Result<(), BoxError>> + Send + Sync>;

pub struct EntityCache<E: CacheEntity> {
    inner: TwoTierCache,
    source: Option<EntitySourceFn<E>>,
}

impl<E: CacheEntity> EntityCache<E> {
    pub fn new(runtime: Arc<CacheRuntime>, store: Arc<dyn RequestStore>) -> Self {
        Self {
            inner: TwoTierCache::new(runtime, store),
            source: None,
        }
    }

    /// Register the load function invoked on a full miss. It receives a
    /// target carrying the identity of the entity being fetched.
    pub fn set_source<F>(mut self, source: F) -> Self
    where
        F: for<'a> Fn(&'a mut E) -> BoxFuture<'a, Result<(), BoxError>> + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    /// Namespace keys as `"{prefix}:{type_key}:{identity}"`.
    pub fn set_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.inner = self.inner.set_prefix(prefix);
        self
    }

    /// Distributed-tier TTL. Defaults to 5 minutes.
    pub fn set_expiration(mut self, expiration: Duration) -> Self {
        self.inner = self.inner.set_expiration(expiration);
        self
    }

    /// Write back through the background queue instead of synchronously.
    /// Defaults to off.
    pub fn set_async_write(mut self, enabled: bool) -> Self {
        self.inner = self.inner.set_async_write(enabled);
        self
    }

    /// Collapse concurrent distributed reads and source loads per key.
    /// Defaults to on.
    pub fn set_dedup(mut self, enabled: bool) -> Self {
        self.inner = self.inner.set_dedup(enabled);
        self
    }

    /// Bound on waiting for an in-flight source load. Defaults to 20 seconds.
    pub fn set_load_timeout(mut self, timeout: Duration) -> Self {
        self.inner = self.inner.set_load_timeout(timeout);
        self
    }

    /// Drop the distributed tier for this engine; only the local tier and
    /// the source remain.
    pub fn disable_distributed_tier(mut self) -> Self {
        self.inner = self.inner.disable_distributed_tier();
        self
    }

    /// Populate `entity` through the tiers, loading from the source on a
    /// full miss. The entity must carry its identity going in.
    pub async fn get_entity(&self, entity: &mut E) -> Result<(), CacheError> {
        self.get_entity_with_ttl(entity, None).await
    }

    /// As [`EntityCache::get_entity`], overriding the configured TTL for the
    /// write-back of this call.
    pub async fn get_entity_with_ttl(
        &self,
        entity: &mut E,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let key = self.entity_key(entity);

        if let Some(bytes) = self.inner.local().get(&key)? {
            *entity = serde_json::from_slice(&bytes)?;
            return Ok(());
        }

        if let Some(bytes) = self.inner.read_distributed(&key).await? {
            *entity = serde_json::from_slice(&bytes)?;
            self.inner.local().set(&key, bytes);
            return Ok(());
        }

        let bytes = self.load_source(&key, entity).await?;
        self.inner.local().set(&key, bytes.clone());
        self.inner.write_back(&key, bytes, ttl).await?;
        Ok(())
    }

    /// Remove the entity's entry from both tiers. Semantics match
    /// [`TwoTierCache::delete`].
    pub async fn delete(&self, entity: &E, asynchronous: bool) -> Result<(), CacheError> {
        let key = self.entity_key(entity);
        self.inner.delete_key(&key, asynchronous).await
    }

    fn entity_key(&self, entity: &E) -> String {
        let prefix = &self.config().prefix;
        if prefix.is_empty() {
            format!("{}:{}", E::type_key(), entity.identity())
        } else {
            format!("{}:{}:{}", prefix, E::type_key(), entity.identity())
        }
    }

    fn config(&self) -> &CacheConfig {
        self.inner.config()
    }

    async fn load_source(&self, key: &str, entity: &mut E) -> Result<Vec<u8>, CacheError> {
        let Some(source) = &self.source else {
            return Err(CacheError::SourceUndefined);
        };

        if !self.config().dedup {
            source(entity).await.map_err(CacheError::Source)?;
            return Ok(serde_json::to_vec(entity)?);
        }

        // The load runs detached, so it owns a scratch clone of the target
        // (keeping the identity available); every caller, this one included,
        // refreshes its target from the shared bytes.
        let source = Arc::clone(source);
        let mut scratch = entity.clone();
        let op = async move {
            source(&mut scratch).await?;
            let bytes = serde_json::to_vec(&scratch).map_err(BoxError::from)?;
            Ok(Some(bytes))
        };

        let group = self.inner.runtime().dedup().group(LOAD_GROUP);
        let shared = group
            .run_detached(key, op, self.config().load_timeout)
            .await
            .map_err(|e| match e {
                DedupError::Op(e) => CacheError::Source(e),
                DedupError::Timeout(d) => CacheError::DedupTimeout(d),
                e @ DedupError::Cancelled => CacheError::Source(e.into()),
            })?;
        let bytes = shared.ok_or_else(|| CacheError::Source("load produced no entity".into()))?;
        *entity = serde_json::from_slice(&bytes)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed_tier::DistributedBackend;
    use crate::request_store::MemStore;
    use async_trait::async_trait;
    use futures::FutureExt;
    use serde::Deserialize;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: String,
        name: String,
    }

    impl User {
        fn blank(id: &str) -> Self {
            Self {
                id: id.to_owned(),
                name: String::new(),
            }
        }
    }

    impl CacheEntity for User {
        fn type_key() -> &'static str {
            "User"
        }

        fn identity(&self) -> String {
            self.id.clone()
        }
    }

    #[derive(Default)]
    struct MockBackend {
        entries: Mutex<HashMap<String, Vec<u8>>>,
        gets: AtomicUsize,
        sets: AtomicUsize,
    }

    #[async_trait]
    impl DistributedBackend for MockBackend {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BoxError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        async fn set(&self, key: &str, value: Vec<u8>, _ttl: Duration) -> Result<(), BoxError> {
            self.sets.fetch_add(1, Ordering::SeqCst);
            self.entries.lock().unwrap().insert(key.to_owned(), value);
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), BoxError> {
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }
    }

    fn load_name(user: &mut User) -> BoxFuture<'_, Result<(), BoxError>> {
        async move {
            user.name = format!("user-{}", user.id);
            Ok(())
        }
        .boxed()
    }

    fn runtime_with(backend: Arc<MockBackend>) -> Arc<CacheRuntime> {
        Arc::new(CacheRuntime::new(Some(
            backend as Arc<dyn DistributedBackend>,
        )))
    }

    #[tokio::test]
    async fn miss_populates_target_and_both_tiers() {
        let backend = Arc::new(MockBackend::default());
        let runtime = runtime_with(Arc::clone(&backend));
        let store = Arc::new(MemStore::new());
        let cache = EntityCache::<User>::new(runtime, Arc::clone(&store) as _)
            .set_prefix("app")
            .set_source(load_name);

        let mut user = User::blank("42");
        cache.get_entity(&mut user).await.unwrap();
        assert_eq!(user.name, "user-42");

        assert!(store.get("app:User:42").is_some());
        assert!(backend.entries.lock().unwrap().contains_key("app:User:42"));
    }

    #[tokio::test]
    async fn local_hit_deserializes_without_backend() {
        let backend = Arc::new(MockBackend::default());
        let runtime = runtime_with(Arc::clone(&backend));
        let store = Arc::new(MemStore::new());
        let cache =
            EntityCache::<User>::new(runtime, Arc::clone(&store) as _).set_source(load_name);

        let mut first = User::blank("7");
        cache.get_entity(&mut first).await.unwrap();
        let gets_after_miss = backend.gets.load(Ordering::SeqCst);

        let mut second = User::blank("7");
        cache.get_entity(&mut second).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(backend.gets.load(Ordering::SeqCst), gets_after_miss);
    }

    #[tokio::test]
    async fn distributed_hit_fills_target() {
        let backend = Arc::new(MockBackend::default());
        let cached = User {
            id: "9".to_owned(),
            name: "from-redis".to_owned(),
        };
        backend.entries.lock().unwrap().insert(
            "User:9".to_owned(),
            serde_json::to_vec(&cached).unwrap(),
        );
        let runtime = runtime_with(Arc::clone(&backend));
        let cache = EntityCache::<User>::new(runtime, Arc::new(MemStore::new()));

        let mut user = User::blank("9");
        cache.get_entity(&mut user).await.unwrap();
        assert_eq!(user, cached);
        // Served from the distributed tier, never loaded.
        assert_eq!(backend.sets.load(Ordering::SeqCst), 0);
    }

    static SLOW_LOAD_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn slow_load(user: &mut User) -> BoxFuture<'_, Result<(), BoxError>> {
        async move {
            SLOW_LOAD_CALLS.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(20)).await;
            user.name = "shared".to_owned();
            Ok(())
        }
        .boxed()
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_entity_loads_collapse() {
        let backend = Arc::new(MockBackend::default());
        let runtime = runtime_with(Arc::clone(&backend));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let runtime = Arc::clone(&runtime);
            handles.push(tokio::spawn(async move {
                let cache = EntityCache::<User>::new(runtime, Arc::new(MemStore::new()))
                    .set_source(slow_load);
                let mut user = User::blank("1");
                cache.get_entity(&mut user).await.map(|_| user)
            }));
        }
        for handle in handles {
            let user = handle.await.unwrap().unwrap();
            assert_eq!(user.name, "shared");
        }
        assert_eq!(SLOW_LOAD_CALLS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delete_clears_local_entry() {
        let backend = Arc::new(MockBackend::default());
        let runtime = runtime_with(Arc::clone(&backend));
        let store = Arc::new(MemStore::new());
        let cache =
            EntityCache::<User>::new(runtime, Arc::clone(&store) as _).set_source(load_name);

        let mut user = User::blank("3");
        cache.get_entity(&mut user).await.unwrap();
        assert!(store.get("User:3").is_some());

        cache.delete(&user, false).await.unwrap();
        assert!(store.get("User:3").is_none());
        assert!(!backend.entries.lock().unwrap().contains_key("User:3"));
    }

    #[tokio::test]
    async fn missing_source_is_a_configuration_error() {
        let backend = Arc::new(MockBackend::default());
        let runtime = runtime_with(backend);
        let cache = EntityCache::<User>::new(runtime, Arc::new(MemStore::new()));

        let mut user = User::blank("5");
        assert!(matches!(
            cache.get_entity(&mut user).await,
            Err(CacheError::SourceUndefined)
        ));
    }
}
