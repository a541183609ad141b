//! tiercache - Two-tier, stampede-protected cache-aside library
//!
//! This library sits between a caller and a slow source of truth and serves
//! repeated reads from progressively cheaper tiers:
//! - Local tier: the request-scoped store, gone with the request
//! - Distributed tier: a shared backend (Redis bundled), shared across processes
//! - Source: a caller-supplied load function, hit only on a full miss
//!
//! The engine supports:
//! - Collapsing concurrent misses into one distributed read and one source
//!   load per key, with a bounded wait on in-flight loads
//! - Synchronous or queued (fire-and-forget) write-back and delete
//! - An entity adapter deriving keys from a declared type key and identity,
//!   with JSON payloads
//! - Degrading to local tier + source when no distributed backend is wired

mod config;
mod dedup;
mod distributed_tier;
mod entity_cache;
mod error;
mod local_tier;
mod request_store;
mod runtime;
mod two_tier_cache;
mod write_queue;

pub use config::CacheConfig;
pub use dedup::{DedupCoordinator, DedupError, DedupGroup, LOAD_GROUP, READ_GROUP};
pub use distributed_tier::{DistributedBackend, RedisTier};
pub use entity_cache::{CacheEntity, EntityCache, EntitySourceFn};
pub use error::{BoxError, CacheError};
pub use local_tier::LocalTier;
pub use request_store::{MemStore, RequestStore, StoreValue};
pub use runtime::CacheRuntime;
pub use two_tier_cache::{SourceFn, TwoTierCache};
pub use write_queue::WriteQueueStats;

// Re-export async_trait for convenience
pub use async_trait::async_trait;
