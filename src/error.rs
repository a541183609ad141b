//! Cache error types

use std::time::Duration;

/// Boxed error used at the source and distributed-backend boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// `get` was called before a load function was registered.
    #[error("undefined source")]
    SourceUndefined,

    /// The load function failed. Never cached.
    #[error("source error: {0}")]
    Source(#[source] BoxError),

    /// Waiting on an in-flight load exceeded the configured bound.
    #[error("load timed out after {0:?}")]
    DedupTimeout(Duration),

    /// The request store held a non-byte value under a cache key.
    /// Indicates a key reused across incompatible payload types.
    #[error("invalid cached data for key {key}")]
    InvalidCachedData { key: String },

    /// Synchronous distributed-tier I/O failure.
    #[error("distributed tier error: {0}")]
    Distributed(#[source] BoxError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
