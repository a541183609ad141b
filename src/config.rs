//! Cache configuration

use std::time::Duration;

/// Per-engine configuration for the two-tier cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Key namespace prepended as `"{prefix}:"` when non-empty
    pub prefix: String,
    /// Time-to-live for distributed-tier entries
    pub expiration: Duration,
    /// Write back to the distributed tier through the background queue
    /// instead of synchronously
    pub async_write: bool,
    /// Collapse concurrent distributed reads and source loads per key
    pub dedup: bool,
    /// Upper bound on waiting for an in-flight source load
    pub load_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            expiration: Duration::from_secs(300), // 5 minutes
            async_write: false,
            dedup: true,
            load_timeout: Duration::from_secs(20),
        }
    }
}
