//! Request-scoped key/value store
//!
//! The store lives exactly as long as one inbound request and is shared by
//! everything handling that request, so values are type-erased. The cache
//! keeps byte payloads in it; unrelated middleware may keep anything else.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// A type-erased value held in the request scope.
pub type StoreValue = Arc<dyn Any + Send + Sync>;

/// Ephemeral key/value store bound to a single request.
///
/// When a request's resources are deliberately kept alive past normal
/// cleanup (`is_defer_recycle` returns true), the local cache tier treats
/// the store as inert so nothing written here can leak across requests.
pub trait RequestStore: Send + Sync {
    /// Look up a value, or None if absent.
    fn get(&self, key: &str) -> Option<StoreValue>;

    /// Insert or replace a value.
    fn set(&self, key: &str, value: StoreValue);

    /// Remove a value if present.
    fn remove(&self, key: &str);

    /// Whether this request is marked for deferred recycling.
    fn is_defer_recycle(&self) -> bool;
}

/// In-memory [`RequestStore`] with a lifetime of one request.
pub struct MemStore {
    values: RwLock<HashMap<String, StoreValue>>,
    defer_recycle: AtomicBool,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            defer_recycle: AtomicBool::new(false),
        }
    }

    /// Mark the request for deferred recycling.
    pub fn defer_recycle(&self) {
        self.defer_recycle.store(true, Ordering::SeqCst);
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestStore for MemStore {
    fn get(&self, key: &str) -> Option<StoreValue> {
        self.values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: StoreValue) {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_owned(), value);
    }

    fn remove(&self, key: &str) {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    fn is_defer_recycle(&self) -> bool {
        self.defer_recycle.load(Ordering::SeqCst)
    }
}
