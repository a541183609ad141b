//! Request-local cache tier
//!
//! Thin byte-payload view over the request-scoped store. Reads and writes
//! are synchronous and in-process. Under deferred recycling the tier is
//! inert: reads miss, writes vanish, removes are skipped.

use std::sync::Arc;

use crate::error::CacheError;
use crate::request_store::RequestStore;

pub struct LocalTier {
    store: Arc<dyn RequestStore>,
}

impl LocalTier {
    pub fn new(store: Arc<dyn RequestStore>) -> Self {
        Self { store }
    }

    /// Fetch the payload under `key`, or None on a miss.
    ///
    /// A value of some other type under the key means the key was reused
    /// across incompatible payloads and surfaces as `InvalidCachedData`.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        if self.store.is_defer_recycle() {
            return Ok(None);
        }
        let Some(value) = self.store.get(key) else {
            return Ok(None);
        };
        match value.downcast::<Vec<u8>>() {
            Ok(bytes) => Ok(Some(bytes.as_ref().clone())),
            Err(_) => Err(CacheError::InvalidCachedData {
                key: key.to_owned(),
            }),
        }
    }

    pub fn set(&self, key: &str, bytes: Vec<u8>) {
        if self.store.is_defer_recycle() {
            return;
        }
        self.store.set(key, Arc::new(bytes));
    }

    pub fn remove(&self, key: &str) {
        if self.store.is_defer_recycle() {
            return;
        }
        self.store.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request_store::MemStore;

    #[test]
    fn round_trip() {
        let store = Arc::new(MemStore::new());
        let tier = LocalTier::new(store);

        assert!(tier.get("k").unwrap().is_none());
        tier.set("k", b"payload".to_vec());
        assert_eq!(tier.get("k").unwrap(), Some(b"payload".to_vec()));
        tier.remove("k");
        assert!(tier.get("k").unwrap().is_none());
    }

    #[test]
    fn foreign_value_is_invalid() {
        let store = Arc::new(MemStore::new());
        store.set("k", Arc::new("not bytes".to_owned()));

        let tier = LocalTier::new(store);
        assert!(matches!(
            tier.get("k"),
            Err(CacheError::InvalidCachedData { .. })
        ));
    }

    #[test]
    fn inert_under_defer_recycle() {
        let store = Arc::new(MemStore::new());
        store.set("k", Arc::new(b"kept".to_vec()));
        store.defer_recycle();

        let tier = LocalTier::new(Arc::clone(&store) as Arc<dyn RequestStore>);
        assert!(tier.get("k").unwrap().is_none());
        tier.set("other", b"dropped".to_vec());
        tier.remove("k");

        // The underlying entry survives untouched.
        assert!(store.get("k").is_some());
        assert!(store.get("other").is_none());
    }
}
