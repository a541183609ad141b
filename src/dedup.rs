//! Deduplication of concurrent identical operations
//!
//! At most one operation may be in flight per (group, key) within the
//! process. The first caller registers a flight and executes; concurrent
//! callers attach to the flight and receive the same result without
//! re-executing. Groups are independent: the engine keeps one for
//! distributed-tier reads and one for source loads.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{RwLock, watch};

use crate::error::BoxError;

/// Group guarding distributed-tier reads.
pub const READ_GROUP: &str = "cache";
/// Group guarding source loads.
pub const LOAD_GROUP: &str = "call";

/// Payload shared between the executing caller and attached waiters. The
/// executor keeps the typed error; waiters receive its rendered message.
type Shared = Result<Option<Vec<u8>>, String>;
type FlightTx = watch::Sender<Option<Shared>>;
type FlightRx = watch::Receiver<Option<Shared>>;

/// Error from a deduplicated operation.
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    /// The operation itself failed.
    #[error("{0}")]
    Op(#[source] BoxError),

    /// Waiting for the in-flight operation exceeded the bound.
    #[error("timed out after {0:?} waiting for in-flight operation")]
    Timeout(Duration),

    /// The executing task went away without publishing a result.
    #[error("in-flight operation was cancelled")]
    Cancelled,
}

/// An in-flight registration. The id distinguishes successive flights for
/// the same key so a stale release cannot drop a successor's registration.
#[derive(Clone)]
struct Flight {
    id: u64,
    rx: FlightRx,
}

type FlightMap = Arc<RwLock<HashMap<String, Flight>>>;

/// Ensures a flight is resolved and unregistered even on panic or cancel.
///
/// Dropping the guard without completing it notifies waiters with an error;
/// either way the registration is removed, but only while it still belongs
/// to this flight.
struct FlightGuard {
    key: String,
    id: u64,
    in_flight: FlightMap,
    tx: Option<FlightTx>,
}

impl FlightGuard {
    fn complete(mut self, result: Shared) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(result));
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(Err("operation was cancelled".to_owned())));
        }
        let key = std::mem::take(&mut self.key);
        let id = self.id;
        let in_flight = Arc::clone(&self.in_flight);
        tokio::spawn(async move {
            let mut flights = in_flight.write().await;
            if flights.get(&key).is_some_and(|f| f.id == id) {
                flights.remove(&key);
            }
        });
    }
}

async fn await_shared(mut rx: FlightRx) -> Result<Option<Vec<u8>>, DedupError> {
    loop {
        if let Some(result) = rx.borrow().as_ref() {
            return match result {
                Ok(value) => Ok(value.clone()),
                Err(e) => Err(DedupError::Op(e.clone().into())),
            };
        }
        if rx.changed().await.is_err() {
            return Err(DedupError::Cancelled);
        }
    }
}

/// At-most-one-in-flight-per-key execution for one named group.
pub struct DedupGroup {
    in_flight: FlightMap,
    next_id: AtomicU64,
}

impl DedupGroup {
    fn new() -> Self {
        Self {
            in_flight: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `op` inline, collapsing concurrent callers for `key` into one
    /// execution. The wait on an existing flight is unbounded.
    pub async fn run<F, Fut>(&self, key: &str, op: F) -> Result<Option<Vec<u8>>, DedupError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Vec<u8>>, BoxError>>,
    {
        {
            let flights = self.in_flight.read().await;
            if let Some(flight) = flights.get(key) {
                let rx = flight.rx.clone();
                drop(flights);
                return await_shared(rx).await;
            }
        }

        let (tx, rx) = watch::channel(None);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut flights = self.in_flight.write().await;
            // Double-check: another task may have registered while we waited
            // for the write lock.
            if let Some(flight) = flights.get(key) {
                let rx = flight.rx.clone();
                drop(flights);
                return await_shared(rx).await;
            }
            flights.insert(key.to_owned(), Flight { id, rx });
        }
        let guard = FlightGuard {
            key: key.to_owned(),
            id,
            in_flight: Arc::clone(&self.in_flight),
            tx: Some(tx),
        };

        let result = op().await;
        let shared = match &result {
            Ok(value) => Ok(value.clone()),
            Err(e) => Err(e.to_string()),
        };
        guard.complete(shared);
        result.map_err(DedupError::Op)
    }

    /// Spawn `op` as its own task, collapsing concurrent callers for `key`
    /// into one execution, and wait at most `wait` for the result.
    ///
    /// On timeout the caller releases its own registration and returns
    /// `Timeout`. The spawned operation keeps running to completion, and a
    /// caller arriving after the release starts a fresh operation for the
    /// same key even though the original may still be running.
    pub async fn run_detached<Fut>(
        &self,
        key: &str,
        op: Fut,
        wait: Duration,
    ) -> Result<Option<Vec<u8>>, DedupError>
    where
        Fut: Future<Output = Result<Option<Vec<u8>>, BoxError>> + Send + 'static,
    {
        let flight = self.register_detached(key, op).await;
        let id = flight.id;
        match tokio::time::timeout(wait, await_shared(flight.rx)).await {
            Ok(result) => result,
            Err(_) => {
                self.forget(key, id).await;
                Err(DedupError::Timeout(wait))
            }
        }
    }

    async fn register_detached<Fut>(&self, key: &str, op: Fut) -> Flight
    where
        Fut: Future<Output = Result<Option<Vec<u8>>, BoxError>> + Send + 'static,
    {
        {
            let flights = self.in_flight.read().await;
            if let Some(flight) = flights.get(key) {
                return flight.clone();
            }
        }

        let (tx, rx) = watch::channel(None);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let flight = Flight { id, rx };
        {
            let mut flights = self.in_flight.write().await;
            if let Some(existing) = flights.get(key) {
                return existing.clone();
            }
            flights.insert(key.to_owned(), flight.clone());
        }
        let guard = FlightGuard {
            key: key.to_owned(),
            id,
            in_flight: Arc::clone(&self.in_flight),
            tx: Some(tx),
        };
        tokio::spawn(async move {
            let result = op.await;
            guard.complete(result.map_err(|e| e.to_string()));
        });
        flight
    }

    /// Release the registration for `key` if it still belongs to flight `id`.
    async fn forget(&self, key: &str, id: u64) {
        let mut flights = self.in_flight.write().await;
        if flights.get(key).is_some_and(|f| f.id == id) {
            flights.remove(key);
        }
    }
}

/// Explicitly constructed home for named dedup groups.
///
/// One instance per process, owned by whatever wires up the cache engines.
pub struct DedupCoordinator {
    groups: std::sync::RwLock<HashMap<&'static str, Arc<DedupGroup>>>,
}

impl DedupCoordinator {
    pub fn new() -> Self {
        Self {
            groups: std::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Look up a named group, creating it on first use.
    pub fn group(&self, name: &'static str) -> Arc<DedupGroup> {
        {
            let groups = self.groups.read().unwrap_or_else(|e| e.into_inner());
            if let Some(group) = groups.get(name) {
                return Arc::clone(group);
            }
        }
        let mut groups = self.groups.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            groups
                .entry(name)
                .or_insert_with(|| Arc::new(DedupGroup::new())),
        )
    }
}

impl Default for DedupCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn counting_op(
        calls: Arc<AtomicUsize>,
        delay: Duration,
        payload: &'static [u8],
    ) -> impl Future<Output = Result<Option<Vec<u8>>, BoxError>> + Send + 'static {
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            sleep(delay).await;
            Ok(Some(payload.to_vec()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_runs_execute_once() {
        let group = Arc::new(DedupGroup::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let group = Arc::clone(&group);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                group
                    .run("k", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(50)).await;
                        Ok(Some(b"value".to_vec()))
                    })
                    .await
            }));
        }
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result, Some(b"value".to_vec()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_share_the_error() {
        let group = Arc::new(DedupGroup::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let group = Arc::clone(&group);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                group
                    .run("k", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(10)).await;
                        Err::<Option<Vec<u8>>, BoxError>("source down".into())
                    })
                    .await
            }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(err.to_string().contains("source down"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn detached_callers_collapse() {
        let group = Arc::new(DedupGroup::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let group = Arc::clone(&group);
            let op = counting_op(Arc::clone(&calls), Duration::from_millis(50), b"v");
            handles.push(tokio::spawn(async move {
                group.run_detached("k", op, Duration::from_secs(20)).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), Some(b"v".to_vec()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_releases_key_for_a_fresh_run() {
        let group = Arc::new(DedupGroup::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let slow = counting_op(Arc::clone(&calls), Duration::from_secs(60), b"slow");
        let err = group
            .run_detached("k", slow, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DedupError::Timeout(_)));

        // The key was forgotten: a new caller starts a fresh operation even
        // though the first one is still running.
        let fast = counting_op(Arc::clone(&calls), Duration::from_millis(1), b"fast");
        let result = group
            .run_detached("k", fast, Duration::from_secs(20))
            .await
            .unwrap();
        assert_eq!(result, Some(b"fast".to_vec()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
