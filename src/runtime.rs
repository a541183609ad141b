//! Process-wide cache infrastructure
//!
//! One `CacheRuntime` is built at startup and shared by every request:
//! the dedup coordinator, the distributed backend (if any), and the
//! background write queue. Engines are built per request on top of it.

use std::sync::Arc;

use crate::dedup::DedupCoordinator;
use crate::distributed_tier::DistributedBackend;
use crate::write_queue::{DEFAULT_QUEUE_CAPACITY, WriteJob, WriteQueue, WriteQueueStats};

pub struct CacheRuntime {
    dedup: DedupCoordinator,
    distributed: Option<Arc<dyn DistributedBackend>>,
    write_queue: Option<WriteQueue>,
}

impl CacheRuntime {
    /// Build the shared infrastructure. With no backend the engines degrade
    /// to the local tier plus their sources.
    pub fn new(distributed: Option<Arc<dyn DistributedBackend>>) -> Self {
        Self::with_queue_capacity(distributed, DEFAULT_QUEUE_CAPACITY)
    }

    /// As [`CacheRuntime::new`], with an explicit write-queue bound.
    pub fn with_queue_capacity(
        distributed: Option<Arc<dyn DistributedBackend>>,
        capacity: usize,
    ) -> Self {
        let write_queue = distributed
            .as_ref()
            .map(|backend| WriteQueue::start(Arc::clone(backend), capacity));
        Self {
            dedup: DedupCoordinator::new(),
            distributed,
            write_queue,
        }
    }

    pub(crate) fn dedup(&self) -> &DedupCoordinator {
        &self.dedup
    }

    pub(crate) fn distributed(&self) -> Option<&Arc<dyn DistributedBackend>> {
        self.distributed.as_ref()
    }

    pub(crate) fn submit_write(&self, job: WriteJob) {
        if let Some(queue) = &self.write_queue {
            queue.submit(job);
        }
    }

    /// Counters for the fire-and-forget path, or None when no distributed
    /// backend is configured.
    pub fn write_queue_stats(&self) -> Option<WriteQueueStats> {
        self.write_queue.as_ref().map(|q| q.stats())
    }
}
