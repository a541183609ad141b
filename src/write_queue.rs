//! Background queue for fire-and-forget distributed-tier operations
//!
//! Asynchronous write-backs and deletes are submitted to a bounded channel
//! drained by a single worker task instead of spawning a task per call, so
//! concurrent fire-and-forget work cannot grow unbounded and failures stay
//! observable through the counters. Jobs are best-effort: failures are
//! logged and counted, never retried, and a full queue drops the job.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::distributed_tier::DistributedBackend;

pub(crate) const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug)]
pub(crate) enum WriteJob {
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Duration,
    },
    Delete {
        key: String,
    },
}

impl WriteJob {
    fn key(&self) -> &str {
        match self {
            WriteJob::Set { key, .. } | WriteJob::Delete { key } => key,
        }
    }
}

/// Counters for the fire-and-forget path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteQueueStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

pub(crate) struct WriteQueue {
    tx: mpsc::Sender<WriteJob>,
    counters: Arc<Counters>,
}

impl WriteQueue {
    /// Start the worker task draining jobs against `backend`.
    pub(crate) fn start(backend: Arc<dyn DistributedBackend>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<WriteJob>(capacity);
        let counters = Arc::new(Counters::default());

        let worker_counters = Arc::clone(&counters);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = match &job {
                    WriteJob::Set { key, value, ttl } => {
                        backend.set(key, value.clone(), *ttl).await
                    }
                    WriteJob::Delete { key } => backend.delete(key).await,
                };
                match result {
                    Ok(()) => {
                        worker_counters.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        worker_counters.failed.fetch_add(1, Ordering::Relaxed);
                        error!(key = job.key(), error = %e, "background cache write failed");
                    }
                }
            }
        });

        Self { tx, counters }
    }

    /// Enqueue a job. Drops it with a warning when the queue is full.
    pub(crate) fn submit(&self, job: WriteJob) {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.tx.try_send(job) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            let job = match e {
                mpsc::error::TrySendError::Full(job) => job,
                mpsc::error::TrySendError::Closed(job) => job,
            };
            warn!(key = job.key(), "write queue full, dropping background job");
        }
    }

    pub(crate) fn stats(&self) -> WriteQueueStats {
        WriteQueueStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}
