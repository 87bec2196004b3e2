//! Durable, at-least-once job queue.
//!
//! FIFO within a priority class; higher classes drain first. A dequeued
//! entry is leased, not removed: if the holder never acks it, the entry
//! becomes visible again once the lease expires.

mod memory;

pub use memory::MemoryQueue;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;
use crate::jobs::Priority;

/// What gets enqueued. The job record itself lives in the job store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: Uuid,
    pub priority: Priority,
}

impl QueueEntry {
    pub fn new(job_id: Uuid, priority: Priority) -> Self {
        Self { job_id, priority }
    }
}

/// A delivered entry, invisible to other consumers until `leased_until`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: Uuid,
    pub priority: Priority,
    /// How many times this entry has been handed out, this delivery included.
    pub delivery_count: u32,
    pub leased_until: DateTime<Utc>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add an entry. Enqueuing a job id that is already present is a no-op.
    async fn enqueue(&self, entry: QueueEntry) -> Result<Uuid, QueueError>;

    /// Lease the oldest visible entry of one priority class, if any.
    async fn dequeue(&self, priority: Priority) -> Result<Option<Lease>, QueueError>;

    /// Remove a leased entry for good.
    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Give a lease back. With `requeue` the entry goes to the tail of its
    /// class and is visible immediately; without it the entry is dropped.
    async fn nack(&self, job_id: Uuid, requeue: bool) -> Result<(), QueueError>;

    /// Push the lease deadline out by one visibility timeout.
    async fn extend_lease(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Cheap reachability probe for health checks.
    async fn ping(&self) -> Result<(), QueueError>;

    /// Entries currently waiting (visible or leased).
    async fn depth(&self) -> Result<u64, QueueError>;

    /// Block for up to `timeout` or until new work might be available.
    async fn wait_for_work(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }

    /// Lease from the highest non-empty class, waiting up to `wait` once when
    /// every class is empty.
    async fn dequeue_next(&self, wait: Duration) -> Result<Option<Lease>, QueueError> {
        for priority in Priority::ALL {
            if let Some(lease) = self.dequeue(priority).await? {
                return Ok(Some(lease));
            }
        }
        self.wait_for_work(wait).await;
        for priority in Priority::ALL {
            if let Some(lease) = self.dequeue(priority).await? {
                return Ok(Some(lease));
            }
        }
        Ok(None)
    }
}
