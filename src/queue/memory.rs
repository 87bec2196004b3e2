use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::QueueError;
use crate::jobs::Priority;
use crate::queue::{JobQueue, Lease, QueueEntry};

#[derive(Debug)]
struct Slot {
    priority: Priority,
    seq: u64,
    delivery_count: u32,
    leased_until: Option<Instant>,
}

impl Slot {
    fn is_visible(&self, now: Instant) -> bool {
        self.leased_until.is_none_or(|until| until <= now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    slots: HashMap<Uuid, Slot>,
    next_seq: u64,
}

impl Inner {
    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// In-process queue. Loses its contents on restart; use the libSQL queue
/// when durability matters.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    available: AtomicBool,
    visibility_timeout: Duration,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            available: AtomicBool::new(true),
            visibility_timeout,
        }
    }

    /// Simulate the queue going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if available {
            self.notify.notify_waiters();
        }
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Unavailable {
                reason: "in-memory queue marked unavailable".into(),
            })
        }
    }

    fn lease_deadline(&self) -> (Instant, chrono::DateTime<Utc>) {
        let wall = Utc::now()
            + chrono::Duration::from_std(self.visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        (Instant::now() + self.visibility_timeout, wall)
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, entry: QueueEntry) -> Result<Uuid, QueueError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if !inner.slots.contains_key(&entry.job_id) {
            let seq = inner.bump_seq();
            inner.slots.insert(
                entry.job_id,
                Slot {
                    priority: entry.priority,
                    seq,
                    delivery_count: 0,
                    leased_until: None,
                },
            );
            drop(inner);
            self.notify.notify_one();
        }
        Ok(entry.job_id)
    }

    async fn dequeue(&self, priority: Priority) -> Result<Option<Lease>, QueueError> {
        self.check_available()?;
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let next = inner
            .slots
            .iter()
            .filter(|(_, s)| s.priority == priority && s.is_visible(now))
            .min_by_key(|(_, s)| s.seq)
            .map(|(id, _)| *id);
        let Some(job_id) = next else {
            return Ok(None);
        };
        let (deadline, leased_until) = self.lease_deadline();
        let Some(slot) = inner.slots.get_mut(&job_id) else {
            return Ok(None);
        };
        slot.leased_until = Some(deadline);
        slot.delivery_count += 1;
        Ok(Some(Lease {
            job_id,
            priority,
            delivery_count: slot.delivery_count,
            leased_until,
        }))
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        match inner.slots.get(&job_id) {
            Some(slot) if slot.leased_until.is_some() => {
                inner.slots.remove(&job_id);
                Ok(())
            }
            _ => Err(QueueError::LeaseNotFound { job_id }),
        }
    }

    async fn nack(&self, job_id: Uuid, requeue: bool) -> Result<(), QueueError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if !inner
            .slots
            .get(&job_id)
            .is_some_and(|slot| slot.leased_until.is_some())
        {
            return Err(QueueError::LeaseNotFound { job_id });
        }
        if requeue {
            let seq = inner.bump_seq();
            if let Some(slot) = inner.slots.get_mut(&job_id) {
                slot.seq = seq;
                slot.leased_until = None;
            }
            drop(inner);
            self.notify.notify_one();
        } else {
            inner.slots.remove(&job_id);
        }
        Ok(())
    }

    async fn extend_lease(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.check_available()?;
        let (deadline, _) = self.lease_deadline();
        let mut inner = self.inner.lock().await;
        match inner.slots.get_mut(&job_id) {
            Some(slot) if slot.leased_until.is_some() => {
                slot.leased_until = Some(deadline);
                Ok(())
            }
            _ => Err(QueueError::LeaseNotFound { job_id }),
        }
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.check_available()
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        self.check_available()?;
        Ok(self.inner.lock().await.slots.len() as u64)
    }

    async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}
