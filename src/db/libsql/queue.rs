//! Durable JobQueue implementation for LibSqlBackend.
//!
//! A lease is a `leased_until_ms` deadline on the row. Dequeue claims the
//! oldest visible row of a class with a single `UPDATE ... RETURNING`, so
//! two consumers can never lease the same entry.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::params;
use uuid::Uuid;

use crate::db::libsql::{LibSqlBackend, get_i64, get_text, parse_uuid};
use crate::error::QueueError;
use crate::jobs::Priority;
use crate::queue::{JobQueue, Lease, QueueEntry};

fn unavailable(e: impl std::fmt::Display) -> QueueError {
    QueueError::Unavailable {
        reason: e.to_string(),
    }
}

impl LibSqlBackend {
    fn lease_deadline_ms(&self) -> i64 {
        let timeout_ms = i64::try_from(self.visibility_timeout.as_millis()).unwrap_or(i64::MAX);
        Utc::now().timestamp_millis().saturating_add(timeout_ms)
    }

    async fn queue_conn(&self) -> Result<libsql::Connection, QueueError> {
        self.connect().await.map_err(unavailable)
    }
}

#[async_trait]
impl JobQueue for LibSqlBackend {
    async fn enqueue(&self, entry: QueueEntry) -> Result<Uuid, QueueError> {
        let conn = self.queue_conn().await?;
        conn.execute(
            "INSERT INTO job_queue (job_id, priority, seq, delivery_count, leased_until_ms) \
             VALUES (?1, ?2, (SELECT COALESCE(MAX(seq), 0) + 1 FROM job_queue), 0, NULL) \
             ON CONFLICT(job_id) DO NOTHING",
            params![entry.job_id.to_string(), entry.priority.rank()],
        )
        .await
        .map_err(unavailable)?;
        Ok(entry.job_id)
    }

    async fn dequeue(&self, priority: Priority) -> Result<Option<Lease>, QueueError> {
        let conn = self.queue_conn().await?;
        let now_ms = Utc::now().timestamp_millis();
        let deadline_ms = self.lease_deadline_ms();
        let mut rows = conn
            .query(
                "UPDATE job_queue \
                 SET leased_until_ms = ?1, delivery_count = delivery_count + 1 \
                 WHERE job_id = ( \
                     SELECT job_id FROM job_queue \
                     WHERE priority = ?2 AND (leased_until_ms IS NULL OR leased_until_ms <= ?3) \
                     ORDER BY seq ASC LIMIT 1 \
                 ) \
                 RETURNING job_id, delivery_count",
                params![deadline_ms, priority.rank(), now_ms],
            )
            .await
            .map_err(unavailable)?;

        let Some(row) = rows.next().await.map_err(unavailable)? else {
            return Ok(None);
        };
        let job_id = parse_uuid(&get_text(&row, 0), "job").map_err(unavailable)?;
        Ok(Some(Lease {
            job_id,
            priority,
            delivery_count: u32::try_from(get_i64(&row, 1)).unwrap_or(u32::MAX),
            leased_until: DateTime::from_timestamp_millis(deadline_ms).unwrap_or_else(Utc::now),
        }))
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError> {
        let conn = self.queue_conn().await?;
        let affected = conn
            .execute(
                "DELETE FROM job_queue WHERE job_id = ?1 AND leased_until_ms IS NOT NULL",
                params![job_id.to_string()],
            )
            .await
            .map_err(unavailable)?;
        if affected == 0 {
            return Err(QueueError::LeaseNotFound { job_id });
        }
        Ok(())
    }

    async fn nack(&self, job_id: Uuid, requeue: bool) -> Result<(), QueueError> {
        let conn = self.queue_conn().await?;
        let result = if requeue {
            conn.execute(
                "UPDATE job_queue \
                 SET leased_until_ms = NULL, seq = (SELECT COALESCE(MAX(seq), 0) + 1 FROM job_queue) \
                 WHERE job_id = ?1 AND leased_until_ms IS NOT NULL",
                params![job_id.to_string()],
            )
            .await
        } else {
            conn.execute(
                "DELETE FROM job_queue WHERE job_id = ?1 AND leased_until_ms IS NOT NULL",
                params![job_id.to_string()],
            )
            .await
        };
        let affected = result.map_err(unavailable)?;
        if affected == 0 {
            return Err(QueueError::LeaseNotFound { job_id });
        }
        Ok(())
    }

    async fn extend_lease(&self, job_id: Uuid) -> Result<(), QueueError> {
        let conn = self.queue_conn().await?;
        let affected = conn
            .execute(
                "UPDATE job_queue SET leased_until_ms = ?2 \
                 WHERE job_id = ?1 AND leased_until_ms IS NOT NULL",
                params![job_id.to_string(), self.lease_deadline_ms()],
            )
            .await
            .map_err(unavailable)?;
        if affected == 0 {
            return Err(QueueError::LeaseNotFound { job_id });
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let conn = self.queue_conn().await?;
        let mut rows = conn
            .query("SELECT 1 FROM job_queue LIMIT 1", ())
            .await
            .map_err(unavailable)?;
        rows.next().await.map_err(unavailable)?;
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let conn = self.queue_conn().await?;
        let mut rows = conn
            .query("SELECT COUNT(*) FROM job_queue", ())
            .await
            .map_err(unavailable)?;
        let count = match rows.next().await.map_err(unavailable)? {
            Some(row) => get_i64(&row, 0),
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn wait_for_work(&self, timeout: Duration) {
        // No cross-process notification; poll at a bounded cadence.
        tokio::time::sleep(timeout.min(Duration::from_millis(250))).await;
    }
}
