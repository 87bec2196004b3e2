//! Crash recovery: reconcile the store, the queue and the container runtime
//! after an unclean stop.

use serde::Serialize;

use crate::dispatcher::{Dispatcher, worker};
use crate::error::Error;
use crate::jobs::JobState;
use crate::observability::ObserverEvent;
use crate::queue::QueueEntry;

/// Jobs listed per recovery pass.
const RECOVERY_BATCH: usize = 10_000;

/// What one [`Dispatcher::recover`] pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Managed containers no execution owned, force-removed.
    pub orphans_reaped: usize,
    /// Execution records left open by the previous process.
    pub records_closed: usize,
    /// In-flight jobs moved back to `queued`.
    pub jobs_requeued: usize,
    /// `queued` jobs offered to the queue again.
    pub queued_reoffered: usize,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

impl Dispatcher {
    /// Reconcile after a restart.
    ///
    /// Takes the dispatcher lock first and fails while another process
    /// holds it, since everything below assumes nobody else is working.
    ///
    /// 1. Force-remove managed containers nobody owns and close their records.
    /// 2. Move every `running`, `timed_out` or `retrying` job this process is
    ///    not working on back to `queued`, through a conditional transition so
    ///    each is requeued exactly once, and put it back on the queue.
    /// 3. Re-enqueue `queued` jobs. Enqueue is idempotent, so this only
    ///    repairs jobs whose submission enqueue failed.
    pub async fn recover(&self) -> Result<RecoveryReport, Error> {
        self.hold_lock().await?;
        let shared = &self.shared;
        let mut report = RecoveryReport {
            orphans_reaped: shared.containers.reap_orphans().await?.len(),
            records_closed: shared.containers.close_stale_records().await?,
            ..RecoveryReport::default()
        };

        let active = shared.active_jobs.lock().await.keys().copied().collect::<Vec<_>>();
        let stuck = shared
            .jobs
            .list_jobs(
                &[JobState::Running, JobState::TimedOut, JobState::Retrying],
                RECOVERY_BATCH,
            )
            .await?;
        for mut job in stuck {
            if active.contains(&job.job_id) {
                continue;
            }
            let previous = job.state;
            job.transition_to(JobState::Queued)?;
            if !shared.jobs.update_job(&job, previous).await? {
                tracing::debug!(job_id = %job.job_id, "Job moved during recovery, skipping");
                continue;
            }
            worker::requeue(shared, QueueEntry::new(job.job_id, job.priority)).await;
            tracing::info!(
                job_id = %job.job_id,
                from = %previous,
                attempts = job.attempt_count,
                "Recovered in-flight job"
            );
            shared.observer.record_event(&ObserverEvent::JobRecovered {
                job_id: job.job_id,
                previous_state: previous,
            });
            report.jobs_requeued += 1;
        }

        let queued = shared.jobs.list_jobs(&[JobState::Queued], RECOVERY_BATCH).await?;
        for job in queued {
            shared
                .queue
                .enqueue(QueueEntry::new(job.job_id, job.priority))
                .await?;
            report.queued_reoffered += 1;
        }

        tracing::info!(
            orphans = report.orphans_reaped,
            records = report.records_closed,
            requeued = report.jobs_requeued,
            reoffered = report.queued_reoffered,
            "Recovery complete"
        );
        Ok(report)
    }
}
