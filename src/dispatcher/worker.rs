//! One worker task: lease, claim, run, settle.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::ResultRef;
use crate::dispatcher::Shared;
use crate::dispatcher::retry::{AttemptFailure, RetryDecision, backoff_delay};
use crate::error::{ContainerError, Error, LaunchFailureKind, PolicyViolation, QueueError};
use crate::jobs::{FailureKind, Job, JobFailure, JobState};
use crate::observability::{ObserverEvent, ObserverMetric};
use crate::policy::{NetworkDecision, PolicyRule};
use crate::queue::{Lease, QueueEntry};
use crate::sandbox::{ContainerHandle, ExitStatus, LaunchRequest};

/// Pull from the queue until `shutdown` fires.
///
/// Shutdown stops new dequeues only. A job already leased runs to
/// completion unless the dispatcher aborts the task.
pub(super) async fn run(shared: Arc<Shared>, shutdown: CancellationToken, index: usize) {
    tracing::debug!(worker = index, "Worker started");
    let mut consecutive_failures: u32 = 0;

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = shared.queue.dequeue_next(shared.poll_interval) => next,
        };

        match next {
            Ok(Some(lease)) => {
                consecutive_failures = 0;
                process(&shared, lease, &shutdown).await;
            }
            Ok(None) => consecutive_failures = 0,
            Err(e) => {
                let backoff = backoff_delay(
                    shared.config.queue_backoff_base,
                    shared.config.queue_backoff_max,
                    consecutive_failures,
                );
                consecutive_failures = consecutive_failures.saturating_add(1);
                tracing::warn!(
                    worker = index,
                    error = %e,
                    consecutive_failures,
                    backoff_ms = backoff.as_millis() as u64,
                    "Queue unavailable, backing off"
                );
                shared.observer.record_event(&ObserverEvent::QueueUnavailable {
                    consecutive_failures,
                    backoff,
                });
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
    tracing::debug!(worker = index, "Worker stopped");
}

async fn process(shared: &Arc<Shared>, lease: Lease, shutdown: &CancellationToken) {
    let job_id = lease.job_id;
    let cancel = CancellationToken::new();
    {
        let mut active = shared.active_jobs.lock().await;
        if active.contains_key(&job_id) {
            tracing::debug!(
                job_id = %job_id,
                delivery_count = lease.delivery_count,
                "Duplicate delivery of an active job, acking"
            );
            drop(active);
            ack(shared, job_id).await;
            return;
        }
        active.insert(job_id, cancel.clone());
    }
    let workers = shared.active_workers.fetch_add(1, Ordering::SeqCst) + 1;
    shared
        .observer
        .record_metric(&ObserverMetric::ActiveWorkers(workers));

    let heartbeat = CancellationToken::new();
    let heartbeat_guard = heartbeat.clone().drop_guard();
    tokio::spawn(watch_lease(
        Arc::clone(shared),
        job_id,
        cancel.clone(),
        heartbeat,
    ));

    let requeue_entry = handle_lease(shared, job_id, &cancel, shutdown).await;

    drop(heartbeat_guard);
    shared.active_jobs.lock().await.remove(&job_id);
    let workers = shared.active_workers.fetch_sub(1, Ordering::SeqCst) - 1;
    shared
        .observer
        .record_metric(&ObserverMetric::ActiveWorkers(workers));

    // Only after the job left the active set, or the redelivery would be
    // taken for a duplicate.
    if let Some(entry) = requeue_entry {
        requeue(shared, entry).await;
    }
}

/// Keep the lease alive while the job runs, and fire `cancel` once the
/// stored job shows a cancellation made by another process. Stops when
/// `stop` fires or is dropped.
async fn watch_lease(
    shared: Arc<Shared>,
    job_id: Uuid,
    cancel: CancellationToken,
    stop: CancellationToken,
) {
    let extend_every = (shared.lease_timeout / 3).max(Duration::from_millis(100));
    let tick = shared
        .poll_interval
        .clamp(Duration::from_millis(20), extend_every);
    let mut last_extended = Instant::now();
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(tick) => {}
        }
        if last_extended.elapsed() >= extend_every {
            if let Err(e) = shared.queue.extend_lease(job_id).await {
                tracing::debug!(job_id = %job_id, error = %e, "Lease extension failed");
            }
            last_extended = Instant::now();
        }
        if cancel.is_cancelled() {
            continue;
        }
        match shared.jobs.get_job(job_id).await {
            Ok(Some(job)) if job.state == JobState::Cancelled => {
                tracing::info!(job_id = %job_id, "Job was cancelled elsewhere, stopping it");
                cancel.cancel();
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(job_id = %job_id, error = %e, "Cancellation check failed");
            }
        }
    }
}

/// Drive one delivery. Returns the entry to hand back to the queue when
/// the job was scheduled for another attempt.
async fn handle_lease(
    shared: &Shared,
    job_id: Uuid,
    cancel: &CancellationToken,
    shutdown: &CancellationToken,
) -> Option<QueueEntry> {
    let job = match shared.jobs.get_job(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            tracing::warn!(job_id = %job_id, "Queue entry for unknown job, dropping");
            ack(shared, job_id).await;
            return None;
        }
        Err(e) => {
            // The lease lapses and the entry is redelivered.
            tracing::error!(job_id = %job_id, error = %e, "Failed to load job");
            return None;
        }
    };

    if job.state != JobState::Queued {
        tracing::debug!(job_id = %job_id, state = %job.state, "Job no longer queued, acking delivery");
        ack(shared, job_id).await;
        return None;
    }

    if cancel.is_cancelled() {
        let mut job = job;
        job.failure = Some(JobFailure::new(FailureKind::Cancelled, "cancelled by request"));
        finish(shared, job, JobState::Cancelled).await;
        return None;
    }

    if job.attempt_count >= shared.retry.max_attempts {
        let mut job = job;
        let attempts = job.attempt_count;
        if job.failure.is_none() {
            job.failure = Some(JobFailure::new(
                FailureKind::RuntimeCrash,
                format!("attempt budget exhausted after {attempts} attempts"),
            ));
        }
        tracing::warn!(job_id = %job_id, attempts, "Attempt budget exhausted, failing without launch");
        finish(shared, job, JobState::Failed).await;
        return None;
    }

    let job = claim(shared, job).await?;
    let outcome = attempt(shared, &job, cancel).await;
    settle(shared, job, outcome, shutdown).await
}

/// `queued → running`, consuming one attempt. Only one claimant wins.
async fn claim(shared: &Shared, mut job: Job) -> Option<Job> {
    let job_id = job.job_id;
    if let Err(e) = job.transition_to(JobState::Running) {
        tracing::warn!(job_id = %job_id, error = %e, "Cannot claim job");
        ack(shared, job_id).await;
        return None;
    }
    job.attempt_count += 1;

    match shared.jobs.update_job(&job, JobState::Queued).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(job_id = %job_id, "Lost claim race, acking delivery");
            ack(shared, job_id).await;
            return None;
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Failed to persist claim");
            return None;
        }
    }

    tracing::info!(
        job_id = %job_id,
        agent_id = %job.agent_id,
        attempt = job.attempt_count,
        "Job claimed"
    );
    shared.observer.record_event(&ObserverEvent::JobClaimed {
        job_id,
        agent_id: job.agent_id.clone(),
        attempt: job.attempt_count,
    });
    Some(job)
}

/// Resolve, authorize, launch, supervise and collect. The container is
/// cleaned up on every path that launched one.
async fn attempt(
    shared: &Shared,
    job: &Job,
    cancel: &CancellationToken,
) -> Result<ResultRef, AttemptFailure> {
    let agent = shared
        .registry
        .get(&job.agent_id)
        .await
        .map_err(|e| AttemptFailure::new(FailureKind::AgentNotFound, e.to_string()))?;

    let payload = shared
        .contexts
        .read_context(&job.context_ref)
        .await
        .map_err(|e| AttemptFailure::new(FailureKind::ContextInvalid, e.to_string()))?;

    let decision = match shared.gate.authorize(&agent).await {
        Ok(decision) => decision,
        Err(violation) => return Err(denied(shared, job, violation)),
    };
    if let Some(callback) = payload.callback_url()
        && let NetworkDecision::Deny { reason } = decision.egress.check_url(callback)
    {
        let violation = PolicyViolation::new(
            PolicyRule::EgressDenied,
            format!("callback_url {callback}: {reason}"),
        );
        return Err(denied(shared, job, violation));
    }

    let request = LaunchRequest {
        job_id: job.job_id,
        attempt: job.attempt_count,
        agent: &agent,
        payload: &payload,
        decision: &decision,
    };
    let handle = shared
        .containers
        .launch(request, cancel)
        .await
        .map_err(|e| match e {
            ContainerError::Cancelled { .. } => {
                AttemptFailure::new(FailureKind::Cancelled, "cancelled before launch")
            }
            ContainerError::Launch { kind, reason, .. } => AttemptFailure::launch(kind, reason),
            other => AttemptFailure::launch(LaunchFailureKind::Runtime, other.to_string()),
        })?;

    let outcome = supervise(shared, &handle, decision.limits.timeout(), cancel).await;

    if let Err(e) = shared.containers.cleanup(&handle).await {
        tracing::warn!(job_id = %job.job_id, error = %e, "Container cleanup failed");
    }
    outcome
}

fn denied(shared: &Shared, job: &Job, violation: PolicyViolation) -> AttemptFailure {
    tracing::warn!(
        job_id = %job.job_id,
        agent_id = %job.agent_id,
        rule = %violation.rule,
        detail = %violation.detail,
        "Launch refused by policy"
    );
    shared.observer.record_event(&ObserverEvent::PolicyDenied {
        job_id: job.job_id,
        agent_id: job.agent_id.clone(),
        rule: violation.rule.to_string(),
    });
    AttemptFailure::new(FailureKind::PolicyViolation, violation.to_string())
}

async fn supervise(
    shared: &Shared,
    handle: &ContainerHandle,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ResultRef, AttemptFailure> {
    let record = shared
        .containers
        .await_exit(handle, timeout, cancel)
        .await
        .map_err(|e| AttemptFailure::new(FailureKind::RuntimeCrash, e.to_string()))?;

    match record.exit_status {
        Some(ExitStatus::Exited { code: 0 }) => shared
            .containers
            .collect_result(handle)
            .await
            .map_err(result_failure),
        Some(ExitStatus::Exited { code }) => Err(AttemptFailure::new(
            FailureKind::RuntimeCrash,
            format!("agent exited with code {code}"),
        )),
        Some(ExitStatus::TimedOut) => Err(AttemptFailure::new(
            FailureKind::TimedOut,
            format!("exceeded {}s", timeout.as_secs()),
        )),
        Some(ExitStatus::Cancelled) => Err(AttemptFailure::new(
            FailureKind::Cancelled,
            "cancelled by request",
        )),
        Some(ExitStatus::LaunchFailed { reason }) => {
            Err(AttemptFailure::launch(LaunchFailureKind::Runtime, reason))
        }
        Some(ExitStatus::Lost) | None => Err(AttemptFailure::new(
            FailureKind::RuntimeCrash,
            "container was lost",
        )),
    }
}

/// Only a bad result document is charged to the agent. Failing to read or
/// store a good one is a host-side fault and stays retryable.
fn result_failure(e: ContainerError) -> AttemptFailure {
    match e {
        ContainerError::ResultInvalid { reason, .. } => {
            AttemptFailure::new(FailureKind::ResultInvalid, reason)
        }
        other => AttemptFailure::new(
            FailureKind::RuntimeCrash,
            format!("collecting result: {other}"),
        ),
    }
}

async fn settle(
    shared: &Shared,
    mut job: Job,
    outcome: Result<ResultRef, AttemptFailure>,
    shutdown: &CancellationToken,
) -> Option<QueueEntry> {
    let failure = match outcome {
        Ok(result_ref) => {
            job.result_ref = Some(result_ref);
            job.failure = None;
            finish(shared, job, JobState::Succeeded).await;
            return None;
        }
        Err(failure) => failure,
    };

    let attempt = job.attempt_count;
    match shared.retry.decide(&failure, attempt) {
        RetryDecision::Retry => return retry(shared, job, failure, shutdown).await,
        RetryDecision::Fail => {
            tracing::warn!(
                job_id = %job.job_id,
                attempt,
                failure = %failure.failure,
                "Attempt failed, not retrying"
            );
            let timed_out = failure.kind() == FailureKind::TimedOut;
            job.failure = Some(failure.failure);
            if timed_out && !advance(shared, &mut job, JobState::TimedOut).await {
                return None;
            }
            finish(shared, job, JobState::Failed).await;
        }
        RetryDecision::Cancel => {
            job.failure = Some(failure.failure);
            finish(shared, job, JobState::Cancelled).await;
        }
    }
    None
}

/// Move through `timed_out`/`retrying` back to `queued` after a backoff.
async fn retry(
    shared: &Shared,
    mut job: Job,
    failure: AttemptFailure,
    shutdown: &CancellationToken,
) -> Option<QueueEntry> {
    let job_id = job.job_id;
    let attempt = job.attempt_count;
    let kind = failure.kind();

    if kind == FailureKind::TimedOut && !advance(shared, &mut job, JobState::TimedOut).await {
        return None;
    }
    if !advance(shared, &mut job, JobState::Retrying).await {
        return None;
    }

    let delay = backoff_delay(
        shared.config.queue_backoff_base,
        shared.config.queue_backoff_max,
        attempt.saturating_sub(1),
    );
    tracing::info!(
        job_id = %job_id,
        attempt,
        failure = %failure.failure,
        delay_ms = delay.as_millis() as u64,
        "Attempt failed, scheduling retry"
    );
    shared.observer.record_event(&ObserverEvent::RetryScheduled {
        job_id,
        attempt,
        kind,
    });
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }

    if !advance(shared, &mut job, JobState::Queued).await {
        return None;
    }
    Some(QueueEntry::new(job_id, job.priority))
}

/// Persist one conditional step. `false` means the step was not stored and
/// the caller should stop.
async fn advance(shared: &Shared, job: &mut Job, target: JobState) -> bool {
    let expected = job.state;
    match step(shared, job, target).await {
        Ok(true) => true,
        Ok(false) => {
            tracing::warn!(
                job_id = %job.job_id,
                from = %expected,
                to = %target,
                "Job changed underneath its worker"
            );
            false
        }
        Err(e) => {
            tracing::error!(job_id = %job.job_id, to = %target, error = %e, "Failed to persist job transition");
            shared.observer.record_event(&ObserverEvent::Error {
                component: "dispatcher".to_string(),
                message: e.to_string(),
            });
            false
        }
    }
}

async fn step(shared: &Shared, job: &mut Job, target: JobState) -> Result<bool, Error> {
    let expected = job.state;
    job.transition_to(target)?;
    Ok(shared.jobs.update_job(job, expected).await?)
}

/// Record a terminal state and drop the queue entry.
async fn finish(shared: &Shared, mut job: Job, target: JobState) {
    let job_id = job.job_id;
    let stored = advance(shared, &mut job, target).await;
    ack(shared, job_id).await;
    if !stored {
        return;
    }

    let failure = job.failure.as_ref().map(ToString::to_string);
    match target {
        JobState::Succeeded => tracing::info!(
            job_id = %job_id,
            attempts = job.attempt_count,
            "Job succeeded"
        ),
        _ => tracing::info!(
            job_id = %job_id,
            state = %target,
            attempts = job.attempt_count,
            failure = failure.as_deref().unwrap_or_default(),
            "Job finished"
        ),
    }
    shared.observer.record_event(&ObserverEvent::JobFinished {
        job_id,
        state: target,
        attempts: job.attempt_count,
        failure,
    });
}

async fn ack(shared: &Shared, job_id: Uuid) {
    match shared.queue.ack(job_id).await {
        Ok(()) => {}
        Err(QueueError::LeaseNotFound { .. }) => {
            tracing::debug!(job_id = %job_id, "Queue entry already gone");
        }
        Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Failed to ack queue entry"),
    }
}

/// Give the entry back for immediate redelivery, re-adding it if the lease
/// was lost in the meantime.
pub(super) async fn requeue(shared: &Shared, entry: QueueEntry) {
    let job_id = entry.job_id;
    let result = match shared.queue.nack(job_id, true).await {
        Err(QueueError::LeaseNotFound { .. }) => shared.queue.enqueue(entry).await.map(|_| ()),
        other => other,
    };
    if let Err(e) = result {
        // The job stays `queued` in the store; recovery re-enqueues it.
        tracing::error!(job_id = %job_id, error = %e, "Failed to requeue job");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::agents::{AgentDescriptor, Integration, ResourceLimits};
    use crate::config::DispatcherConfig;
    use crate::dispatcher::tests::harness;
    use crate::jobs::{JobState, JobStatus};
    use crate::queue::JobQueue;
    use crate::sandbox::testing::{RuntimeCall, Script};

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig {
            workers: 1,
            queue_backoff_base: Duration::ZERO,
            queue_backoff_max: Duration::ZERO,
            shutdown_grace: Duration::from_secs(5),
            ..DispatcherConfig::default()
        }
    }

    fn context() -> serde_json::Value {
        json!({ "schema_version": "1", "user_id": "u-1", "messages": [] })
    }

    async fn wait_terminal(
        dispatcher: &crate::dispatcher::Dispatcher,
        job_id: uuid::Uuid,
    ) -> JobStatus {
        for _ in 0..500 {
            let status = dispatcher.get_job_status(job_id).await.unwrap();
            if status.state.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} did not finish");
    }

    #[tokio::test]
    async fn successful_run_records_result() {
        let h = harness(fast_config()).await;
        h.dispatcher.start().await.unwrap();
        let job_id = h.dispatcher.submit_job("echo", context()).await.unwrap();

        let status = wait_terminal(&h.dispatcher, job_id).await;
        h.dispatcher.shutdown().await;

        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(status.attempt_count, 1);
        assert!(status.result_ref.is_some());
        assert_eq!(status.error, None);
        assert_eq!(h.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn crash_is_retried_then_succeeds() {
        let h = harness(fast_config()).await;
        h.runtime
            .push_script("agent-runtime:latest", Script::crash(1))
            .await;
        h.dispatcher.start().await.unwrap();
        let job_id = h.dispatcher.submit_job("echo", context()).await.unwrap();

        let status = wait_terminal(&h.dispatcher, job_id).await;
        h.dispatcher.shutdown().await;

        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(status.attempt_count, 2);
    }

    #[tokio::test]
    async fn policy_denial_consumes_one_attempt_and_never_launches() {
        let h = harness(fast_config()).await;
        h.registry
            .register(
                AgentDescriptor::new("scraper", "agent-runtime:latest")
                    .with_integration(Integration::HttpEgress),
            )
            .await
            .unwrap();
        h.dispatcher.start().await.unwrap();
        let job_id = h.dispatcher.submit_job("scraper", context()).await.unwrap();

        let status = wait_terminal(&h.dispatcher, job_id).await;
        h.dispatcher.shutdown().await;

        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.attempt_count, 1);
        assert!(status.error.unwrap().starts_with("PolicyViolation"));
        let launched = h
            .runtime
            .calls()
            .await
            .into_iter()
            .any(|c| matches!(c, RuntimeCall::Create { .. }));
        assert!(!launched);
    }

    #[tokio::test]
    async fn unknown_agent_fails_without_retry() {
        let h = harness(fast_config()).await;
        h.dispatcher.start().await.unwrap();
        let job_id = h.dispatcher.submit_job("ghost", context()).await.unwrap();

        let status = wait_terminal(&h.dispatcher, job_id).await;
        h.dispatcher.shutdown().await;

        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.attempt_count, 1);
        assert!(status.error.unwrap().starts_with("AgentNotFound"));
    }

    #[test]
    fn only_bad_documents_count_as_invalid_results() {
        let invalid = super::result_failure(crate::error::ContainerError::ResultInvalid {
            job_id: uuid::Uuid::nil(),
            reason: "not json".into(),
        });
        assert_eq!(invalid.kind(), crate::jobs::FailureKind::ResultInvalid);
        assert_eq!(invalid.failure.reason, "not json");

        let disk = super::result_failure(crate::error::ContainerError::Io(
            std::io::Error::other("no space left on device"),
        ));
        assert_eq!(disk.kind(), crate::jobs::FailureKind::RuntimeCrash);
        assert!(disk.failure.reason.contains("no space left"));

        let store = super::result_failure(crate::error::ContainerError::Store(
            crate::error::DatabaseError::Query("database is locked".into()),
        ));
        assert_eq!(store.kind(), crate::jobs::FailureKind::RuntimeCrash);
    }

    #[tokio::test]
    async fn unwritable_result_store_is_retried() {
        let h = harness(fast_config()).await;
        let job_id = h.dispatcher.submit_job("echo", context()).await.unwrap();
        // A file where the job's result directory belongs.
        let results = h._dir.path().join("data").join("results");
        std::fs::create_dir_all(&results).unwrap();
        std::fs::write(results.join(job_id.to_string()), b"in the way").unwrap();
        h.dispatcher.start().await.unwrap();

        let status = wait_terminal(&h.dispatcher, job_id).await;
        h.dispatcher.shutdown().await;

        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.attempt_count, 3);
        assert!(status.error.unwrap().starts_with("RuntimeCrash"));
        assert_eq!(h.runtime.live_count().await, 0);
    }

    #[tokio::test]
    async fn running_job_can_be_cancelled() {
        let h = harness(fast_config()).await;
        h.registry
            .register(
                AgentDescriptor::new("sleeper", "sleeper:latest").with_limits(ResourceLimits {
                    timeout_secs: 60,
                    ..ResourceLimits::default()
                }),
            )
            .await
            .unwrap();
        h.runtime.push_script("sleeper:latest", Script::Hang).await;
        h.dispatcher.start().await.unwrap();
        let job_id = h.dispatcher.submit_job("sleeper", context()).await.unwrap();

        for _ in 0..500 {
            if h.runtime.live_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        h.dispatcher.cancel_job(job_id).await.unwrap();

        let status = wait_terminal(&h.dispatcher, job_id).await;
        h.dispatcher.shutdown().await;

        assert_eq!(status.state, JobState::Cancelled);
        assert_eq!(h.runtime.live_count().await, 0);
        let calls = h.runtime.calls().await;
        assert!(calls.iter().any(|c| matches!(c, RuntimeCall::Kill(_))));
        assert!(calls.iter().any(|c| matches!(c, RuntimeCall::Remove(_))));
    }
}
