//! Tracing-based observer that emits structured log events.
//!
//! Uses the existing `tracing` infrastructure so events appear alongside
//! normal application logs.

use crate::observability::traits::{Observer, ObserverEvent, ObserverMetric};

/// Observer that logs events and metrics via `tracing`.
pub struct LogObserver;

impl Observer for LogObserver {
    #[allow(clippy::cognitive_complexity, clippy::too_many_lines)] // Exhaustive match over event variants
    fn record_event(&self, event: &ObserverEvent) {
        match event {
            ObserverEvent::JobSubmitted {
                job_id,
                agent_id,
                priority,
            } => {
                tracing::info!(job_id = %job_id, agent_id, priority = %priority, "observer: job.submitted");
            }
            ObserverEvent::JobClaimed {
                job_id,
                agent_id,
                attempt,
            } => {
                tracing::info!(job_id = %job_id, agent_id, attempt, "observer: job.claimed");
            }
            ObserverEvent::PolicyDenied {
                job_id,
                agent_id,
                rule,
            } => {
                tracing::warn!(job_id = %job_id, agent_id, rule, "observer: policy.denied");
            }
            ObserverEvent::ContainerLaunched {
                job_id,
                execution_id,
                container_id,
            } => {
                tracing::info!(
                    job_id = %job_id,
                    execution_id = %execution_id,
                    container_id,
                    "observer: container.launched"
                );
            }
            ObserverEvent::LaunchFailed {
                job_id,
                execution_id,
                reason,
            } => {
                tracing::warn!(
                    job_id = %job_id,
                    execution_id = %execution_id,
                    error = reason.as_str(),
                    "observer: container.launch_failed"
                );
            }
            ObserverEvent::ContainerExited {
                job_id,
                execution_id,
                status,
                duration,
            } => {
                tracing::info!(
                    job_id = %job_id,
                    execution_id = %execution_id,
                    status,
                    duration_ms = duration.as_millis() as u64,
                    "observer: container.exited"
                );
            }
            ObserverEvent::ResultCollected {
                job_id,
                execution_id,
                result_ref,
            } => {
                tracing::info!(
                    job_id = %job_id,
                    execution_id = %execution_id,
                    result_ref,
                    "observer: result.collected"
                );
            }
            ObserverEvent::ContainerCleanedUp {
                job_id,
                execution_id,
            } => {
                tracing::debug!(
                    job_id = %job_id,
                    execution_id = %execution_id,
                    "observer: container.cleaned_up"
                );
            }
            ObserverEvent::RetryScheduled {
                job_id,
                attempt,
                kind,
            } => {
                tracing::info!(job_id = %job_id, attempt, kind = %kind, "observer: job.retry");
            }
            ObserverEvent::JobFinished {
                job_id,
                state,
                attempts,
                failure,
            } => {
                tracing::info!(
                    job_id = %job_id,
                    state = %state,
                    attempts,
                    failure = failure.as_deref().unwrap_or(""),
                    "observer: job.finished"
                );
            }
            ObserverEvent::JobRecovered {
                job_id,
                previous_state,
            } => {
                tracing::info!(
                    job_id = %job_id,
                    previous_state = %previous_state,
                    "observer: job.recovered"
                );
            }
            ObserverEvent::OrphanReaped { container_id } => {
                tracing::info!(container_id, "observer: container.orphan_reaped");
            }
            ObserverEvent::QueueUnavailable {
                consecutive_failures,
                backoff,
            } => {
                tracing::warn!(
                    consecutive_failures,
                    backoff_ms = backoff.as_millis() as u64,
                    "observer: queue.unavailable"
                );
            }
            ObserverEvent::Error { component, message } => {
                tracing::warn!(component, error = message.as_str(), "observer: error");
            }
        }
    }

    #[allow(clippy::cognitive_complexity)] // tracing macros inflate complexity
    fn record_metric(&self, metric: &ObserverMetric) {
        match metric {
            ObserverMetric::ExecutionLatency(d) => {
                tracing::debug!(
                    latency_ms = d.as_millis() as u64,
                    "observer: metric.execution_latency"
                );
            }
            ObserverMetric::ActiveWorkers(n) => {
                tracing::debug!(active_workers = n, "observer: metric.active_workers");
            }
            ObserverMetric::ActiveContainers(n) => {
                tracing::debug!(active_containers = n, "observer: metric.active_containers");
            }
            ObserverMetric::QueueDepth(n) => {
                tracing::debug!(queue_depth = n, "observer: metric.queue_depth");
            }
        }
    }

    fn name(&self) -> &str {
        "log"
    }
}
