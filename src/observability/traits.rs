//! Core observer trait and event/metric types.

use std::time::Duration;

use uuid::Uuid;

use crate::jobs::{FailureKind, JobState, Priority};

/// Provider-agnostic observer for dispatch lifecycle events and metrics.
///
/// The dispatcher and container manager record events at key lifecycle
/// points and the observer decides what to do with them.
///
/// Thread-safe and cheaply shareable behind `Arc<dyn Observer>`.
pub trait Observer: Send + Sync {
    /// Record a discrete lifecycle event.
    fn record_event(&self, event: &ObserverEvent);

    /// Record a numeric metric sample.
    fn record_metric(&self, metric: &ObserverMetric);

    /// Flush any buffered data. No-op by default.
    fn flush(&self) {}

    /// Human-readable backend name (e.g. "noop", "log").
    fn name(&self) -> &str;
}

/// Discrete lifecycle events.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    JobSubmitted {
        job_id: Uuid,
        agent_id: String,
        priority: Priority,
    },

    /// A worker moved the job to `running` and consumed an attempt.
    JobClaimed {
        job_id: Uuid,
        agent_id: String,
        attempt: u32,
    },

    PolicyDenied {
        job_id: Uuid,
        agent_id: String,
        rule: String,
    },

    ContainerLaunched {
        job_id: Uuid,
        execution_id: Uuid,
        container_id: String,
    },

    LaunchFailed {
        job_id: Uuid,
        execution_id: Uuid,
        reason: String,
    },

    ContainerExited {
        job_id: Uuid,
        execution_id: Uuid,
        /// Rendered exit status ("exit 0", "timed out", ...).
        status: String,
        duration: Duration,
    },

    ResultCollected {
        job_id: Uuid,
        execution_id: Uuid,
        result_ref: String,
    },

    ContainerCleanedUp {
        job_id: Uuid,
        execution_id: Uuid,
    },

    RetryScheduled {
        job_id: Uuid,
        attempt: u32,
        kind: FailureKind,
    },

    JobFinished {
        job_id: Uuid,
        state: JobState,
        attempts: u32,
        failure: Option<String>,
    },

    /// Crash recovery put an in-flight job back on the queue.
    JobRecovered {
        job_id: Uuid,
        previous_state: JobState,
    },

    /// Crash recovery removed a container nobody owns any more.
    OrphanReaped { container_id: String },

    QueueUnavailable {
        consecutive_failures: u32,
        backoff: Duration,
    },

    /// An error occurred in a component.
    Error { component: String, message: String },
}

/// Numeric metric samples.
#[derive(Debug, Clone)]
pub enum ObserverMetric {
    /// Wall-clock time of one container execution (histogram-style).
    ExecutionLatency(Duration),
    /// Workers currently processing a job (gauge).
    ActiveWorkers(u64),
    /// Containers currently holding an execution slot (gauge).
    ActiveContainers(u64),
    /// Jobs waiting in the queue (gauge).
    QueueDepth(u64),
}
