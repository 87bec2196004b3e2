//! Dispatcher health snapshot.

use std::sync::atomic::Ordering;

use serde::Serialize;

use crate::dispatcher::Dispatcher;
use crate::error::HealthError;
use crate::observability::ObserverMetric;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub queue_reachable: bool,
    pub runtime_reachable: bool,
    pub active_workers: u64,
    pub active_containers: u64,
    /// Unknown when the queue is unreachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<u64>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.queue_reachable && self.runtime_reachable
    }
}

impl Dispatcher {
    /// Probe the queue and the container runtime.
    ///
    /// Bounded by `health_check_timeout`; a probe that takes longer yields
    /// [`HealthError::Timeout`] and the caller should report unhealthy.
    pub async fn health_check(&self) -> Result<HealthReport, HealthError> {
        let after = self.shared.config.health_check_timeout;
        tokio::time::timeout(after, self.probe())
            .await
            .map_err(|_| HealthError::Timeout { after })
    }

    async fn probe(&self) -> HealthReport {
        let shared = &self.shared;
        let (queue, runtime) = tokio::join!(
            shared.queue.ping(),
            shared.containers.runtime().ping()
        );
        if let Err(ref e) = queue {
            tracing::debug!(error = %e, "Queue health probe failed");
        }
        if let Err(ref e) = runtime {
            tracing::debug!(error = %e, "Runtime health probe failed");
        }

        let queue_depth = if queue.is_ok() {
            shared.queue.depth().await.ok()
        } else {
            None
        };
        let report = HealthReport {
            queue_reachable: queue.is_ok(),
            runtime_reachable: runtime.is_ok(),
            active_workers: shared.active_workers.load(Ordering::SeqCst),
            active_containers: shared.containers.active_containers().await as u64,
            queue_depth,
        };
        if let Some(depth) = report.queue_depth {
            shared.observer.record_metric(&ObserverMetric::QueueDepth(depth));
        }
        report
    }
}
