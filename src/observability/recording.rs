//! Observer that keeps everything it is given, for assertions in unit tests.
//!
//! Clones share one capture buffer, so a test can hand a clone to the code
//! under test and inspect the original afterwards.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::observability::traits::{Observer, ObserverEvent, ObserverMetric};

#[derive(Default)]
struct Captured {
    events: Mutex<Vec<ObserverEvent>>,
    metrics: Mutex<Vec<ObserverMetric>>,
    flushes: AtomicU32,
}

#[derive(Clone, Default)]
pub struct RecordingObserver {
    captured: Arc<Captured>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObserverEvent> {
        self.captured.events.lock().unwrap().clone()
    }

    pub fn metrics(&self) -> Vec<ObserverMetric> {
        self.captured.metrics.lock().unwrap().clone()
    }

    pub fn flushes(&self) -> u32 {
        self.captured.flushes.load(Ordering::Relaxed)
    }

    /// Number of captured events matching `pred`.
    pub fn count(&self, pred: impl Fn(&ObserverEvent) -> bool) -> usize {
        self.captured
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| pred(e))
            .count()
    }
}

impl Observer for RecordingObserver {
    fn record_event(&self, event: &ObserverEvent) {
        self.captured.events.lock().unwrap().push(event.clone());
    }

    fn record_metric(&self, metric: &ObserverMetric) {
        self.captured.metrics.lock().unwrap().push(metric.clone());
    }

    fn flush(&self) {
        self.captured.flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn name(&self) -> &str {
        "recording"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;

    #[test]
    fn clones_share_one_buffer() {
        let obs = RecordingObserver::new();
        let handed_out = obs.clone();
        let job_id = Uuid::new_v4();

        handed_out.record_event(&ObserverEvent::JobClaimed {
            job_id,
            agent_id: "echo".into(),
            attempt: 1,
        });
        handed_out.record_event(&ObserverEvent::ContainerCleanedUp {
            job_id,
            execution_id: Uuid::new_v4(),
        });
        handed_out.record_metric(&ObserverMetric::ExecutionLatency(Duration::from_millis(100)));
        handed_out.flush();

        let events = obs.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ObserverEvent::JobClaimed { .. }));
        assert!(matches!(events[1], ObserverEvent::ContainerCleanedUp { .. }));
        assert_eq!(obs.metrics().len(), 1);
        assert_eq!(obs.flushes(), 1);
    }

    #[test]
    fn counts_matching_events() {
        let obs = RecordingObserver::new();
        for _ in 0..3 {
            obs.record_event(&ObserverEvent::OrphanReaped {
                container_id: "x".into(),
            });
        }
        assert_eq!(obs.count(|e| matches!(e, ObserverEvent::OrphanReaped { .. })), 3);
        assert_eq!(obs.count(|e| matches!(e, ObserverEvent::JobClaimed { .. })), 0);
    }
}
