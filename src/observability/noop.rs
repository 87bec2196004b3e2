use crate::observability::traits::{Observer, ObserverEvent, ObserverMetric};

/// Observer that discards everything.
pub struct NoopObserver;

impl Observer for NoopObserver {
    #[inline(always)]
    fn record_event(&self, _event: &ObserverEvent) {}

    #[inline(always)]
    fn record_metric(&self, _metric: &ObserverMetric) {}

    fn name(&self) -> &str {
        "noop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_accepts_everything() {
        let obs = NoopObserver;
        obs.record_event(&ObserverEvent::OrphanReaped {
            container_id: "abc".into(),
        });
        obs.record_metric(&ObserverMetric::QueueDepth(3));
        obs.flush();
        assert_eq!(obs.name(), "noop");
    }
}
