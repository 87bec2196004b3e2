//! Failure classification and backoff.
//!
//! Transient failures (`QueueUnavailable`, `TimedOut`, `RuntimeCrash`, and
//! launch errors caused by the host rather than the agent) are retried until
//! the attempt budget runs out. Everything else fails the job after one
//! attempt. `Cancelled` is never retried.

use std::time::Duration;

use rand::Rng;

use crate::config::DispatcherConfig;
use crate::error::LaunchFailureKind;
use crate::jobs::{FailureKind, JobFailure};

/// Why one attempt did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub failure: JobFailure,
    /// Set for `LaunchError`; decides whether the launch is worth repeating.
    pub launch: Option<LaunchFailureKind>,
}

impl AttemptFailure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            failure: JobFailure::new(kind, reason),
            launch: None,
        }
    }

    pub fn launch(kind: LaunchFailureKind, reason: impl Into<String>) -> Self {
        Self {
            failure: JobFailure::new(FailureKind::LaunchError, reason),
            launch: Some(kind),
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.failure.kind
    }
}

/// What to do with a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Fail,
    Cancel,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub result_invalid_retries: u32,
    pub retry_image_pull: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            result_invalid_retries: config.result_invalid_retries,
            retry_image_pull: config.retry_image_pull,
        }
    }

    /// Whether this kind of failure is worth another attempt at all.
    ///
    /// `attempt` is the 1-based attempt that just failed. `ResultInvalid`
    /// is transient only for the first `result_invalid_retries` attempts.
    pub fn is_transient(&self, failure: &AttemptFailure, attempt: u32) -> bool {
        match failure.kind() {
            FailureKind::QueueUnavailable | FailureKind::TimedOut | FailureKind::RuntimeCrash => {
                true
            }
            FailureKind::LaunchError => match failure.launch {
                Some(LaunchFailureKind::ResourceExhausted) | Some(LaunchFailureKind::Runtime) => {
                    true
                }
                Some(LaunchFailureKind::ImagePull) => self.retry_image_pull,
                Some(LaunchFailureKind::InvalidSpec) | None => false,
            },
            FailureKind::ResultInvalid => attempt <= self.result_invalid_retries,
            FailureKind::PolicyViolation
            | FailureKind::AgentNotFound
            | FailureKind::ContextInvalid
            | FailureKind::Cancelled => false,
        }
    }

    pub fn decide(&self, failure: &AttemptFailure, attempt: u32) -> RetryDecision {
        if failure.kind() == FailureKind::Cancelled {
            RetryDecision::Cancel
        } else if attempt < self.max_attempts && self.is_transient(failure, attempt) {
            RetryDecision::Retry
        } else {
            RetryDecision::Fail
        }
    }
}

/// Exponential backoff with 25% jitter, capped at `max`.
///
/// `base * 2^attempt`, then uniform jitter in [-25%, +25%]. A floor of 100ms
/// prevents tight retry loops.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let exp_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    let capped_ms = exp_ms.min(max.as_millis() as u64);

    let jitter_range = capped_ms / 4;
    let jitter = if jitter_range > 0 {
        let offset = rand::thread_rng().gen_range(0..=jitter_range.saturating_mul(2));
        offset as i64 - jitter_range as i64
    } else {
        0
    };
    let delay_ms = (capped_ms as i64 + jitter).max(100) as u64;
    Duration::from_millis(delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            result_invalid_retries: 0,
            retry_image_pull: true,
        }
    }

    #[test]
    fn transient_failures_retry_until_budget() {
        let timeout = AttemptFailure::new(FailureKind::TimedOut, "exceeded 30s");
        assert_eq!(policy().decide(&timeout, 1), RetryDecision::Retry);
        assert_eq!(policy().decide(&timeout, 2), RetryDecision::Retry);
        assert_eq!(policy().decide(&timeout, 3), RetryDecision::Fail);
    }

    #[test]
    fn fatal_failures_never_retry() {
        for kind in [
            FailureKind::PolicyViolation,
            FailureKind::AgentNotFound,
            FailureKind::ContextInvalid,
            FailureKind::ResultInvalid,
        ] {
            let failure = AttemptFailure::new(kind, "nope");
            assert_eq!(policy().decide(&failure, 1), RetryDecision::Fail, "{kind}");
        }
    }

    #[test]
    fn cancellation_is_terminal() {
        let failure = AttemptFailure::new(FailureKind::Cancelled, "by request");
        assert_eq!(policy().decide(&failure, 1), RetryDecision::Cancel);
    }

    #[test]
    fn launch_failures_depend_on_cause() {
        let p = policy();
        let exhausted = AttemptFailure::launch(LaunchFailureKind::ResourceExhausted, "oom");
        let invalid = AttemptFailure::launch(LaunchFailureKind::InvalidSpec, "bad mount");
        let pull = AttemptFailure::launch(LaunchFailureKind::ImagePull, "manifest unknown");
        assert!(p.is_transient(&exhausted, 1));
        assert!(!p.is_transient(&invalid, 1));
        assert!(p.is_transient(&pull, 1));

        let strict = RetryPolicy {
            retry_image_pull: false,
            ..p
        };
        assert!(!strict.is_transient(&pull, 1));
    }

    #[test]
    fn result_invalid_retries_are_configurable() {
        let p = RetryPolicy {
            result_invalid_retries: 1,
            ..policy()
        };
        let failure = AttemptFailure::new(FailureKind::ResultInvalid, "malformed");
        assert_eq!(p.decide(&failure, 1), RetryDecision::Retry);
        assert_eq!(p.decide(&failure, 2), RetryDecision::Fail);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let base = Duration::from_millis(1000);
        let max = Duration::from_secs(4);
        let first = backoff_delay(base, max, 0);
        assert!(first >= Duration::from_millis(750) && first <= Duration::from_millis(1250));
        let capped = backoff_delay(base, max, 10);
        assert!(capped <= Duration::from_millis(5000));
        assert!(backoff_delay(Duration::ZERO, max, 3) >= Duration::from_millis(100));
    }
}
