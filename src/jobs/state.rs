//! Job state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a submitted job.
///
/// ```text
/// queued -> running -> { succeeded, failed, timed_out, retrying, cancelled }
/// timed_out -> { retrying, failed }
/// retrying -> queued
/// ```
///
/// `succeeded`, `failed` and `cancelled` are terminal. `timed_out` and
/// `retrying` are intermediate and only record why a retry is happening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    TimedOut,
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Queued,
        JobState::Running,
        JobState::TimedOut,
        JobState::Retrying,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::TimedOut => "timed_out",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// States a crashed dispatcher can leave behind mid-flight.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Running | Self::TimedOut | Self::Retrying)
    }

    /// Whether `self -> target` is a legal edge.
    ///
    /// The `running/timed_out/retrying -> queued` edges exist only for crash
    /// recovery; the normal retry path goes through `retrying`.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Retrying)
                | (Running, Cancelled)
                | (Running, Queued)
                | (TimedOut, Retrying)
                | (TimedOut, Failed)
                | (TimedOut, Cancelled)
                | (TimedOut, Queued)
                | (Retrying, Queued)
                | (Retrying, Failed)
                | (Retrying, Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state '{s}'"))
    }
}

/// Classification attached to every failed or retried attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    QueueUnavailable,
    LaunchError,
    PolicyViolation,
    TimedOut,
    ResultInvalid,
    RuntimeCrash,
    AgentNotFound,
    ContextInvalid,
    Cancelled,
}

impl FailureKind {
    pub const ALL: [FailureKind; 9] = [
        FailureKind::QueueUnavailable,
        FailureKind::LaunchError,
        FailureKind::PolicyViolation,
        FailureKind::TimedOut,
        FailureKind::ResultInvalid,
        FailureKind::RuntimeCrash,
        FailureKind::AgentNotFound,
        FailureKind::ContextInvalid,
        FailureKind::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueUnavailable => "QueueUnavailable",
            Self::LaunchError => "LaunchError",
            Self::PolicyViolation => "PolicyViolation",
            Self::TimedOut => "TimedOut",
            Self::ResultInvalid => "ResultInvalid",
            Self::RuntimeCrash => "RuntimeCrash",
            Self::AgentNotFound => "AgentNotFound",
            Self::ContextInvalid => "ContextInvalid",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown failure kind '{s}'"))
    }
}

/// Structured reason recorded on a job when an attempt fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in JobState::ALL.into_iter().filter(JobState::is_terminal) {
            for to in JobState::ALL {
                assert!(
                    !from.can_transition_to(to),
                    "{from} -> {to} must be rejected"
                );
            }
        }
    }

    #[test]
    fn retry_path_goes_through_retrying() {
        assert!(JobState::Running.can_transition_to(JobState::TimedOut));
        assert!(JobState::TimedOut.can_transition_to(JobState::Retrying));
        assert!(JobState::Retrying.can_transition_to(JobState::Queued));
        assert!(!JobState::Retrying.can_transition_to(JobState::Running));
    }

    #[test]
    fn claim_only_from_queued() {
        for from in JobState::ALL {
            let allowed = from.can_transition_to(JobState::Running);
            assert_eq!(allowed, from == JobState::Queued, "{from} -> running");
        }
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("pending".parse::<JobState>().is_err());
    }

    #[test]
    fn failure_renders_kind_then_reason() {
        let failure = JobFailure::new(FailureKind::PolicyViolation, "aws_sdk not allowed");
        assert_eq!(failure.to_string(), "PolicyViolation: aws_sdk not allowed");
        assert_eq!(
            "RuntimeCrash".parse::<FailureKind>().unwrap(),
            FailureKind::RuntimeCrash
        );
    }
}
