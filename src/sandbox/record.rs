//! Per-execution bookkeeping owned by the container manager.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ContainerError;

/// Lifecycle of one container instance.
///
/// ```text
/// created -> running -> { exited_ok, exited_error, timed_out, cancelled }
/// created -> launch_failed
/// * -> cleaned_up (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Created,
    Running,
    ExitedOk,
    ExitedError,
    TimedOut,
    Cancelled,
    LaunchFailed,
    CleanedUp,
}

impl ExecutionState {
    pub const ALL: [ExecutionState; 8] = [
        ExecutionState::Created,
        ExecutionState::Running,
        ExecutionState::ExitedOk,
        ExecutionState::ExitedError,
        ExecutionState::TimedOut,
        ExecutionState::Cancelled,
        ExecutionState::LaunchFailed,
        ExecutionState::CleanedUp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::ExitedOk => "exited_ok",
            Self::ExitedError => "exited_error",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::LaunchFailed => "launch_failed",
            Self::CleanedUp => "cleaned_up",
        }
    }

    pub fn can_transition_to(&self, target: ExecutionState) -> bool {
        use ExecutionState::*;

        match (self, target) {
            (CleanedUp, _) => false,
            (_, CleanedUp) => true,
            (Created, Running | LaunchFailed) => true,
            (Running, ExitedOk | ExitedError | TimedOut | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutionState::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown execution state '{s}'"))
    }
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitStatus {
    Exited { code: i64 },
    TimedOut,
    Cancelled,
    LaunchFailed { reason: String },
    /// The container vanished (daemon restart, recovery reaping).
    Lost,
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }

    /// Execution state this status leaves the record in.
    pub fn execution_state(&self) -> ExecutionState {
        match self {
            Self::Exited { code: 0 } => ExecutionState::ExitedOk,
            Self::Exited { .. } | Self::Lost => ExecutionState::ExitedError,
            Self::TimedOut => ExecutionState::TimedOut,
            Self::Cancelled => ExecutionState::Cancelled,
            Self::LaunchFailed { .. } => ExecutionState::LaunchFailed,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exit {code}"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::LaunchFailed { reason } => write!(f, "launch failed: {reason}"),
            Self::Lost => f.write_str("lost"),
        }
    }
}

/// Reference to a launched container, passed between the dispatcher and
/// the container manager instead of the record itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    pub execution_id: Uuid,
    pub job_id: Uuid,
    pub container_id: String,
    pub container_name: String,
}

/// One record per execution attempt. Never mutated once cleaned up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub job_id: Uuid,
    pub agent_id: String,
    pub attempt: u32,
    pub container_id: Option<String>,
    pub container_name: String,
    pub state: ExecutionState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_status: Option<ExitStatus>,
    pub stdout_ref: Option<String>,
    pub stderr_ref: Option<String>,
}

impl ExecutionRecord {
    pub fn new(job_id: Uuid, agent_id: impl Into<String>, attempt: u32) -> Self {
        let execution_id = Uuid::new_v4();
        Self {
            execution_id,
            job_id,
            agent_id: agent_id.into(),
            attempt,
            container_id: None,
            container_name: container_name(job_id, execution_id),
            state: ExecutionState::Created,
            started_at: Utc::now(),
            ended_at: None,
            exit_status: None,
            stdout_ref: None,
            stderr_ref: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == ExecutionState::CleanedUp
    }

    pub fn advance(&mut self, target: ExecutionState) -> Result<(), ContainerError> {
        if !self.state.can_transition_to(target) {
            return Err(ContainerError::InvalidTransition {
                execution_id: self.execution_id,
                from: self.state,
                to: target,
            });
        }
        self.state = target;
        Ok(())
    }

    /// Record the outcome and move to the matching state.
    pub fn finish(&mut self, status: ExitStatus) -> Result<(), ContainerError> {
        self.advance(status.execution_state())?;
        self.ended_at = Some(Utc::now());
        self.exit_status = Some(status);
        Ok(())
    }

    /// Close the record. Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
        self.state = ExecutionState::CleanedUp;
    }

    pub fn handle(&self) -> Option<ContainerHandle> {
        self.container_id.as_ref().map(|id| ContainerHandle {
            execution_id: self.execution_id,
            job_id: self.job_id,
            container_id: id.clone(),
            container_name: self.container_name.clone(),
        })
    }
}

/// Deterministic container name for an execution.
pub fn container_name(job_id: Uuid, execution_id: Uuid) -> String {
    let job = job_id.simple().to_string();
    let exec = execution_id.simple().to_string();
    format!("agent-hub-{}-{}", &job[..12], &exec[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut rec = ExecutionRecord::new(Uuid::new_v4(), "echo", 1);
        assert_eq!(rec.state, ExecutionState::Created);
        rec.advance(ExecutionState::Running).unwrap();
        rec.finish(ExitStatus::Exited { code: 0 }).unwrap();
        assert_eq!(rec.state, ExecutionState::ExitedOk);
        assert!(rec.ended_at.is_some());
        rec.close();
        assert!(rec.is_closed());
        assert_eq!(rec.exit_status, Some(ExitStatus::Exited { code: 0 }));
    }

    #[test]
    fn closed_record_rejects_changes() {
        let mut rec = ExecutionRecord::new(Uuid::new_v4(), "echo", 1);
        rec.close();
        rec.close();
        assert!(rec.advance(ExecutionState::Running).is_err());
        assert!(rec.finish(ExitStatus::TimedOut).is_err());
    }

    #[test]
    fn created_cannot_skip_to_exit() {
        let mut rec = ExecutionRecord::new(Uuid::new_v4(), "echo", 1);
        assert!(rec.finish(ExitStatus::Exited { code: 1 }).is_err());
        rec.finish(ExitStatus::LaunchFailed {
            reason: "no such image".into(),
        })
        .unwrap();
        assert_eq!(rec.state, ExecutionState::LaunchFailed);
    }

    #[test]
    fn exit_status_maps_to_state() {
        assert_eq!(
            ExitStatus::Exited { code: 137 }.execution_state(),
            ExecutionState::ExitedError
        );
        assert_eq!(ExitStatus::TimedOut.execution_state(), ExecutionState::TimedOut);
        assert_eq!(ExitStatus::Lost.to_string(), "lost");
        assert!(!ExitStatus::Cancelled.is_success());
    }

    #[test]
    fn exit_status_serializes_tagged() {
        let json = serde_json::to_string(&ExitStatus::Exited { code: 2 }).unwrap();
        assert_eq!(json, r#"{"kind":"exited","code":2}"#);
        let back: ExitStatus = serde_json::from_str(r#"{"kind":"timed_out"}"#).unwrap();
        assert_eq!(back, ExitStatus::TimedOut);
    }

    #[test]
    fn container_names_are_stable() {
        let job = Uuid::new_v4();
        let exec = Uuid::new_v4();
        assert_eq!(container_name(job, exec), container_name(job, exec));
        assert!(container_name(job, exec).starts_with("agent-hub-"));
        assert!(ExecutionState::from_str("cleaned_up").is_ok());
    }
}
