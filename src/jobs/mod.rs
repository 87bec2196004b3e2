//! Jobs: the unit of work the dispatcher drives from submission to a
//! terminal state.

mod state;

pub use state::{FailureKind, JobFailure, JobState};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{ContextRef, ResultRef};
use crate::error::JobError;

/// Priority class of a queued job. Higher classes drain first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Drain order, highest first.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// Numeric rank used for storage; lower drains first.
    pub fn rank(&self) -> i64 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        Priority::ALL.into_iter().find(|p| p.rank() == rank)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Self::High),
            "normal" | "default" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(format!(
                "invalid priority '{s}', expected 'high', 'normal', or 'low'"
            )),
        }
    }
}

/// A submitted execution request.
///
/// Only the dispatcher mutates a job, and only through
/// [`Job::transition_to`] so every edge is checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub agent_id: String,
    pub context_ref: ContextRef,
    pub priority: Priority,
    pub state: JobState,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub result_ref: Option<ResultRef>,
    pub failure: Option<JobFailure>,
}

impl Job {
    pub fn new(
        job_id: Uuid,
        agent_id: impl Into<String>,
        context_ref: ContextRef,
        priority: Priority,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            agent_id: agent_id.into(),
            context_ref,
            priority,
            state: JobState::Queued,
            attempt_count: 0,
            created_at: now,
            last_updated_at: now,
            result_ref: None,
            failure: None,
        }
    }

    /// Move to `target`, rejecting illegal edges.
    pub fn transition_to(&mut self, target: JobState) -> Result<(), JobError> {
        if self.state.is_terminal() {
            return Err(JobError::AlreadyTerminal {
                id: self.job_id,
                state: self.state,
            });
        }
        if !self.state.can_transition_to(target) {
            return Err(JobError::InvalidTransition {
                id: self.job_id,
                from: self.state,
                to: target,
            });
        }
        self.state = target;
        self.last_updated_at = Utc::now();
        Ok(())
    }

    /// Read-only view returned to submitters.
    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.job_id,
            agent_id: self.agent_id.clone(),
            state: self.state,
            attempt_count: self.attempt_count,
            result_ref: self.result_ref.clone(),
            error: self.failure.as_ref().map(ToString::to_string),
        }
    }
}

/// Status snapshot for `get_job_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: Uuid,
    pub agent_id: String,
    pub state: JobState,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<ResultRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
