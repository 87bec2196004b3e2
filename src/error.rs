//! Error types for agent-hub.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::jobs::{FailureKind, JobState};
use crate::policy::PolicyRule;
use crate::sandbox::ExecutionState;

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Policy violation: {0}")]
    Policy(#[from] PolicyViolation),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Health check error: {0}")]
    Health(#[from] HealthError),

    #[error("Dispatcher lock error: {0}")]
    Lock(#[from] LockError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[cfg(feature = "libsql")]
    #[error("LibSQL error: {0}")]
    LibSql(#[from] libsql::Error),
}

/// Job queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The backing queue cannot be reached. Callers back off and retry.
    #[error("Queue unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("No outstanding lease for job {job_id}")]
    LeaseNotFound { job_id: Uuid },
}

/// Agent registry errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent {agent_id} not found")]
    NotFound { agent_id: String },

    #[error("Invalid descriptor for agent {agent_id}: {reason}")]
    InvalidDescriptor { agent_id: String, reason: String },

    #[error("Agent {agent_id} is already registered")]
    AlreadyRegistered { agent_id: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Context store errors.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("Invalid context payload: {0}")]
    Invalid(String),

    #[error("Context {reference} not found")]
    NotFound { reference: String },

    #[error("Context {reference} already written")]
    AlreadyExists { reference: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A launch refused by the security policy gate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{rule}: {detail}")]
pub struct PolicyViolation {
    pub rule: PolicyRule,
    pub detail: String,
}

impl PolicyViolation {
    pub fn new(rule: PolicyRule, detail: impl Into<String>) -> Self {
        Self {
            rule,
            detail: detail.into(),
        }
    }
}

/// Why the container runtime could not allocate an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchFailureKind {
    /// Out of memory, disk, or container slots on the host.
    ResourceExhausted,
    /// The agent image could not be pulled or does not exist.
    ImagePull,
    /// The container spec was rejected by the runtime.
    InvalidSpec,
    /// Any other runtime failure (daemon unreachable, API error).
    Runtime,
}

impl std::fmt::Display for LaunchFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::ImagePull => write!(f, "image pull failed"),
            Self::InvalidSpec => write!(f, "invalid spec"),
            Self::Runtime => write!(f, "runtime error"),
        }
    }
}

/// Container lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("Launch failed for job {job_id} ({kind}): {reason}")]
    Launch {
        job_id: Uuid,
        kind: LaunchFailureKind,
        reason: String,
    },

    #[error("Container for job {job_id} timed out after {timeout:?}")]
    TimedOut { job_id: Uuid, timeout: Duration },

    #[error("Container for job {job_id} was cancelled")]
    Cancelled { job_id: Uuid },

    #[error("Container for job {job_id} exited with status {exit_code}")]
    RuntimeCrash { job_id: Uuid, exit_code: i64 },

    #[error("Invalid result from job {job_id}: {reason}")]
    ResultInvalid { job_id: Uuid, reason: String },

    #[error("Execution {execution_id} cannot move from {from} to {to}")]
    InvalidTransition {
        execution_id: Uuid,
        from: ExecutionState,
        to: ExecutionState,
    },

    #[error("Container {container_id} not found")]
    NotFound { container_id: String },

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Execution store error: {0}")]
    Store(#[from] DatabaseError),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by a container runtime backend.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The runtime refused to create or start an instance.
    #[error("{kind}: {reason}")]
    Launch {
        kind: LaunchFailureKind,
        reason: String,
    },

    #[error("Container {0} not found")]
    NotFound(String),

    /// The daemon could not be reached.
    #[error("Container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("Container runtime API error: {0}")]
    Api(String),
}

/// Job state machine errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} cannot transition from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobState,
        to: JobState,
    },

    #[error("Job {id} is already {state}")]
    AlreadyTerminal { id: Uuid, state: JobState },

    #[error("Job {id} failed: {kind}: {reason}")]
    Failed {
        id: Uuid,
        kind: FailureKind,
        reason: String,
    },
}

/// Health probe errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("Health check timed out after {after:?}")]
    Timeout { after: Duration },
}

/// Dispatcher lock errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another dispatcher holds {}", path.display())]
    Held { path: PathBuf },

    #[error("cannot lock {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use crate::error::*;

    #[test]
    fn launch_error_names_job_and_cause() {
        let id = Uuid::new_v4();
        let err = ContainerError::Launch {
            job_id: id,
            kind: LaunchFailureKind::ImagePull,
            reason: "manifest unknown".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains(&id.to_string()));
        assert!(msg.contains("image pull failed"));
        assert!(msg.contains("manifest unknown"));
    }

    #[test]
    fn timed_out_display_includes_duration() {
        let err = ContainerError::TimedOut {
            job_id: Uuid::nil(),
            timeout: Duration::from_secs(30),
        };
        assert!(err.to_string().contains("30s"));
    }

    #[test]
    fn policy_violation_display_uses_rule_name() {
        let err = PolicyViolation::new(PolicyRule::IntegrationNotAllowed, "aws_sdk");
        assert_eq!(err.to_string(), "integration_not_allowed: aws_sdk");
    }

    #[test]
    fn invalid_transition_display() {
        let id = Uuid::new_v4();
        let err = JobError::InvalidTransition {
            id,
            from: JobState::Succeeded,
            to: JobState::Running,
        };
        let msg = err.to_string();
        assert!(msg.contains("succeeded"));
        assert!(msg.contains("running"));
    }

    #[test]
    fn top_level_wraps_queue_error() {
        let err: Error = QueueError::Unavailable {
            reason: "connection refused".into(),
        }
        .into();
        assert!(matches!(err, Error::Queue(QueueError::Unavailable { .. })));
        assert!(err.to_string().contains("connection refused"));
    }
}
