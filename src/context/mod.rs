//! Context store: per-job context payloads, per-execution results and
//! per-agent durable state on the shared volume.

mod payload;
mod store;

pub use payload::{
    ContextPayload, ContextV1, ExecutionContext, ExecutionOutput, ExecutionStats, Message,
    MessageRole,
};
pub use store::{ContextStore, LogStream};

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pointer to a stored context payload, relative to the store root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextRef(String);

impl ContextRef {
    pub fn for_job(job_id: Uuid) -> Self {
        Self(format!("contexts/{job_id}.json"))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pointer to a persisted execution result, relative to the store root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultRef(String);

impl ResultRef {
    pub fn for_execution(job_id: Uuid, execution_id: Uuid) -> Self {
        Self(format!("results/{job_id}/{execution_id}.json"))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResultRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
