//! The seam between the container manager and a concrete container engine.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::agents::ResourceLimits;
use crate::error::RuntimeError;

/// Label marking containers owned by this orchestrator.
pub const LABEL_MANAGED: &str = "agent-hub.managed";
pub const LABEL_JOB_ID: &str = "agent-hub.job_id";
pub const LABEL_EXECUTION_ID: &str = "agent-hub.execution_id";

/// In-container paths of the entrypoint contract.
pub const CONTAINER_WORKSPACE: &str = "/workspace";
pub const CONTAINER_CONTEXT_PATH: &str = "/workspace/context.json";
pub const CONTAINER_OUTPUT_DIR: &str = "/workspace/output";
pub const CONTAINER_RESULT_PATH: &str = "/workspace/output/result.json";
pub const CONTAINER_AGENT_DIR: &str = "/workspace/agent";
pub const CONTAINER_STATE_DIR: &str = "/workspace/state";

/// A bind mount from the host into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: true,
        }
    }

    pub fn read_write(host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }

    /// Docker `binds` syntax.
    pub fn to_bind(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.host_path, self.container_path)
        } else {
            format!("{}:{}:rw", self.host_path, self.container_path)
        }
    }
}

/// Everything needed to create one isolated instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub mounts: Vec<Mount>,
    pub labels: HashMap<String, String>,
    /// `uid:gid`, never root.
    pub user: String,
    /// "none", or the internal egress network.
    pub network_mode: String,
    /// `/etc/hosts` additions, in Docker's `name:address` form.
    pub extra_hosts: Vec<String>,
    pub limits: ResourceLimits,
    pub tmpfs_size: String,
}

impl ContainerSpec {
    pub fn mount_for(&self, container_path: &str) -> Option<&Mount> {
        self.mounts.iter().find(|m| m.container_path == container_path)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// A container the runtime reports as present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveContainer {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

/// Captured output streams, untruncated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedLogs {
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make sure `image` is available locally, pulling it if needed.
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Make sure the internal network `name` exists, creating it without a
    /// route out if needed. Returns its gateway address, through which
    /// containers on it reach the host.
    async fn ensure_network(&self, name: &str) -> Result<Option<String>, RuntimeError>;

    /// Create and start an instance, returning its id.
    ///
    /// If creation succeeds but start fails, the half-made instance is
    /// removed before the error is returned.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Wait until the instance exits and return its exit code.
    async fn wait(&self, container_id: &str) -> Result<i64, RuntimeError>;

    /// Force-terminate. Killing an instance that already exited is not an error.
    async fn kill(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn logs(&self, container_id: &str) -> Result<CapturedLogs, RuntimeError>;

    /// Force-remove. Removing an unknown instance yields `NotFound`.
    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Every instance, running or not, carrying `label=value`.
    async fn list_labelled(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<LiveContainer>, RuntimeError>;

    async fn ping(&self) -> Result<(), RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_syntax() {
        assert_eq!(
            Mount::read_only("/srv/ctx.json", CONTAINER_CONTEXT_PATH).to_bind(),
            "/srv/ctx.json:/workspace/context.json:ro"
        );
        assert_eq!(
            Mount::read_write("/srv/out", CONTAINER_OUTPUT_DIR).to_bind(),
            "/srv/out:/workspace/output:rw"
        );
    }
}
