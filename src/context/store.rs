//! Filesystem-backed context store.
//!
//! Layout under the store root:
//!
//! ```text
//! contexts/<job_id>.json                       submitted payload (write-once)
//! results/<job_id>/<execution_id>.json         validated agent output (write-once)
//! results/<job_id>/<execution_id>.stdout.log   captured container output
//! state/<agent_id>/                            durable per-agent state
//! ```

use std::path::{Component, Path, PathBuf};

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::agents::validate_agent_id;
use crate::config::ContextConfig;
use crate::context::{ContextPayload, ContextRef, ExecutionOutput, ResultRef};
use crate::error::{AgentError, ContextError};

/// Which container stream a captured log came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    fn extension(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout.log",
            Self::Stderr => "stderr.log",
        }
    }
}

/// Storage for context payloads, results and agent state.
#[derive(Debug, Clone)]
pub struct ContextStore {
    root: PathBuf,
    max_context_bytes: usize,
}

impl ContextStore {
    pub fn new(root: impl Into<PathBuf>, max_context_bytes: usize) -> Self {
        Self {
            root: root.into(),
            max_context_bytes,
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(&config.data_dir, config.max_context_bytes)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate and persist a submitted payload. Each job's context can be
    /// written exactly once.
    pub async fn write_context(
        &self,
        job_id: Uuid,
        data: serde_json::Value,
    ) -> Result<ContextRef, ContextError> {
        let payload = ContextPayload::parse(data)?;
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| ContextError::Serialization(e.to_string()))?;
        if bytes.len() > self.max_context_bytes {
            return Err(ContextError::TooLarge {
                size: bytes.len(),
                limit: self.max_context_bytes,
            });
        }

        let reference = ContextRef::for_job(job_id);
        self.write_once(reference.as_str(), &bytes).await?;
        tracing::debug!(job_id = %job_id, bytes = bytes.len(), "Stored context payload");
        Ok(reference)
    }

    /// Load and re-validate a stored payload.
    pub async fn read_context(&self, reference: &ContextRef) -> Result<ContextPayload, ContextError> {
        let path = self.resolve(reference.as_str())?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ContextError::NotFound {
                    reference: reference.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| ContextError::Serialization(e.to_string()))?;
        ContextPayload::parse(value)
    }

    /// Persist a validated result. Retries write under a new execution id,
    /// so a collision means the same execution was collected twice.
    pub async fn write_result(
        &self,
        job_id: Uuid,
        execution_id: Uuid,
        output: &ExecutionOutput,
    ) -> Result<ResultRef, ContextError> {
        let bytes = serde_json::to_vec_pretty(output)
            .map_err(|e| ContextError::Serialization(e.to_string()))?;
        let reference = ResultRef::for_execution(job_id, execution_id);
        self.write_once(reference.as_str(), &bytes).await?;
        Ok(reference)
    }

    pub async fn read_result(&self, reference: &ResultRef) -> Result<ExecutionOutput, ContextError> {
        let path = self.resolve(reference.as_str())?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ContextError::NotFound {
                    reference: reference.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| ContextError::Serialization(e.to_string()))
    }

    /// Store captured container output and return its reference.
    pub async fn write_log(
        &self,
        job_id: Uuid,
        execution_id: Uuid,
        stream: LogStream,
        content: &str,
    ) -> Result<String, ContextError> {
        let reference = format!(
            "results/{job_id}/{execution_id}.{}",
            stream.extension()
        );
        let path = self.resolve(&reference)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content.as_bytes()).await?;
        Ok(reference)
    }

    /// Host directory holding an agent's durable state, created on demand.
    pub async fn agent_state_dir(&self, agent_id: &str) -> Result<PathBuf, ContextError> {
        validate_agent_id(agent_id).map_err(|e| match e {
            AgentError::InvalidDescriptor { reason, .. } => ContextError::Invalid(reason),
            other => ContextError::Invalid(other.to_string()),
        })?;
        let dir = self.root.join("state").join(agent_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Absolute host path of a stored context.
    pub fn context_path(&self, reference: &ContextRef) -> Result<PathBuf, ContextError> {
        self.resolve(reference.as_str())
    }

    /// Map a store-relative reference to a path, refusing anything that
    /// could escape the root.
    fn resolve(&self, reference: &str) -> Result<PathBuf, ContextError> {
        let rel = Path::new(reference);
        let clean = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !clean || reference.is_empty() {
            return Err(ContextError::Invalid(format!(
                "reference '{reference}' is not a store-relative path"
            )));
        }
        Ok(self.root.join(rel))
    }

    /// Write to a temp file, then hard-link it into place so readers never
    /// observe a partial document and a second write fails.
    async fn write_once(&self, reference: &str, bytes: &[u8]) -> Result<(), ContextError> {
        let dest = self.resolve(reference)?;
        let parent = dest
            .parent()
            .ok_or_else(|| ContextError::Invalid(format!("reference '{reference}' has no parent")))?;
        tokio::fs::create_dir_all(parent).await?;

        let tmp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        let linked = tokio::fs::hard_link(&tmp, &dest).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(ContextError::AlreadyExists {
                    reference: reference.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::context::ContextV1;

    fn store(dir: &Path) -> ContextStore {
        ContextStore::new(dir, 4096)
    }

    #[tokio::test]
    async fn context_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let job_id = Uuid::new_v4();
        let data = json!({"schema_version": "1", "user_id": "u"});

        let reference = store.write_context(job_id, data.clone()).await.unwrap();
        assert_eq!(reference, ContextRef::for_job(job_id));

        let err = store.write_context(job_id, data).await.unwrap_err();
        assert!(matches!(err, ContextError::AlreadyExists { .. }));

        let ContextPayload::V1(v1) = store.read_context(&reference).await.unwrap();
        assert_eq!(v1.user_id, "u");
    }

    #[tokio::test]
    async fn oversized_context_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContextStore::new(dir.path(), 64);
        let data = json!({
            "schema_version": "1",
            "messages": [{"role": "user", "content": "x".repeat(200)}],
        });
        let err = store.write_context(Uuid::new_v4(), data).await.unwrap_err();
        assert!(matches!(err, ContextError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn traversal_references_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let err = store
            .read_context(&ContextRef::from_raw("../outside.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::Invalid(_)));
        assert!(store.context_path(&ContextRef::from_raw("/etc/passwd")).is_err());
    }

    #[tokio::test]
    async fn missing_context_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = store(dir.path())
            .read_context(&ContextRef::for_job(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::NotFound { .. }));
    }

    #[tokio::test]
    async fn result_round_trip_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let (job_id, exec_id) = (Uuid::new_v4(), Uuid::new_v4());
        let output = ExecutionOutput {
            execution_id: Some(exec_id.to_string()),
            agent_id: Some("echo".into()),
            user_id: None,
            results: vec![json!({"type": "message", "content": "hi"})],
            stats: Default::default(),
        };

        let reference = store.write_result(job_id, exec_id, &output).await.unwrap();
        assert_eq!(store.read_result(&reference).await.unwrap(), output);

        let log_ref = store
            .write_log(job_id, exec_id, LogStream::Stderr, "boom")
            .await
            .unwrap();
        assert!(log_ref.ends_with(".stderr.log"));
        let on_disk = std::fs::read_to_string(dir.path().join(&log_ref)).unwrap();
        assert_eq!(on_disk, "boom");
    }

    #[tokio::test]
    async fn agent_state_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let state = store.agent_state_dir("echo").await.unwrap();
        assert!(state.is_dir());
        assert!(store.agent_state_dir("../echo").await.is_err());
    }

    #[test]
    fn default_payload_is_valid() {
        assert!(ContextPayload::V1(ContextV1::default()).validate().is_ok());
    }
}
