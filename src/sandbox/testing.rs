//! In-process container runtime driven by per-image scripts.
//!
//! Lets the dispatcher and container manager be exercised end to end
//! without a Docker daemon. Each launch consumes the next script queued for
//! its image; once the queue is empty the default script applies.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};

use crate::error::{LaunchFailureKind, RuntimeError};
use crate::sandbox::runtime::{
    CONTAINER_OUTPUT_DIR, CapturedLogs, ContainerRuntime, ContainerSpec, LABEL_MANAGED,
    LiveContainer,
};

/// Exit code reported for a killed instance (128 + SIGKILL).
pub const KILLED_EXIT_CODE: i64 = 137;

/// Gateway reported for every network the scripted runtime is asked for.
pub const SCRIPTED_GATEWAY: &str = "10.89.0.1";

/// What the fake agent leaves in `/workspace/output/result.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptResult {
    /// A well-formed result naming the right execution and agent.
    Valid,
    /// Exactly these bytes.
    Raw(String),
    Missing,
}

/// Behaviour of one scripted launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    Exit {
        code: i64,
        result: ScriptResult,
        delay: Duration,
    },
    /// Runs until killed.
    Hang,
    /// The runtime refuses to create the instance.
    FailLaunch(LaunchFailureKind),
}

impl Script {
    pub fn success() -> Self {
        Self::Exit {
            code: 0,
            result: ScriptResult::Valid,
            delay: Duration::ZERO,
        }
    }

    pub fn success_after(delay: Duration) -> Self {
        Self::Exit {
            code: 0,
            result: ScriptResult::Valid,
            delay,
        }
    }

    pub fn crash(code: i64) -> Self {
        Self::Exit {
            code,
            result: ScriptResult::Missing,
            delay: Duration::ZERO,
        }
    }

    /// Exits cleanly but writes `raw` as its result.
    pub fn bad_result(raw: impl Into<String>) -> Self {
        Self::Exit {
            code: 0,
            result: ScriptResult::Raw(raw.into()),
            delay: Duration::ZERO,
        }
    }
}

/// Side-effecting runtime calls, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    EnsureImage(String),
    EnsureNetwork(String),
    Create { name: String, image: String },
    Kill(String),
    Remove(String),
}

struct FakeContainer {
    name: String,
    labels: HashMap<String, String>,
    exit: Arc<watch::Sender<Option<i64>>>,
    logs: CapturedLogs,
}

#[derive(Default)]
struct Inner {
    scripts: HashMap<String, VecDeque<Script>>,
    default_script: Option<Script>,
    containers: HashMap<String, FakeContainer>,
    calls: Vec<RuntimeCall>,
    specs: Vec<ContainerSpec>,
}

/// Scripted [`ContainerRuntime`].
#[derive(Default)]
pub struct ScriptedRuntime {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
    stalled: AtomicBool,
    failing_removals: AtomicU32,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `script` for the next launch of `image`.
    pub async fn push_script(&self, image: &str, script: Script) {
        self.inner
            .lock()
            .await
            .scripts
            .entry(image.to_string())
            .or_default()
            .push_back(script);
    }

    /// Script used when nothing is queued. Starts out as [`Script::success`].
    pub async fn set_default_script(&self, script: Script) {
        self.inner.lock().await.default_script = Some(script);
    }

    /// Make every call fail as if the daemon were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `ping` hang, as a daemon that accepts connections but never
    /// answers does.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Refuse the next `n` removals with an API error.
    pub fn fail_next_removals(&self, n: u32) {
        self.failing_removals.store(n, Ordering::SeqCst);
    }

    pub async fn calls(&self) -> Vec<RuntimeCall> {
        self.inner.lock().await.calls.clone()
    }

    /// Every spec handed to `create_and_start`, including refused ones.
    pub async fn specs(&self) -> Vec<ContainerSpec> {
        self.inner.lock().await.specs.clone()
    }

    /// Instances created and not yet removed.
    pub async fn live_count(&self) -> usize {
        self.inner.lock().await.containers.len()
    }

    /// Plant a managed container that no execution owns.
    pub async fn seed_orphan(&self, name: &str) -> String {
        let id = self.allocate_id();
        let (tx, _rx) = watch::channel(None);
        let labels = [(LABEL_MANAGED.to_string(), "true".to_string())]
            .into_iter()
            .collect();
        self.inner.lock().await.containers.insert(
            id.clone(),
            FakeContainer {
                name: name.to_string(),
                labels,
                exit: Arc::new(tx),
                logs: CapturedLogs::default(),
            },
        );
        id
    }

    fn allocate_id(&self) -> String {
        format!("scripted-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn check_available(&self) -> Result<(), RuntimeError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RuntimeError::Unavailable("scripted runtime is down".into()))
        } else {
            Ok(())
        }
    }
}

fn env_value<'a>(spec: &'a ContainerSpec, key: &str) -> Option<&'a str> {
    spec.env.iter().find_map(|pair| {
        pair.split_once('=')
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v)
    })
}

async fn write_result(spec: &ContainerSpec, result: &ScriptResult) {
    let Some(output) = spec.mount_for(CONTAINER_OUTPUT_DIR) else {
        return;
    };
    let body = match result {
        ScriptResult::Missing => return,
        ScriptResult::Raw(raw) => raw.clone(),
        ScriptResult::Valid => serde_json::json!({
            "execution_id": env_value(spec, "EXECUTION_ID"),
            "agent_id": env_value(spec, "AGENT_ID"),
            "results": [{ "role": "agent", "content": "done" }],
            "stats": { "llm_calls": 0, "duration_seconds": 0.0, "message_count": 1 }
        })
        .to_string(),
    };
    let path = std::path::Path::new(&output.host_path).join("result.json");
    if let Err(e) = tokio::fs::write(&path, body).await {
        tracing::warn!(path = %path.display(), error = %e, "Scripted agent could not write result");
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.check_available()?;
        self.inner
            .lock()
            .await
            .calls
            .push(RuntimeCall::EnsureImage(image.to_string()));
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<Option<String>, RuntimeError> {
        self.check_available()?;
        self.inner
            .lock()
            .await
            .calls
            .push(RuntimeCall::EnsureNetwork(name.to_string()));
        Ok(Some(SCRIPTED_GATEWAY.to_string()))
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.specs.push(spec.clone());
        let script = inner
            .scripts
            .get_mut(&spec.image)
            .and_then(VecDeque::pop_front)
            .or_else(|| inner.default_script.clone())
            .unwrap_or_else(Script::success);

        if let Script::FailLaunch(kind) = script {
            return Err(RuntimeError::Launch {
                kind,
                reason: format!("scripted launch failure for {}", spec.image),
            });
        }

        let id = self.allocate_id();
        let (tx, _rx) = watch::channel(None);
        let exit = Arc::new(tx);
        let agent = env_value(spec, "AGENT_ID").unwrap_or("unknown");
        inner.containers.insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone(),
                labels: spec.labels.clone(),
                exit: Arc::clone(&exit),
                logs: CapturedLogs {
                    stdout: format!("agent {agent} started\n"),
                    stderr: String::new(),
                },
            },
        );
        inner.calls.push(RuntimeCall::Create {
            name: spec.name.clone(),
            image: spec.image.clone(),
        });
        drop(inner);

        if let Script::Exit {
            code,
            result,
            delay,
        } = script
        {
            let spec = spec.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if exit.borrow().is_some() {
                    return;
                }
                write_result(&spec, &result).await;
                exit.send_if_modified(|status| {
                    if status.is_none() {
                        *status = Some(code);
                        true
                    } else {
                        false
                    }
                });
            });
        }
        Ok(id)
    }

    async fn wait(&self, container_id: &str) -> Result<i64, RuntimeError> {
        self.check_available()?;
        let mut rx = {
            let inner = self.inner.lock().await;
            let container = inner
                .containers
                .get(container_id)
                .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
            container.exit.subscribe()
        };
        let status = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RuntimeError::NotFound(container_id.to_string()))?;
        Ok(status.unwrap_or(KILLED_EXIT_CODE))
    }

    async fn kill(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let container = inner
            .containers
            .get(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.exit.send_if_modified(|status| {
            if status.is_none() {
                *status = Some(KILLED_EXIT_CODE);
                true
            } else {
                false
            }
        });
        inner.calls.push(RuntimeCall::Kill(container_id.to_string()));
        Ok(())
    }

    async fn logs(&self, container_id: &str) -> Result<CapturedLogs, RuntimeError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        inner
            .containers
            .get(container_id)
            .map(|c| c.logs.clone())
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.check_available()?;
        let refused = self
            .failing_removals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(RuntimeError::Api(format!(
                "scripted removal failure for {container_id}"
            )));
        }
        let mut inner = self.inner.lock().await;
        let container = inner
            .containers
            .remove(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.exit.send_if_modified(|status| {
            if status.is_none() {
                *status = Some(KILLED_EXIT_CODE);
                true
            } else {
                false
            }
        });
        inner.calls.push(RuntimeCall::Remove(container_id.to_string()));
        Ok(())
    }

    async fn list_labelled(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<LiveContainer>, RuntimeError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut live: Vec<LiveContainer> = inner
            .containers
            .iter()
            .filter(|(_, c)| c.labels.get(label).map(String::as_str) == Some(value))
            .map(|(id, c)| LiveContainer {
                id: id.clone(),
                name: c.name.clone(),
                labels: c.labels.clone(),
            })
            .collect();
        live.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(live)
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::ResourceLimits;

    fn spec(image: &str) -> ContainerSpec {
        ContainerSpec {
            name: "agent-hub-test".into(),
            image: image.into(),
            cmd: vec![],
            env: vec!["AGENT_ID=echo".into()],
            mounts: vec![],
            labels: [(LABEL_MANAGED.to_string(), "true".to_string())]
                .into_iter()
                .collect(),
            user: "1000:1000".into(),
            network_mode: "none".into(),
            extra_hosts: vec![],
            limits: ResourceLimits::default(),
            tmpfs_size: "64M".into(),
        }
    }

    #[tokio::test]
    async fn scripts_are_consumed_in_order() {
        let runtime = ScriptedRuntime::new();
        runtime.push_script("img", Script::crash(3)).await;

        let first = runtime.create_and_start(&spec("img")).await.unwrap();
        assert_eq!(runtime.wait(&first).await.unwrap(), 3);

        let second = runtime.create_and_start(&spec("img")).await.unwrap();
        assert_eq!(runtime.wait(&second).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn kill_ends_a_hanging_container() {
        let runtime = ScriptedRuntime::new();
        runtime.push_script("img", Script::Hang).await;
        let id = runtime.create_and_start(&spec("img")).await.unwrap();
        runtime.kill(&id).await.unwrap();
        assert_eq!(runtime.wait(&id).await.unwrap(), KILLED_EXIT_CODE);
    }

    #[tokio::test]
    async fn refused_launch_creates_nothing() {
        let runtime = ScriptedRuntime::new();
        runtime
            .push_script("img", Script::FailLaunch(LaunchFailureKind::ImagePull))
            .await;
        let err = runtime.create_and_start(&spec("img")).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Launch {
                kind: LaunchFailureKind::ImagePull,
                ..
            }
        ));
        assert_eq!(runtime.live_count().await, 0);
        assert_eq!(runtime.specs().await.len(), 1);
    }

    #[tokio::test]
    async fn removal_is_reported_once() {
        let runtime = ScriptedRuntime::new();
        let id = runtime.create_and_start(&spec("img")).await.unwrap();
        runtime.remove(&id).await.unwrap();
        assert!(matches!(
            runtime.remove(&id).await,
            Err(RuntimeError::NotFound(_))
        ));
        assert!(runtime.list_labelled(LABEL_MANAGED, "true").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_runtime_fails_every_call() {
        let runtime = ScriptedRuntime::new();
        runtime.set_unavailable(true);
        assert!(matches!(runtime.ping().await, Err(RuntimeError::Unavailable(_))));
        assert!(runtime.create_and_start(&spec("img")).await.is_err());
    }
}
