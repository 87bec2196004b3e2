//! Container manager: creates, supervises and tears down one isolated
//! container per execution attempt.
//!
//! Concurrency is bounded by a semaphore. A slot is taken before anything
//! is created and handed back only by [`ContainerManager::cleanup`], so a
//! container that was never cleaned up keeps occupying its slot.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use secrecy::ExposeSecret;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agents::AgentDescriptor;
use crate::config::SandboxConfig;
use crate::context::{ContextPayload, ContextStore, ExecutionContext, ExecutionOutput, LogStream, ResultRef};
use crate::db::ExecutionStore;
use crate::error::{ContainerError, LaunchFailureKind, RuntimeError};
use crate::observability::{Observer, ObserverEvent, ObserverMetric};
use crate::policy::SecurityDecision;
use crate::sandbox::proxy::EgressProxy;
use crate::sandbox::record::{ContainerHandle, ExecutionRecord, ExecutionState, ExitStatus};
use crate::sandbox::runtime::{
    CONTAINER_AGENT_DIR, CONTAINER_CONTEXT_PATH, CONTAINER_OUTPUT_DIR, CONTAINER_STATE_DIR,
    ContainerRuntime, ContainerSpec, LABEL_EXECUTION_ID, LABEL_JOB_ID, LABEL_MANAGED, Mount,
};
use crate::util::truncate_log_tail;

/// Environment names the orchestrator sets itself; agents and submitters
/// cannot override them.
const RESERVED_ENV: &[&str] = &["AGENT_ID", "JOB_ID", "EXECUTION_ID", "ATTEMPT"];
const RESERVED_ENV_PREFIX: &str = "AGENT_HUB_";
/// Set by the orchestrator to route traffic through the egress proxy.
const PROXY_ENV: &[&str] = &["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"];

/// Name Docker resolves to the host when mapped to `host-gateway`.
const DOCKER_HOST_ALIAS: &str = "host.docker.internal";

fn is_reserved_env(key: &str) -> bool {
    RESERVED_ENV.contains(&key)
        || key.starts_with(RESERVED_ENV_PREFIX)
        || PROXY_ENV.contains(&key)
        || key.eq_ignore_ascii_case("NO_PROXY")
}

/// One launch request, assembled by the dispatcher after the policy gate
/// approved it.
#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    pub job_id: Uuid,
    pub attempt: u32,
    pub agent: &'a AgentDescriptor,
    pub payload: &'a ContextPayload,
    pub decision: &'a SecurityDecision,
}

struct ActiveExecution {
    record: ExecutionRecord,
    exec_dir: PathBuf,
    permit: OwnedSemaphorePermit,
    /// Stops when the execution is cleaned up.
    egress: Option<EgressProxy>,
}

/// Removal attempts before a container is parked as unremoved.
const REMOVE_ATTEMPTS: u32 = 3;
const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(50);

pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn ExecutionStore>,
    contexts: Arc<ContextStore>,
    config: SandboxConfig,
    observer: Arc<dyn Observer>,
    slots: Arc<Semaphore>,
    active: Mutex<HashMap<Uuid, ActiveExecution>>,
    /// Containers whose removal failed. Each keeps its slot until a later
    /// removal succeeds.
    unremoved: Mutex<HashMap<String, OwnedSemaphorePermit>>,
}

impl ContainerManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn ExecutionStore>,
        contexts: Arc<ContextStore>,
        config: SandboxConfig,
        max_concurrent: usize,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            runtime,
            store,
            contexts,
            config,
            observer,
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
            active: Mutex::new(HashMap::new()),
            unremoved: Mutex::new(HashMap::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Executions currently holding a slot.
    pub async fn active_containers(&self) -> usize {
        self.active.lock().await.len()
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Start an isolated instance for one attempt.
    ///
    /// Waits for a free slot first; cancelling `cancel` while waiting gives
    /// up without creating anything. A refused launch is recorded, closed
    /// and its slot released before the error is returned.
    pub async fn launch(
        &self,
        request: LaunchRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<ContainerHandle, ContainerError> {
        let job_id = request.job_id;
        self.sweep_unremoved().await;
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ContainerError::Cancelled { job_id }),
            permit = Arc::clone(&self.slots).acquire_owned() => permit.map_err(|_| {
                RuntimeError::Unavailable("container manager is shutting down".into())
            })?,
        };

        let mut record = ExecutionRecord::new(job_id, &request.agent.agent_id, request.attempt);
        self.store.insert_execution(&record).await?;
        let exec_dir = self.config.work_dir.join(record.execution_id.to_string());

        let mut egress = None;
        let launched = match self.prepare(&request, &record, &exec_dir).await {
            Ok((spec, proxy)) => {
                egress = proxy;
                if cancel.is_cancelled() {
                    Err(RuntimeError::Launch {
                        kind: LaunchFailureKind::Runtime,
                        reason: "cancelled before start".into(),
                    })
                } else {
                    self.start(&spec).await
                }
            }
            Err(e) => Err(e),
        };

        match launched {
            Ok(container_id) => {
                record.container_id = Some(container_id.clone());
                let handle = ContainerHandle {
                    execution_id: record.execution_id,
                    job_id,
                    container_id: container_id.clone(),
                    container_name: record.container_name.clone(),
                };
                let advanced = record.advance(ExecutionState::Running);
                let snapshot = record.clone();
                // Tracked before anything else can fail, so cleanup owns it.
                let active = {
                    let mut active = self.active.lock().await;
                    active.insert(
                        record.execution_id,
                        ActiveExecution {
                            record,
                            exec_dir,
                            permit,
                            egress,
                        },
                    );
                    active.len()
                };
                let persisted = match advanced {
                    Ok(()) => self
                        .store
                        .update_execution(&snapshot)
                        .await
                        .map_err(ContainerError::from),
                    Err(e) => Err(e),
                };
                if let Err(e) = persisted {
                    tracing::warn!(
                        job_id = %job_id,
                        container_id = %container_id,
                        error = %e,
                        "Started container could not be recorded, tearing it down"
                    );
                    if let Err(cleanup_err) = self.cleanup(&handle).await {
                        tracing::warn!(
                            container_id = %container_id,
                            error = %cleanup_err,
                            "Cleanup after failed launch bookkeeping failed"
                        );
                    }
                    return Err(e);
                }

                self.observer.record_event(&ObserverEvent::ContainerLaunched {
                    job_id,
                    execution_id: handle.execution_id,
                    container_id,
                });
                self.observer
                    .record_metric(&ObserverMetric::ActiveContainers(active as u64));
                Ok(handle)
            }
            Err(e) => {
                let (kind, reason) = match e {
                    RuntimeError::Launch { kind, reason } => (kind, reason),
                    other => (LaunchFailureKind::Runtime, other.to_string()),
                };
                let cancelled = cancel.is_cancelled();
                record.finish(ExitStatus::LaunchFailed {
                    reason: reason.clone(),
                })?;
                remove_dir_quietly(&exec_dir).await;
                record.close();
                self.store.update_execution(&record).await?;
                drop(permit);

                self.observer.record_event(&ObserverEvent::LaunchFailed {
                    job_id,
                    execution_id: record.execution_id,
                    reason: reason.clone(),
                });
                if cancelled {
                    return Err(ContainerError::Cancelled { job_id });
                }
                Err(ContainerError::Launch {
                    job_id,
                    kind,
                    reason,
                })
            }
        }
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        if self.config.auto_pull_image {
            self.runtime.ensure_image(&spec.image).await?;
        }
        self.runtime.create_and_start(spec).await
    }

    /// Lay out the execution directory and build the container spec. An
    /// execution that may reach anything gets its egress proxy here.
    async fn prepare(
        &self,
        request: &LaunchRequest<'_>,
        record: &ExecutionRecord,
        exec_dir: &Path,
    ) -> Result<(ContainerSpec, Option<EgressProxy>), RuntimeError> {
        let setup = |e: std::io::Error| RuntimeError::Launch {
            kind: LaunchFailureKind::ResourceExhausted,
            reason: format!("cannot prepare {}: {e}", exec_dir.display()),
        };

        let output_dir = exec_dir.join("output");
        tokio::fs::create_dir_all(&output_dir).await.map_err(setup)?;
        make_world_writable(&output_dir).await.map_err(setup)?;

        let context = ExecutionContext {
            job_id: request.job_id,
            execution_id: record.execution_id,
            agent_id: &request.agent.agent_id,
            attempt: request.attempt,
            payload: request.payload,
        };
        let context_bytes = serde_json::to_vec_pretty(&context).map_err(|e| RuntimeError::Launch {
            kind: LaunchFailureKind::InvalidSpec,
            reason: format!("cannot serialize context: {e}"),
        })?;
        let context_path = exec_dir.join("context.json");
        tokio::fs::write(&context_path, context_bytes)
            .await
            .map_err(setup)?;

        let state_dir = self
            .contexts
            .agent_state_dir(&request.agent.agent_id)
            .await
            .map_err(|e| RuntimeError::Launch {
                kind: LaunchFailureKind::InvalidSpec,
                reason: format!("agent state directory: {e}"),
            })?;
        make_world_writable(&state_dir).await.map_err(setup)?;

        let mut mounts = vec![
            Mount::read_only(path_str(&context_path), CONTAINER_CONTEXT_PATH),
            Mount::read_write(path_str(&output_dir), CONTAINER_OUTPUT_DIR),
            Mount::read_write(path_str(&state_dir), CONTAINER_STATE_DIR),
        ];
        if let Some(ref code_dir) = request.agent.code_dir {
            mounts.push(Mount::read_only(path_str(code_dir), CONTAINER_AGENT_DIR));
        }

        let labels = [
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_JOB_ID.to_string(), request.job_id.to_string()),
            (
                LABEL_EXECUTION_ID.to_string(),
                record.execution_id.to_string(),
            ),
        ]
        .into_iter()
        .collect();

        let image = if request.agent.image.trim().is_empty() {
            self.config.image.clone()
        } else {
            request.agent.image.clone()
        };

        let mut extra_hosts = Vec::new();
        let (proxy, proxy_url) = if request.decision.egress.needs_network() {
            let gateway = self.runtime.ensure_network(&self.config.egress_network).await?;
            let proxy = EgressProxy::start(
                self.config.egress_proxy_bind,
                request.decision.egress.clone(),
                record.execution_id,
            )
            .await
            .map_err(|e| RuntimeError::Launch {
                kind: LaunchFailureKind::ResourceExhausted,
                reason: format!("cannot start egress proxy: {e}"),
            })?;
            let host = match (&self.config.egress_proxy_host, gateway) {
                (Some(host), _) => host.clone(),
                (None, Some(gateway)) => gateway,
                (None, None) => {
                    extra_hosts.push(format!("{DOCKER_HOST_ALIAS}:host-gateway"));
                    DOCKER_HOST_ALIAS.to_string()
                }
            };
            let url = format!("http://{host}:{}", proxy.port());
            (Some(proxy), Some(url))
        } else {
            (None, None)
        };

        let spec = ContainerSpec {
            name: record.container_name.clone(),
            image,
            cmd: vec![
                request.agent.agent_id.clone(),
                CONTAINER_CONTEXT_PATH.to_string(),
            ],
            env: self.environment(request, record, proxy_url.as_deref()),
            mounts,
            labels,
            user: self.config.user.clone(),
            network_mode: request
                .decision
                .network_mode(&self.config.egress_network)
                .to_string(),
            extra_hosts,
            limits: request.decision.limits,
            tmpfs_size: self.config.tmpfs_size.clone(),
        };
        Ok((spec, proxy))
    }

    fn environment(
        &self,
        request: &LaunchRequest<'_>,
        record: &ExecutionRecord,
        proxy_url: Option<&str>,
    ) -> Vec<String> {
        let mut env = vec![
            format!("AGENT_ID={}", request.agent.agent_id),
            format!("JOB_ID={}", request.job_id),
            format!("EXECUTION_ID={}", record.execution_id),
            format!("ATTEMPT={}", request.attempt),
        ];
        for (key, value) in request
            .agent
            .env_vars
            .iter()
            .chain(request.payload.env_vars().iter())
        {
            if is_reserved_env(key) {
                tracing::debug!(key = %key, "Dropping reserved environment variable");
                continue;
            }
            env.push(format!("{key}={value}"));
        }

        if request.decision.uses_hub() {
            if let Some(ref url) = self.config.hub_url {
                env.push(format!("AGENT_HUB_URL={url}"));
            }
            if let Some(ref key) = self.config.hub_api_key {
                env.push(format!("AGENT_HUB_API_KEY={}", key.expose_secret()));
            }
        }
        let allowlist = request.decision.egress.allowlist();
        if !allowlist.is_empty() {
            env.push(format!("AGENT_HUB_EGRESS_ALLOWLIST={}", allowlist.join(",")));
        }
        if let Some(url) = proxy_url {
            env.extend(PROXY_ENV.iter().map(|key| format!("{key}={url}")));
        }
        env
    }

    /// Block until the container exits, `timeout` elapses or `cancel` fires.
    ///
    /// On timeout or cancellation the container is force-killed. Logs are
    /// captured in every case. Returns the finished record; mapping the exit
    /// status onto a job outcome is the caller's business.
    pub async fn await_exit(
        &self,
        handle: &ContainerHandle,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionRecord, ContainerError> {
        if !self.active.lock().await.contains_key(&handle.execution_id) {
            return Err(ContainerError::NotFound {
                container_id: handle.container_id.clone(),
            });
        }

        let status = tokio::select! {
            waited = self.runtime.wait(&handle.container_id) => match waited {
                Ok(code) => ExitStatus::Exited { code },
                Err(e) => {
                    tracing::warn!(
                        job_id = %handle.job_id,
                        container_id = %handle.container_id,
                        error = %e,
                        "Lost track of container"
                    );
                    ExitStatus::Lost
                }
            },
            _ = tokio::time::sleep(timeout) => {
                self.kill_quietly(handle).await;
                ExitStatus::TimedOut
            }
            _ = cancel.cancelled() => {
                self.kill_quietly(handle).await;
                ExitStatus::Cancelled
            }
        };

        let (stdout_ref, stderr_ref) = self.capture_logs(handle).await;

        let record = {
            let mut active = self.active.lock().await;
            let entry = active
                .get_mut(&handle.execution_id)
                .ok_or_else(|| ContainerError::NotFound {
                    container_id: handle.container_id.clone(),
                })?;
            entry.record.stdout_ref = stdout_ref;
            entry.record.stderr_ref = stderr_ref;
            entry.record.finish(status.clone())?;
            entry.record.clone()
        };
        self.store.update_execution(&record).await?;

        let duration = record
            .ended_at
            .unwrap_or_else(Utc::now)
            .signed_duration_since(record.started_at)
            .to_std()
            .unwrap_or_default();
        self.observer.record_event(&ObserverEvent::ContainerExited {
            job_id: handle.job_id,
            execution_id: handle.execution_id,
            status: status.to_string(),
            duration,
        });
        self.observer
            .record_metric(&ObserverMetric::ExecutionLatency(duration));
        Ok(record)
    }

    async fn kill_quietly(&self, handle: &ContainerHandle) {
        if let Err(e) = self.runtime.kill(&handle.container_id).await {
            tracing::warn!(
                container_id = %handle.container_id,
                error = %e,
                "Failed to kill container"
            );
        }
    }

    async fn capture_logs(&self, handle: &ContainerHandle) -> (Option<String>, Option<String>) {
        let logs = match self.runtime.logs(&handle.container_id).await {
            Ok(logs) => logs,
            Err(e) => {
                tracing::debug!(container_id = %handle.container_id, error = %e, "No logs captured");
                return (None, None);
            }
        };
        let max = self.config.max_log_bytes;
        let mut refs = [None, None];
        for (slot, (stream, content)) in refs
            .iter_mut()
            .zip([(LogStream::Stdout, &logs.stdout), (LogStream::Stderr, &logs.stderr)])
        {
            if content.is_empty() {
                continue;
            }
            let content = truncate_log_tail(content, max);
            match self
                .contexts
                .write_log(handle.job_id, handle.execution_id, stream, &content)
                .await
            {
                Ok(reference) => *slot = Some(reference),
                Err(e) => tracing::warn!(
                    execution_id = %handle.execution_id,
                    error = %e,
                    "Failed to store container log"
                ),
            }
        }
        let [stdout, stderr] = refs;
        (stdout, stderr)
    }

    /// Read, validate and persist the result document a finished agent wrote.
    pub async fn collect_result(&self, handle: &ContainerHandle) -> Result<ResultRef, ContainerError> {
        let (exec_dir, agent_id) = {
            let active = self.active.lock().await;
            let entry = active
                .get(&handle.execution_id)
                .ok_or_else(|| ContainerError::NotFound {
                    container_id: handle.container_id.clone(),
                })?;
            (entry.exec_dir.clone(), entry.record.agent_id.clone())
        };

        let invalid = |reason: String| ContainerError::ResultInvalid {
            job_id: handle.job_id,
            reason,
        };
        let path = exec_dir.join("output").join("result.json");
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(invalid("agent exited without writing result.json".into()));
            }
            Err(e) => return Err(e.into()),
        };
        let max = self.config.max_result_bytes;
        if meta.len() > max as u64 {
            return Err(invalid(format!(
                "result is {} bytes, limit is {max}",
                meta.len()
            )));
        }

        let raw = tokio::fs::read(&path).await?;
        let output = ExecutionOutput::parse(&raw, handle.execution_id, &agent_id, max).map_err(invalid)?;
        let reference = self
            .contexts
            .write_result(handle.job_id, handle.execution_id, &output)
            .await?;

        self.observer.record_event(&ObserverEvent::ResultCollected {
            job_id: handle.job_id,
            execution_id: handle.execution_id,
            result_ref: reference.to_string(),
        });
        Ok(reference)
    }

    /// Remove the container and its scratch space, close the record and
    /// release the slot. Calling it again for the same handle does nothing.
    ///
    /// If the runtime keeps refusing the removal, the slot stays taken until
    /// a later sweep or [`reap_orphans`](Self::reap_orphans) gets rid of the
    /// container.
    pub async fn cleanup(&self, handle: &ContainerHandle) -> Result<(), ContainerError> {
        let Some(entry) = self.active.lock().await.remove(&handle.execution_id) else {
            return Ok(());
        };
        let ActiveExecution {
            mut record,
            exec_dir,
            permit,
            egress,
        } = entry;
        drop(egress);

        let removed = self.remove_with_retry(&handle.container_id).await;
        remove_dir_quietly(&exec_dir).await;

        if record.state == ExecutionState::Running {
            // Cleaned up without ever being awaited.
            record.finish(ExitStatus::Cancelled)?;
        }
        record.close();
        let stored = self.store.update_execution(&record).await;
        if removed {
            drop(permit);
        } else {
            tracing::warn!(
                container_id = %handle.container_id,
                "Container could not be removed, keeping its slot until it is"
            );
            self.unremoved
                .lock()
                .await
                .insert(handle.container_id.clone(), permit);
        }
        let remaining = self.active.lock().await.len();

        self.observer.record_event(&ObserverEvent::ContainerCleanedUp {
            job_id: handle.job_id,
            execution_id: handle.execution_id,
        });
        self.observer
            .record_metric(&ObserverMetric::ActiveContainers(remaining as u64));
        stored.map_err(ContainerError::from)
    }

    /// Returns whether the container is gone.
    async fn remove_with_retry(&self, container_id: &str) -> bool {
        for attempt in 1..=REMOVE_ATTEMPTS {
            match self.runtime.remove(container_id).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => return true,
                Err(e) => {
                    tracing::warn!(
                        container_id = %container_id,
                        attempt,
                        error = %e,
                        "Failed to remove container"
                    );
                    if attempt < REMOVE_ATTEMPTS {
                        tokio::time::sleep(REMOVE_RETRY_DELAY * attempt).await;
                    }
                }
            }
        }
        false
    }

    /// Retry removal of parked containers, releasing the slot of each one
    /// that is finally gone.
    pub async fn sweep_unremoved(&self) {
        let ids: Vec<String> = self.unremoved.lock().await.keys().cloned().collect();
        for id in ids {
            match self.runtime.remove(&id).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {
                    self.unremoved.lock().await.remove(&id);
                    tracing::info!(container_id = %id, "Removed previously stuck container");
                }
                Err(e) => {
                    tracing::debug!(container_id = %id, error = %e, "Container still not removable");
                }
            }
        }
    }

    /// Containers parked after a failed removal.
    pub async fn unremoved_containers(&self) -> usize {
        self.unremoved.lock().await.len()
    }

    /// Kill and remove every managed container no live execution owns.
    ///
    /// Returns the ids that were reaped.
    pub async fn reap_orphans(&self) -> Result<Vec<String>, ContainerError> {
        let live = self.runtime.list_labelled(LABEL_MANAGED, "true").await?;
        let owned: HashSet<String> = self
            .active
            .lock()
            .await
            .values()
            .filter_map(|a| a.record.container_id.clone())
            .collect();

        let mut reaped = Vec::new();
        for container in live {
            if owned.contains(&container.id) {
                continue;
            }
            if let Err(e) = self.runtime.kill(&container.id).await {
                tracing::debug!(container_id = %container.id, error = %e, "Kill before reap failed");
            }
            match self.runtime.remove(&container.id).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(container_id = %container.id, error = %e, "Failed to reap orphan");
                    continue;
                }
            }
            self.unremoved.lock().await.remove(&container.id);
            tracing::info!(container_id = %container.id, name = %container.name, "Reaped orphaned container");
            self.observer.record_event(&ObserverEvent::OrphanReaped {
                container_id: container.id.clone(),
            });
            reaped.push(container.id);
        }
        Ok(reaped)
    }

    /// Close execution records a previous process left open.
    ///
    /// Returns how many were closed.
    pub async fn close_stale_records(&self) -> Result<usize, ContainerError> {
        let open = self.store.open_executions().await?;
        let owned: HashSet<Uuid> = self.active.lock().await.keys().copied().collect();

        let mut closed = 0;
        for mut record in open {
            if owned.contains(&record.execution_id) {
                continue;
            }
            match record.state {
                ExecutionState::Created => record.finish(ExitStatus::LaunchFailed {
                    reason: "orchestrator restarted during launch".into(),
                })?,
                ExecutionState::Running => record.finish(ExitStatus::Lost)?,
                _ => {}
            }
            record.close();
            self.store.update_execution(&record).await?;
            remove_dir_quietly(&self.config.work_dir.join(record.execution_id.to_string())).await;
            closed += 1;
        }
        Ok(closed)
    }

    /// Release every remaining execution. Used on shutdown.
    pub async fn cleanup_all(&self) {
        let handles: Vec<ContainerHandle> = self
            .active
            .lock()
            .await
            .values()
            .filter_map(|a| a.record.handle())
            .collect();
        for handle in handles {
            if let Err(e) = self.cleanup(&handle).await {
                tracing::warn!(execution_id = %handle.execution_id, error = %e, "Cleanup on shutdown failed");
            }
        }
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn remove_dir_quietly(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %dir.display(), error = %e, "Failed to remove execution directory"),
    }
}

/// The agent runs as an unprivileged uid that does not own the host dirs.
#[cfg(unix)]
async fn make_world_writable(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777)).await
}

#[cfg(not(unix))]
async fn make_world_writable(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
