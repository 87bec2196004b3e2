//! [`ContainerRuntime`] over the Docker Engine API.
//!
//! Podman's Docker-compatible socket works too; see [`connect_docker`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use futures::{StreamExt, TryStreamExt};
use tokio::sync::RwLock;

use crate::error::{LaunchFailureKind, RuntimeError};
use crate::sandbox::connect_docker;
use crate::sandbox::runtime::{
    CONTAINER_WORKSPACE, CapturedLogs, ContainerRuntime, ContainerSpec, LABEL_MANAGED,
    LiveContainer,
};

/// Docker-backed runtime with a lazily established, cached connection.
#[derive(Clone, Default)]
pub struct DockerRuntime {
    docker: Arc<RwLock<Option<Docker>>>,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an already connected client.
    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker: Arc::new(RwLock::new(Some(docker))),
        }
    }

    async fn docker(&self) -> Result<Docker, RuntimeError> {
        {
            let guard = self.docker.read().await;
            if let Some(ref d) = *guard {
                return Ok(d.clone());
            }
        }
        let docker = connect_docker().await?;
        *self.docker.write().await = Some(docker.clone());
        Ok(docker)
    }

    fn host_config(spec: &ContainerSpec) -> HostConfig {
        let binds: Vec<String> = spec.mounts.iter().map(|m| m.to_bind()).collect();
        HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            memory: Some(spec.limits.memory_bytes()),
            // No swap beyond the memory cap.
            memory_swap: Some(spec.limits.memory_bytes()),
            nano_cpus: Some(spec.limits.nano_cpus()),
            network_mode: Some(spec.network_mode.clone()),
            extra_hosts: if spec.extra_hosts.is_empty() {
                None
            } else {
                Some(spec.extra_hosts.clone())
            },
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            readonly_rootfs: Some(true),
            tmpfs: Some(
                [(
                    "/tmp".to_string(),
                    format!("size={},noexec,nosuid", spec.tmpfs_size),
                )]
                .into_iter()
                .collect(),
            ),
            pids_limit: Some(256),
            ..Default::default()
        }
    }
}

/// Map a create/start failure onto a launch failure kind.
fn classify_launch(err: &BollardError) -> LaunchFailureKind {
    if let BollardError::DockerResponseServerError {
        status_code,
        message,
    } = err
    {
        let lower = message.to_lowercase();
        if lower.contains("no space left")
            || lower.contains("cannot allocate memory")
            || lower.contains("out of memory")
            || lower.contains("resource temporarily unavailable")
        {
            return LaunchFailureKind::ResourceExhausted;
        }
        return match status_code {
            404 if lower.contains("image") => LaunchFailureKind::ImagePull,
            400 => LaunchFailureKind::InvalidSpec,
            _ => LaunchFailureKind::Runtime,
        };
    }
    LaunchFailureKind::Runtime
}

fn status_code(err: &BollardError) -> Option<u16> {
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn api_error(container_id: &str, err: BollardError) -> RuntimeError {
    match status_code(&err) {
        Some(404) => RuntimeError::NotFound(container_id.to_string()),
        _ => RuntimeError::Api(err.to_string()),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;
        if docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        tracing::info!(image, "Pulling agent image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| RuntimeError::Launch {
                kind: LaunchFailureKind::ImagePull,
                reason: format!("pull {image}: {e}"),
            })?;
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<Option<String>, RuntimeError> {
        let docker = self.docker().await?;
        let network = match docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(network) => network,
            Err(e) if status_code(&e) == Some(404) => {
                let options = CreateNetworkOptions {
                    name: name.to_string(),
                    driver: "bridge".to_string(),
                    internal: true,
                    labels: [(LABEL_MANAGED.to_string(), "true".to_string())]
                        .into_iter()
                        .collect(),
                    ..Default::default()
                };
                docker
                    .create_network(options)
                    .await
                    .map_err(|e| RuntimeError::Api(format!("create network {name}: {e}")))?;
                tracing::info!(network = name, "Created internal egress network");
                docker
                    .inspect_network(name, None::<InspectNetworkOptions<String>>)
                    .await
                    .map_err(|e| RuntimeError::Api(format!("inspect network {name}: {e}")))?
            }
            Err(e) => return Err(RuntimeError::Api(format!("inspect network {name}: {e}"))),
        };

        if network.internal != Some(true) {
            return Err(RuntimeError::Launch {
                kind: LaunchFailureKind::InvalidSpec,
                reason: format!("network {name} exists but is not internal"),
            });
        }
        Ok(network
            .ipam
            .and_then(|ipam| ipam.config)
            .and_then(|configs| configs.into_iter().find_map(|c| c.gateway)))
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let docker = self.docker().await?;

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            user: Some(spec.user.clone()),
            working_dir: Some(CONTAINER_WORKSPACE.to_string()),
            network_disabled: Some(spec.network_mode == "none"),
            host_config: Some(Self::host_config(spec)),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RuntimeError::Launch {
                kind: classify_launch(&e),
                reason: e.to_string(),
            })?;
        let container_id = response.id;

        if let Err(e) = docker.start_container::<String>(&container_id, None).await {
            let kind = classify_launch(&e);
            if let Err(rm) = self.remove(&container_id).await {
                tracing::warn!(
                    container_id = %container_id,
                    error = %rm,
                    "Failed to remove container that never started"
                );
            }
            return Err(RuntimeError::Launch {
                kind,
                reason: format!("failed to start container: {e}"),
            });
        }

        tracing::debug!(container_id = %container_id, name = %spec.name, "Container started");
        Ok(container_id)
    }

    async fn wait(&self, container_id: &str) -> Result<i64, RuntimeError> {
        let docker = self.docker().await?;
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = docker.wait_container(container_id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(api_error(container_id, e)),
            None => Err(RuntimeError::Api(format!(
                "wait stream for {container_id} ended without a status"
            ))),
        }
    }

    async fn kill(&self, container_id: &str) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;
        match docker
            .kill_container(
                container_id,
                Some(KillContainerOptions { signal: "SIGKILL" }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // 409: not running any more.
            Err(e) if status_code(&e) == Some(409) => Ok(()),
            Err(e) => Err(api_error(container_id, e)),
        }
    }

    async fn logs(&self, container_id: &str) -> Result<CapturedLogs, RuntimeError> {
        let docker = self.docker().await?;
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = docker.logs(container_id, Some(options));
        let mut captured = CapturedLogs::default();
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(|e| api_error(container_id, e))? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    captured.stdout.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdErr { message } => {
                    captured.stderr.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(captured)
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;
        docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| api_error(container_id, e))
    }

    async fn list_labelled(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<LiveContainer>, RuntimeError> {
        let docker = self.docker().await?;
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{label}={value}")]);
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        let summaries = docker
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::Api(e.to_string()))?;

        Ok(summaries
            .into_iter()
            .filter_map(|s| {
                let id = s.id?;
                let name = s
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                Some(LiveContainer {
                    id,
                    name,
                    labels: s.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;
        docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))
    }
}
