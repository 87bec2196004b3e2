//! Container lifecycle: isolated execution of untrusted agents.
//!
//! ```text
//! ContainerManager ──► ContainerRuntime ──► Docker / Podman (bollard)
//!        │                                  ScriptedRuntime (tests)
//!        ├──► ExecutionStore (one record per attempt)
//!        └──► EgressProxy (one per execution with network access)
//! ```
//!
//! Every launched container is labelled so crash recovery can find
//! instances nobody owns any more.

pub mod detect;
mod docker;
mod manager;
mod proxy;
mod record;
pub mod runtime;
pub mod testing;

pub use detect::{DockerDetection, DockerStatus, Platform, RuntimeKind, check_docker};
pub use docker::DockerRuntime;
pub use manager::{ContainerManager, LaunchRequest};
pub use proxy::EgressProxy;
pub use record::{ContainerHandle, ExecutionRecord, ExecutionState, ExitStatus, container_name};
pub use runtime::{CapturedLogs, ContainerRuntime, ContainerSpec, LiveContainer, Mount};

use bollard::{API_DEFAULT_VERSION, Docker};

use crate::error::RuntimeError;

/// Seconds bollard waits on a single API call.
const DOCKER_TIMEOUT_SECS: u64 = 120;

/// Connect to the local container daemon.
///
/// Tries bollard's defaults first (`DOCKER_HOST`, then the platform socket),
/// then the sockets rootless Docker, Docker Desktop, OrbStack and Podman
/// listen on. Each candidate must answer a ping.
pub async fn connect_docker() -> Result<Docker, RuntimeError> {
    let mut last_error = match Docker::connect_with_local_defaults() {
        Ok(docker) => match docker.ping().await {
            Ok(_) => return Ok(docker),
            Err(e) => e.to_string(),
        },
        Err(e) => e.to_string(),
    };

    for socket in fallback_sockets() {
        if !socket.exists() {
            continue;
        }
        let path = socket.to_string_lossy();
        match Docker::connect_with_socket(&path, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION) {
            Ok(docker) => match docker.ping().await {
                Ok(_) => {
                    tracing::debug!(socket = %path, "Connected to container daemon");
                    return Ok(docker);
                }
                Err(e) => last_error = format!("{path}: {e}"),
            },
            Err(e) => last_error = format!("{path}: {e}"),
        }
    }

    Err(RuntimeError::Unavailable(last_error))
}

#[cfg(unix)]
fn fallback_sockets() -> Vec<std::path::PathBuf> {
    let mut sockets = Vec::new();
    if let Some(home) = dirs::home_dir() {
        sockets.push(home.join(".docker/run/docker.sock"));
        sockets.push(home.join(".orbstack/run/docker.sock"));
    }
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        let runtime_dir = std::path::PathBuf::from(runtime_dir);
        sockets.push(runtime_dir.join("docker.sock"));
        sockets.push(runtime_dir.join("podman/podman.sock"));
    } else if let Ok(uid) = std::env::var("UID") {
        sockets.push(std::path::PathBuf::from(format!("/run/user/{uid}/docker.sock")));
        sockets.push(std::path::PathBuf::from(format!(
            "/run/user/{uid}/podman/podman.sock"
        )));
    }
    sockets.push("/run/podman/podman.sock".into());
    sockets
}

#[cfg(not(unix))]
fn fallback_sockets() -> Vec<std::path::PathBuf> {
    Vec::new()
}
