//! Container runtime detection with platform-specific guidance.
//!
//! Used by `agent-hub health` and at startup to tell an operator whether
//! Docker or Podman is installed and answering, and what to do if not.
//! `DOCKER_HOST` is honoured through bollard's defaults; rootless and
//! desktop sockets are covered by [`connect_docker`](crate::sandbox::connect_docker).

use std::fmt;

/// Which container engine binary was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Docker,
    Podman,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Podman => "podman",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuntimeKind::Docker => "Docker",
            RuntimeKind::Podman => "Podman",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerStatus {
    /// Binary on PATH and the daemon answers a ping.
    Available,
    NotInstalled,
    /// Binary found but the daemon is not answering.
    NotRunning,
}

impl DockerStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, DockerStatus::Available)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DockerStatus::Available => "available",
            DockerStatus::NotInstalled => "not installed",
            DockerStatus::NotRunning => "not running",
        }
    }
}

/// Host platform, for install guidance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOS,
    Linux,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "macos" => Platform::MacOS,
            "windows" => Platform::Windows,
            _ => Platform::Linux,
        }
    }

    pub fn install_hint(&self) -> &'static str {
        match self {
            Platform::MacOS => {
                "Install Docker Desktop: https://docs.docker.com/desktop/install/mac-install/\n\
                 or Podman Desktop: https://podman-desktop.io/"
            }
            Platform::Linux => {
                "Install Docker Engine: https://docs.docker.com/engine/install/\n\
                 or Podman: https://podman.io/docs/installation#installing-on-linux"
            }
            Platform::Windows => {
                "Install Docker Desktop: https://docs.docker.com/desktop/install/windows-install/\n\
                 or Podman Desktop: https://podman-desktop.io/"
            }
        }
    }

    pub fn start_hint(&self) -> &'static str {
        match self {
            Platform::MacOS => {
                "Start Docker Desktop (open -a Docker), or run: podman machine start"
            }
            Platform::Linux => {
                "Start Docker: sudo systemctl start docker, \
                 or Podman: systemctl --user start podman.socket"
            }
            Platform::Windows => "Start Docker Desktop or Podman Desktop from the Start menu",
        }
    }
}

/// Result of [`check_docker`].
#[derive(Debug, Clone, Copy)]
pub struct DockerDetection {
    pub status: DockerStatus,
    pub platform: Platform,
    /// Set whenever a binary was found.
    pub runtime: Option<RuntimeKind>,
}

impl DockerDetection {
    /// What the operator should do next, if anything.
    pub fn hint(&self) -> Option<&'static str> {
        match self.status {
            DockerStatus::Available => None,
            DockerStatus::NotInstalled => Some(self.platform.install_hint()),
            DockerStatus::NotRunning => Some(self.platform.start_hint()),
        }
    }
}

/// Check whether Docker or Podman is installed and answering.
///
/// Docker wins when both binaries are present.
pub async fn check_docker() -> DockerDetection {
    let platform = Platform::current();

    let runtime = if binary_exists("docker") {
        Some(RuntimeKind::Docker)
    } else if binary_exists("podman") {
        Some(RuntimeKind::Podman)
    } else {
        None
    };
    let Some(kind) = runtime else {
        return DockerDetection {
            status: DockerStatus::NotInstalled,
            platform,
            runtime: None,
        };
    };

    let status = if crate::sandbox::connect_docker().await.is_ok() {
        DockerStatus::Available
    } else {
        DockerStatus::NotRunning
    };
    DockerDetection {
        status,
        platform,
        runtime: Some(kind),
    }
}

fn binary_exists(name: &str) -> bool {
    let finder = if cfg!(windows) { "where" } else { "which" };
    std::process::Command::new(finder)
        .arg(name)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_exist_for_every_platform() {
        for platform in [Platform::MacOS, Platform::Linux, Platform::Windows] {
            assert!(!platform.install_hint().is_empty());
            assert!(!platform.start_hint().is_empty());
        }
    }

    #[test]
    fn status_strings() {
        assert_eq!(DockerStatus::Available.as_str(), "available");
        assert_eq!(DockerStatus::NotRunning.as_str(), "not running");
        assert!(DockerStatus::Available.is_ok());
        assert!(!DockerStatus::NotInstalled.is_ok());
    }

    #[test]
    fn hint_follows_status() {
        let detection = DockerDetection {
            status: DockerStatus::NotRunning,
            platform: Platform::Linux,
            runtime: Some(RuntimeKind::Docker),
        };
        assert_eq!(detection.hint(), Some(Platform::Linux.start_hint()));
        assert_eq!(RuntimeKind::Podman.to_string(), "Podman");
    }

    #[tokio::test]
    async fn detection_is_consistent() {
        let result = check_docker().await;
        match result.status {
            DockerStatus::NotInstalled => assert!(result.runtime.is_none()),
            DockerStatus::Available | DockerStatus::NotRunning => {
                assert!(result.runtime.is_some())
            }
        }
    }
}
