use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use secrecy::SecretString;

use crate::agents::ResourceLimits;
use crate::bootstrap::agent_hub_base_dir;
use crate::config::helpers::{optional_env, parse_bool_env, parse_optional_env};
use crate::error::ConfigError;

/// Container runtime configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Image used when an agent does not name its own.
    pub image: String,
    /// Limits applied when an agent does not declare its own.
    pub default_limits: ResourceLimits,
    /// uid:gid the agent runs as. Never root.
    pub user: String,
    /// Host directory for per-execution scratch space.
    pub work_dir: PathBuf,
    /// Whether to pull the image if it is not present locally.
    pub auto_pull_image: bool,
    /// Size cap on `/tmp` inside the container.
    pub tmpfs_size: String,
    /// Largest result document accepted from an agent.
    pub max_result_bytes: usize,
    /// Captured stdout/stderr are truncated to this many bytes each.
    pub max_log_bytes: usize,
    /// Hub callback endpoint handed to agents granted hub integrations.
    pub hub_url: Option<String>,
    /// Credential for the hub callback. Injected at launch, never stored.
    pub hub_api_key: Option<SecretString>,
    /// Internal network joined by containers that may reach any host. It
    /// has no route out; traffic leaves only through the egress proxy.
    pub egress_network: String,
    /// Host address each execution's egress proxy listens on.
    pub egress_proxy_bind: IpAddr,
    /// Address containers dial to reach the proxy. Defaults to the egress
    /// network's gateway.
    pub egress_proxy_host: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "agent-runtime:latest".to_string(),
            default_limits: ResourceLimits::default(),
            user: "1000:1000".to_string(),
            work_dir: agent_hub_base_dir().join("work"),
            auto_pull_image: true,
            tmpfs_size: "64M".to_string(),
            max_result_bytes: 10 * 1024 * 1024,
            max_log_bytes: 64 * 1024,
            hub_url: None,
            hub_api_key: None,
            egress_network: "agent-hub-egress".to_string(),
            egress_proxy_bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            egress_proxy_host: None,
        }
    }
}

impl SandboxConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let default_limits = ResourceLimits {
            memory_mb: parse_optional_env(
                "SANDBOX_MEMORY_LIMIT_MB",
                defaults.default_limits.memory_mb,
            )?,
            cpu_millis: parse_optional_env("SANDBOX_CPU_MILLIS", defaults.default_limits.cpu_millis)?,
            timeout_secs: parse_optional_env(
                "SANDBOX_TIMEOUT_SECS",
                defaults.default_limits.timeout_secs,
            )?,
        };
        default_limits
            .validate()
            .map_err(|message| ConfigError::InvalidValue {
                key: "SANDBOX_*_LIMIT".to_string(),
                message,
            })?;

        let user = optional_env("SANDBOX_USER")?.unwrap_or(defaults.user);
        if user == "0" || user.starts_with("0:") || user == "root" {
            return Err(ConfigError::InvalidValue {
                key: "SANDBOX_USER".to_string(),
                message: "agents must not run as root".to_string(),
            });
        }

        let hub_url = optional_env("AGENT_HUB_CALLBACK_URL")?;
        if let Some(ref raw) = hub_url {
            url::Url::parse(raw).map_err(|e| ConfigError::InvalidValue {
                key: "AGENT_HUB_CALLBACK_URL".to_string(),
                message: e.to_string(),
            })?;
        }

        let egress_network =
            optional_env("SANDBOX_EGRESS_NETWORK")?.unwrap_or(defaults.egress_network);
        if matches!(egress_network.as_str(), "none" | "bridge" | "host" | "") {
            return Err(ConfigError::InvalidValue {
                key: "SANDBOX_EGRESS_NETWORK".to_string(),
                message: format!("'{egress_network}' is not a dedicated network"),
            });
        }

        Ok(Self {
            image: optional_env("SANDBOX_IMAGE")?.unwrap_or(defaults.image),
            default_limits,
            user,
            work_dir: optional_env("SANDBOX_WORK_DIR")?
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            auto_pull_image: parse_bool_env("SANDBOX_AUTO_PULL", defaults.auto_pull_image)?,
            tmpfs_size: optional_env("SANDBOX_TMPFS_SIZE")?.unwrap_or(defaults.tmpfs_size),
            max_result_bytes: parse_optional_env(
                "SANDBOX_MAX_RESULT_BYTES",
                defaults.max_result_bytes,
            )?,
            max_log_bytes: parse_optional_env("SANDBOX_MAX_LOG_BYTES", defaults.max_log_bytes)?,
            hub_url,
            hub_api_key: optional_env("AGENT_HUB_API_KEY")?.map(SecretString::from),
            egress_network,
            egress_proxy_bind: parse_optional_env(
                "SANDBOX_EGRESS_PROXY_BIND",
                defaults.egress_proxy_bind,
            )?,
            egress_proxy_host: optional_env("SANDBOX_EGRESS_PROXY_HOST")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::helpers::ENV_MUTEX;

    #[test]
    fn defaults_follow_platform_runtime() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.image, "agent-runtime:latest");
        assert_eq!(cfg.default_limits.memory_mb, 256);
        assert_eq!(cfg.default_limits.timeout_secs, 300);
        assert_eq!(cfg.user, "1000:1000");
        assert_eq!(cfg.egress_network, "agent-hub-egress");
        assert!(cfg.egress_proxy_host.is_none());
    }

    #[test]
    fn egress_network_must_be_dedicated() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        // SAFETY: Under ENV_MUTEX.
        unsafe { std::env::set_var("SANDBOX_EGRESS_NETWORK", "bridge") };
        let err = SandboxConfig::resolve().unwrap_err();
        assert!(err.to_string().contains("SANDBOX_EGRESS_NETWORK"));
        unsafe { std::env::remove_var("SANDBOX_EGRESS_NETWORK") };
    }

    #[test]
    fn root_user_is_rejected() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        // SAFETY: Under ENV_MUTEX.
        unsafe { std::env::set_var("SANDBOX_USER", "0:0") };
        let err = SandboxConfig::resolve().unwrap_err();
        assert!(err.to_string().contains("root"));
        unsafe { std::env::remove_var("SANDBOX_USER") };
    }
}
