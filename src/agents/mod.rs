//! Agent descriptors and the registry they are resolved from.
//!
//! An agent is an opaque, untrusted payload. The orchestrator only cares
//! about what image to run it in, how much it may consume, and which
//! external integrations it asks for.

mod registry;

pub use registry::{AgentManifest, AgentRegistry, FsAgentRegistry, InMemoryAgentRegistry};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// External capability an agent may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Integration {
    /// Post chat messages back to the hub.
    HubMessages,
    /// Call the hub's LLM service.
    HubLlm,
    /// Invoke another agent through the hub.
    AgentInvoke,
    /// Outbound HTTP(S) to arbitrary public hosts.
    HttpEgress,
    AwsSdk,
    GcpSdk,
    AzureSdk,
}

impl Integration {
    pub const ALL: [Integration; 7] = [
        Integration::HubMessages,
        Integration::HubLlm,
        Integration::AgentInvoke,
        Integration::HttpEgress,
        Integration::AwsSdk,
        Integration::GcpSdk,
        Integration::AzureSdk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HubMessages => "hub_messages",
            Self::HubLlm => "hub_llm",
            Self::AgentInvoke => "agent_invoke",
            Self::HttpEgress => "http_egress",
            Self::AwsSdk => "aws_sdk",
            Self::GcpSdk => "gcp_sdk",
            Self::AzureSdk => "azure_sdk",
        }
    }

    /// Whether this integration is served by the hub callback endpoint.
    pub fn uses_hub(&self) -> bool {
        matches!(self, Self::HubMessages | Self::HubLlm | Self::AgentInvoke)
    }

    /// Domains (and their subdomains) this integration talks to directly.
    pub fn egress_domains(&self) -> &'static [&'static str] {
        match self {
            Self::AwsSdk => &["amazonaws.com"],
            Self::GcpSdk => &["googleapis.com"],
            Self::AzureSdk => &["azure.com", "windows.net"],
            Self::HubMessages | Self::HubLlm | Self::AgentInvoke | Self::HttpEgress => &[],
        }
    }
}

impl fmt::Display for Integration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Integration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        Integration::ALL
            .into_iter()
            .find(|i| i.as_str() == needle)
            .ok_or_else(|| format!("unknown integration '{s}'"))
    }
}

/// CPU, memory and wall-clock ceilings for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    /// Thousandths of a CPU (500 = half a core).
    pub cpu_millis: u64,
    pub timeout_secs: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 256,
            cpu_millis: 500,
            timeout_secs: 300,
        }
    }
}

impl ResourceLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb.saturating_mul(1024 * 1024)).min(i64::MAX as u64) as i64
    }

    /// CPU quota in units of 10^-9 CPUs, as the Docker API expects.
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_millis.saturating_mul(1_000_000)).min(i64::MAX as u64) as i64
    }

    /// Reject zero limits; a zero timeout or memory cap is never intended.
    pub fn validate(&self) -> Result<(), String> {
        if self.memory_mb == 0 {
            return Err("memory_mb must be greater than zero".into());
        }
        if self.cpu_millis == 0 {
            return Err("cpu_millis must be greater than zero".into());
        }
        if self.timeout_secs == 0 {
            return Err("timeout_secs must be greater than zero".into());
        }
        Ok(())
    }

    /// Whether every dimension is at or below `ceiling`.
    pub fn fits_within(&self, ceiling: &ResourceLimits) -> bool {
        self.memory_mb <= ceiling.memory_mb
            && self.cpu_millis <= ceiling.cpu_millis
            && self.timeout_secs <= ceiling.timeout_secs
    }
}

/// Everything the dispatcher needs to know to launch an agent.
///
/// Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: String,
    pub name: String,
    pub version: String,
    pub image: String,
    pub resource_limits: ResourceLimits,
    pub allowed_integrations: BTreeSet<Integration>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    /// Host directory holding the agent's code, mounted read-only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_dir: Option<PathBuf>,
}

impl AgentDescriptor {
    /// Minimal descriptor, mostly useful for tests and embedding.
    pub fn new(agent_id: impl Into<String>, image: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self {
            name: agent_id.clone(),
            agent_id,
            version: "0.0.0".into(),
            image: image.into(),
            resource_limits: ResourceLimits::default(),
            allowed_integrations: BTreeSet::new(),
            env_vars: BTreeMap::new(),
            code_dir: None,
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn with_integration(mut self, integration: Integration) -> Self {
        self.allowed_integrations.insert(integration);
        self
    }

    pub fn with_code_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.code_dir = Some(dir.into());
        self
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        validate_agent_id(&self.agent_id)?;
        if self.image.trim().is_empty() {
            return Err(AgentError::InvalidDescriptor {
                agent_id: self.agent_id.clone(),
                reason: "image must not be empty".into(),
            });
        }
        self.resource_limits
            .validate()
            .map_err(|reason| AgentError::InvalidDescriptor {
                agent_id: self.agent_id.clone(),
                reason,
            })
    }
}

static AGENT_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$").unwrap());

/// Agent ids become directory and container names, so keep them tame.
pub fn validate_agent_id(agent_id: &str) -> Result<(), AgentError> {
    if AGENT_ID_PATTERN.is_match(agent_id) && !agent_id.contains("..") {
        Ok(())
    } else {
        Err(AgentError::InvalidDescriptor {
            agent_id: agent_id.to_string(),
            reason: "agent id must be 1-64 characters of [A-Za-z0-9_.-]".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integration_parses_snake_case() {
        assert_eq!("aws_sdk".parse::<Integration>().unwrap(), Integration::AwsSdk);
        assert_eq!(" HUB_LLM ".parse::<Integration>().unwrap(), Integration::HubLlm);
        assert!("ftp".parse::<Integration>().is_err());
    }

    #[test]
    fn limits_fit_within_ceiling() {
        let ceiling = ResourceLimits {
            memory_mb: 1024,
            cpu_millis: 2000,
            timeout_secs: 600,
        };
        assert!(ResourceLimits::default().fits_within(&ceiling));
        let greedy = ResourceLimits {
            memory_mb: 4096,
            ..ResourceLimits::default()
        };
        assert!(!greedy.fits_within(&ceiling));
    }

    #[test]
    fn docker_units() {
        let limits = ResourceLimits {
            memory_mb: 256,
            cpu_millis: 500,
            timeout_secs: 1,
        };
        assert_eq!(limits.memory_bytes(), 256 * 1024 * 1024);
        assert_eq!(limits.nano_cpus(), 500_000_000);
    }

    #[test]
    fn zero_limits_are_invalid() {
        let limits = ResourceLimits {
            timeout_secs: 0,
            ..ResourceLimits::default()
        };
        assert!(limits.validate().is_err());
    }

    #[test]
    fn agent_id_rejects_traversal() {
        assert!(validate_agent_id("weather-bot_2").is_ok());
        assert!(validate_agent_id("../etc").is_err());
        assert!(validate_agent_id("a/b").is_err());
        assert!(validate_agent_id("").is_err());
        assert!(validate_agent_id("a..b").is_err());
    }

    #[test]
    fn descriptor_requires_image() {
        let desc = AgentDescriptor::new("echo", " ");
        assert!(matches!(
            desc.validate(),
            Err(AgentError::InvalidDescriptor { .. })
        ));
    }
}
