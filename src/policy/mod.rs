//! Security policy gate.
//!
//! Consulted before every launch. Decides whether an agent may run, which of
//! its requested integrations are granted, the limits it runs under, and the
//! egress policy its container gets. Decisions are never cached: a policy
//! change takes effect on the next launch.

mod egress;
mod requirements;
mod source;

pub use egress::{
    EgressPolicy, NetworkDecision, NetworkPolicyDecider, NetworkRequest, is_internal_host,
};
pub use requirements::{REQUIREMENTS_FILE, package_name, restricted_in, scan_requirements};
pub use source::{
    FindingKind, SourceFinding, SourceRules, describe_findings, scan_python, scan_source,
};

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::agents::{AgentDescriptor, Integration, ResourceLimits};
use crate::config::PolicyConfig;
use crate::error::PolicyViolation;

/// Which gate check refused a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyRule {
    AgentDenied,
    IntegrationNotAllowed,
    ResourceCeilingExceeded,
    InvalidLimits,
    RestrictedPackage,
    /// The agent's own sources import a restricted module or make a restricted call.
    RestrictedCode,
    /// A URL supplied with the job points somewhere the agent may not reach.
    EgressDenied,
}

impl PolicyRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentDenied => "agent_denied",
            Self::IntegrationNotAllowed => "integration_not_allowed",
            Self::ResourceCeilingExceeded => "resource_ceiling_exceeded",
            Self::InvalidLimits => "invalid_limits",
            Self::RestrictedPackage => "restricted_package",
            Self::RestrictedCode => "restricted_code",
            Self::EgressDenied => "egress_denied",
        }
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a successful authorization. Derived per launch, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityDecision {
    pub agent_id: String,
    pub granted: BTreeSet<Integration>,
    pub limits: ResourceLimits,
    pub egress: EgressPolicy,
}

impl SecurityDecision {
    /// Docker network for the container: the dedicated egress network when
    /// anything is reachable, no network otherwise.
    pub fn network_mode<'a>(&self, egress_network: &'a str) -> &'a str {
        if self.egress.needs_network() {
            egress_network
        } else {
            "none"
        }
    }

    pub fn grants(&self, integration: Integration) -> bool {
        self.granted.contains(&integration)
    }

    /// Whether the container should be handed hub callback credentials.
    pub fn uses_hub(&self) -> bool {
        self.granted.iter().any(Integration::uses_hub)
    }
}

/// Evaluates agents against the configured [`PolicyConfig`].
#[derive(Debug, Clone)]
pub struct SecurityPolicyGate {
    config: PolicyConfig,
    hub_host: Option<String>,
    source_rules: SourceRules,
}

impl SecurityPolicyGate {
    /// `hub_url` is the callback endpoint agents with hub integrations talk to.
    pub fn new(config: PolicyConfig, hub_url: Option<&str>) -> Self {
        let hub_host = hub_url
            .and_then(|u| NetworkRequest::from_url("GET", u))
            .map(|r| r.host);
        let source_rules = SourceRules::from_config(&config);
        Self {
            config,
            hub_host,
            source_rules,
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Run every check in order and derive the launch decision.
    pub async fn authorize(
        &self,
        agent: &AgentDescriptor,
    ) -> Result<SecurityDecision, PolicyViolation> {
        if self.config.denied_agents.contains(&agent.agent_id) {
            return Err(PolicyViolation::new(
                PolicyRule::AgentDenied,
                format!("agent '{}' is on the deny-list", agent.agent_id),
            ));
        }

        let refused: Vec<&str> = agent
            .allowed_integrations
            .iter()
            .filter(|i| !self.config.allowed_integrations.contains(i))
            .map(Integration::as_str)
            .collect();
        if !refused.is_empty() {
            return Err(PolicyViolation::new(
                PolicyRule::IntegrationNotAllowed,
                refused.join(", "),
            ));
        }

        let limits = agent.resource_limits;
        limits
            .validate()
            .map_err(|detail| PolicyViolation::new(PolicyRule::InvalidLimits, detail))?;
        if !limits.fits_within(&self.config.ceiling) {
            let c = &self.config.ceiling;
            return Err(PolicyViolation::new(
                PolicyRule::ResourceCeilingExceeded,
                format!(
                    "requested {}MB/{}m cpu/{}s, ceiling is {}MB/{}m cpu/{}s",
                    limits.memory_mb,
                    limits.cpu_millis,
                    limits.timeout_secs,
                    c.memory_mb,
                    c.cpu_millis,
                    c.timeout_secs
                ),
            ));
        }

        if let Some(ref code_dir) = agent.code_dir {
            let hits = scan_requirements(code_dir, &self.config.restricted_packages)
                .await
                .map_err(|e| {
                    PolicyViolation::new(
                        PolicyRule::RestrictedPackage,
                        format!("cannot read {REQUIREMENTS_FILE}: {e}"),
                    )
                })?;
            if !hits.is_empty() {
                return Err(PolicyViolation::new(
                    PolicyRule::RestrictedPackage,
                    hits.join(", "),
                ));
            }

            if self.config.scan_source {
                let findings = scan_source(code_dir, &self.source_rules)
                    .await
                    .map_err(|e| {
                        PolicyViolation::new(
                            PolicyRule::RestrictedCode,
                            format!("cannot scan agent source: {e}"),
                        )
                    })?;
                if !findings.is_empty() {
                    return Err(PolicyViolation::new(
                        PolicyRule::RestrictedCode,
                        describe_findings(&findings),
                    ));
                }
            }
        }

        let granted = agent.allowed_integrations.clone();
        let egress = self.egress_for(&granted);
        tracing::debug!(
            agent_id = %agent.agent_id,
            granted = ?granted,
            network = egress.needs_network(),
            "Launch authorized"
        );

        Ok(SecurityDecision {
            agent_id: agent.agent_id.clone(),
            granted,
            limits,
            egress,
        })
    }

    fn egress_for(&self, granted: &BTreeSet<Integration>) -> EgressPolicy {
        let hub_host = if granted.iter().any(Integration::uses_hub) {
            self.hub_host.clone()
        } else {
            None
        };
        let mut domains: Vec<String> = granted
            .iter()
            .flat_map(|i| i.egress_domains().iter().map(|d| d.to_string()))
            .collect();
        let allow_public = granted.contains(&Integration::HttpEgress);
        if hub_host.is_some() || allow_public || !domains.is_empty() {
            domains.extend(self.config.extra_allowed_domains.iter().cloned());
        }
        EgressPolicy::new(hub_host, domains, allow_public)
    }
}
