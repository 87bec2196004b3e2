use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::agents::{Integration, ResourceLimits};
use crate::config::helpers::{optional_env, parse_bool_env, parse_list_env, parse_optional_env};
use crate::error::ConfigError;

/// Packages an agent may not depend on.
pub const DEFAULT_RESTRICTED_PACKAGES: &[&str] = &[
    // Crypto libraries
    "cryptography",
    "pycrypto",
    "pyopenssl",
    // Web frameworks
    "django",
    "flask",
    "tornado",
    "fastapi",
    // Heavy ML stacks
    "tensorflow",
    "torch",
    "pytorch",
    // Cloud provider SDKs
    "boto3",
    "google-cloud",
    "azure",
    // Remote execution
    "ansible",
    "fabric",
    "paramiko",
    // Scraping and browser automation
    "scrapy",
    "selenium",
];

/// Python modules an agent's sources may not import, with their submodules.
pub const DEFAULT_RESTRICTED_MODULES: &[&str] = &[
    // Process and shell access
    "subprocess",
    "pty",
    // Unrestricted filesystem operations
    "shutil",
    // Raw sockets
    "socket",
    // Native code
    "ctypes",
    "cffi",
    // Deserialization that executes code
    "pickle",
    "shelve",
    "marshal",
    // Dynamic module loading
    "importlib",
    "imp",
];

/// Calls an agent's sources may not make. Bare names match unqualified
/// calls, dotted names match that exact attribute call.
pub const DEFAULT_RESTRICTED_CALLS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "globals",
    "__import__",
    "os.system",
    "os.popen",
    "os.spawnl",
    "os.spawnlp",
    "os.spawnv",
    "os.spawnvp",
    "os.execv",
    "os.execvp",
    "os.execl",
    "os.execlp",
    "os.fork",
];

/// Security policy gate configuration.
///
/// Values come from an optional TOML file (`POLICY_FILE`), then individual
/// env vars override the file.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Process-wide capability whitelist.
    pub allowed_integrations: BTreeSet<Integration>,
    /// Agents that may never run.
    pub denied_agents: BTreeSet<String>,
    /// Largest limits any agent may request.
    pub ceiling: ResourceLimits,
    /// Lowercased package names refused in `requirements.txt`.
    pub restricted_packages: BTreeSet<String>,
    /// Extra egress domains allowed to every agent with network access.
    pub extra_allowed_domains: Vec<String>,
    /// Whether agent sources are scanned for restricted imports and calls.
    pub scan_source: bool,
    pub restricted_modules: BTreeSet<String>,
    pub restricted_calls: BTreeSet<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_integrations: [
                Integration::HubMessages,
                Integration::HubLlm,
                Integration::AgentInvoke,
            ]
            .into_iter()
            .collect(),
            denied_agents: BTreeSet::new(),
            ceiling: ResourceLimits {
                memory_mb: 2048,
                cpu_millis: 2000,
                timeout_secs: 900,
            },
            restricted_packages: owned(DEFAULT_RESTRICTED_PACKAGES),
            extra_allowed_domains: Vec::new(),
            scan_source: true,
            restricted_modules: owned(DEFAULT_RESTRICTED_MODULES),
            restricted_calls: owned(DEFAULT_RESTRICTED_CALLS),
        }
    }
}

fn owned(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// On-disk policy file. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyFile {
    allowed_integrations: Option<BTreeSet<Integration>>,
    denied_agents: Option<BTreeSet<String>>,
    ceiling: Option<ResourceLimits>,
    restricted_packages: Option<Vec<String>>,
    extra_allowed_domains: Option<Vec<String>>,
    scan_source: Option<bool>,
    restricted_modules: Option<BTreeSet<String>>,
    restricted_calls: Option<BTreeSet<String>>,
}

impl PolicyConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let mut config = match optional_env("POLICY_FILE")? {
            Some(path) => Self::from_file(&PathBuf::from(path))?,
            None => Self::default(),
        };

        if let Some(list) = parse_list_env("POLICY_ALLOWED_INTEGRATIONS")? {
            config.allowed_integrations = list
                .iter()
                .map(|s| s.parse::<Integration>())
                .collect::<Result<_, _>>()
                .map_err(|message| ConfigError::InvalidValue {
                    key: "POLICY_ALLOWED_INTEGRATIONS".to_string(),
                    message,
                })?;
        }
        if let Some(list) = parse_list_env("POLICY_DENIED_AGENTS")? {
            config.denied_agents = list.into_iter().collect();
        }
        if let Some(list) = parse_list_env("POLICY_RESTRICTED_PACKAGES")? {
            config.restricted_packages = list.into_iter().map(|p| p.to_lowercase()).collect();
        }
        if let Some(list) = parse_list_env("POLICY_EXTRA_DOMAINS")? {
            config.extra_allowed_domains = list;
        }
        config.scan_source = parse_bool_env("POLICY_SCAN_SOURCE", config.scan_source)?;
        if let Some(list) = parse_list_env("POLICY_RESTRICTED_MODULES")? {
            config.restricted_modules = list.into_iter().collect();
        }
        if let Some(list) = parse_list_env("POLICY_RESTRICTED_CALLS")? {
            config.restricted_calls = list.into_iter().collect();
        }

        config.ceiling = ResourceLimits {
            memory_mb: parse_optional_env("POLICY_MAX_MEMORY_MB", config.ceiling.memory_mb)?,
            cpu_millis: parse_optional_env("POLICY_MAX_CPU_MILLIS", config.ceiling.cpu_millis)?,
            timeout_secs: parse_optional_env("POLICY_MAX_TIMEOUT_SECS", config.ceiling.timeout_secs)?,
        };

        Ok(config)
    }

    /// Load a TOML policy file on top of the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw).map_err(|e| {
            ConfigError::ParseError(format!("{}: {e}", path.display()))
        })
    }

    fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        let file: PolicyFile = toml::from_str(raw)?;
        let defaults = Self::default();
        Ok(Self {
            allowed_integrations: file
                .allowed_integrations
                .unwrap_or(defaults.allowed_integrations),
            denied_agents: file.denied_agents.unwrap_or(defaults.denied_agents),
            ceiling: file.ceiling.unwrap_or(defaults.ceiling),
            restricted_packages: file
                .restricted_packages
                .map(|list| list.into_iter().map(|p| p.to_lowercase()).collect())
                .unwrap_or(defaults.restricted_packages),
            extra_allowed_domains: file
                .extra_allowed_domains
                .unwrap_or(defaults.extra_allowed_domains),
            scan_source: file.scan_source.unwrap_or(defaults.scan_source),
            restricted_modules: file.restricted_modules.unwrap_or(defaults.restricted_modules),
            restricted_calls: file.restricted_calls.unwrap_or(defaults.restricted_calls),
        })
    }
}
