use std::path::PathBuf;

use crate::bootstrap::agent_hub_base_dir;
use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;

/// Shared-volume layout for contexts, results and agents.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Root of the context store.
    pub data_dir: PathBuf,
    /// Where agent code and `agent.json` manifests live.
    pub agents_dir: PathBuf,
    /// Largest context payload accepted at submission.
    pub max_context_bytes: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        let data_dir = agent_hub_base_dir().join("data");
        Self {
            agents_dir: data_dir.join("agents"),
            data_dir,
            max_context_bytes: 1024 * 1024,
        }
    }
}

impl ContextConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let data_dir = optional_env("AGENT_HUB_DATA_DIR")?
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let agents_dir = optional_env("AGENT_HUB_AGENTS_DIR")?
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("agents"));
        Ok(Self {
            data_dir,
            agents_dir,
            max_context_bytes: parse_optional_env("CONTEXT_MAX_BYTES", defaults.max_context_bytes)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::helpers::ENV_MUTEX;

    #[test]
    fn agents_dir_follows_data_dir() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("AGENT_HUB_DATA_DIR", "/srv/hub");
            std::env::remove_var("AGENT_HUB_AGENTS_DIR");
        }
        let cfg = ContextConfig::resolve().unwrap();
        assert_eq!(cfg.agents_dir, PathBuf::from("/srv/hub/agents"));
        unsafe { std::env::remove_var("AGENT_HUB_DATA_DIR") };
    }
}
