//! Configuration for agent-hub.
//!
//! Every section is read from environment variables with a documented
//! default. `.env` files are loaded first by [`Config::from_env`].

mod context;
mod database;
mod dispatcher;
pub(crate) mod helpers;
mod policy;
mod queue;
mod sandbox;

pub use self::context::ContextConfig;
pub use self::database::{DatabaseBackend, DatabaseConfig, default_libsql_path};
pub use self::dispatcher::DispatcherConfig;
pub use self::policy::{
    DEFAULT_RESTRICTED_CALLS, DEFAULT_RESTRICTED_MODULES, DEFAULT_RESTRICTED_PACKAGES, PolicyConfig,
};
pub use self::queue::QueueConfig;
pub use self::sandbox::SandboxConfig;

use crate::error::ConfigError;
use crate::observability::ObservabilityConfig;

/// Main configuration for the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub dispatcher: DispatcherConfig,
    pub sandbox: SandboxConfig,
    pub policy: PolicyConfig,
    pub context: ContextConfig,
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from `.env` files and environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        crate::bootstrap::load_agent_hub_env();
        Self::resolve()
    }

    /// Resolve from the current process environment only.
    pub fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            database: DatabaseConfig::resolve()?,
            queue: QueueConfig::resolve()?,
            dispatcher: DispatcherConfig::resolve()?,
            sandbox: SandboxConfig::resolve()?,
            policy: PolicyConfig::resolve()?,
            context: ContextConfig::resolve()?,
            observability: ObservabilityConfig::resolve()?,
        })
    }
}
