use std::path::PathBuf;
use std::time::Duration;

use crate::bootstrap::agent_hub_base_dir;
use crate::config::helpers::{optional_env, parse_bool_env, parse_optional_env};
use crate::error::ConfigError;

/// Dispatcher worker pool and retry policy.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of worker tasks pulling from the queue.
    pub workers: usize,
    /// Total attempts a job may consume before it is failed.
    pub max_attempts: u32,
    /// Cap on simultaneously running containers.
    pub max_concurrent_executions: usize,
    /// First delay after a queue outage; doubles per consecutive failure.
    pub queue_backoff_base: Duration,
    /// Ceiling for the queue outage backoff.
    pub queue_backoff_max: Duration,
    /// Upper bound on a health probe.
    pub health_check_timeout: Duration,
    /// Extra attempts granted to `ResultInvalid` failures. Zero makes them
    /// fatal.
    pub result_invalid_retries: u32,
    /// Whether image pull failures count as transient launch errors.
    pub retry_image_pull: bool,
    /// How long `shutdown` waits for in-flight jobs before aborting them.
    pub shutdown_grace: Duration,
    /// File locked while this process dispatches or recovers. `None` skips
    /// locking, which is only safe when nothing else shares the store.
    pub lock_file: Option<PathBuf>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            max_concurrent_executions: 4,
            queue_backoff_base: Duration::from_millis(500),
            queue_backoff_max: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(2),
            result_invalid_retries: 0,
            retry_image_pull: true,
            shutdown_grace: Duration::from_secs(30),
            lock_file: None,
        }
    }
}

impl DispatcherConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            workers: parse_optional_env("DISPATCH_WORKERS", defaults.workers)?,
            max_attempts: parse_optional_env("DISPATCH_MAX_ATTEMPTS", defaults.max_attempts)?,
            max_concurrent_executions: parse_optional_env(
                "DISPATCH_MAX_CONCURRENT",
                defaults.max_concurrent_executions,
            )?,
            queue_backoff_base: Duration::from_millis(parse_optional_env(
                "DISPATCH_QUEUE_BACKOFF_BASE_MS",
                defaults.queue_backoff_base.as_millis() as u64,
            )?),
            queue_backoff_max: Duration::from_millis(parse_optional_env(
                "DISPATCH_QUEUE_BACKOFF_MAX_MS",
                defaults.queue_backoff_max.as_millis() as u64,
            )?),
            health_check_timeout: Duration::from_millis(parse_optional_env(
                "HEALTH_CHECK_TIMEOUT_MS",
                defaults.health_check_timeout.as_millis() as u64,
            )?),
            result_invalid_retries: parse_optional_env(
                "DISPATCH_RESULT_INVALID_RETRIES",
                defaults.result_invalid_retries,
            )?,
            retry_image_pull: parse_bool_env("DISPATCH_RETRY_IMAGE_PULL", defaults.retry_image_pull)?,
            shutdown_grace: Duration::from_secs(parse_optional_env(
                "DISPATCH_SHUTDOWN_GRACE_SECS",
                defaults.shutdown_grace.as_secs(),
            )?),
            lock_file: Some(
                optional_env("DISPATCH_LOCK_FILE")?
                    .map(PathBuf::from)
                    .unwrap_or_else(|| agent_hub_base_dir().join("dispatcher.lock")),
            ),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DISPATCH_WORKERS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DISPATCH_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_concurrent_executions == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DISPATCH_MAX_CONCURRENT".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
