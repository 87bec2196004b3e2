use std::time::Duration;

use crate::config::helpers::parse_optional_env;
use crate::error::ConfigError;

/// Job queue delivery settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// A leased entry that is neither acked nor extended within this window
    /// becomes visible to other consumers again.
    pub visibility_timeout: Duration,
    /// How long a dequeue waits on an empty queue before returning `None`.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl QueueConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            visibility_timeout: Duration::from_secs(parse_optional_env(
                "QUEUE_VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout.as_secs(),
            )?),
            poll_interval: Duration::from_millis(parse_optional_env(
                "QUEUE_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
        })
    }
}
