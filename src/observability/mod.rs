//! Observability subsystem: trait-based event and metric recording.
//!
//! Provides a pluggable [`Observer`] trait with multiple backends:
//!
//! | Backend | Description |
//! |---------|-------------|
//! | `noop`  | Zero overhead, discards everything (default) |
//! | `log`   | Emits structured events via `tracing` |
//! | `multi` | Fan-out to multiple backends simultaneously |
//!
//! The [`create_observer`] factory builds the right backend from
//! [`ObservabilityConfig`]. Backends can be combined with `+` syntax
//! (e.g. `"log+noop"`), which is mostly useful in tests.

mod log;
mod multi;
mod noop;
pub mod traits;

#[cfg(test)]
pub mod recording;

pub use self::log::LogObserver;
pub use self::multi::MultiObserver;
pub use self::noop::NoopObserver;
pub use self::traits::{Observer, ObserverEvent, ObserverMetric};

use crate::config::helpers::optional_env;
use crate::error::ConfigError;

/// Configuration for the observability backend.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Backend name: "none", "noop", "log", or a `+`-joined combination.
    pub backend: String,
}

impl ObservabilityConfig {
    /// Build from `OBSERVABILITY_BACKEND`, falling back to the default.
    pub fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            backend: optional_env("OBSERVABILITY_BACKEND")?
                .map(|b| b.trim().to_lowercase())
                .unwrap_or_else(|| Self::default().backend),
        })
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            backend: "none".into(),
        }
    }
}

fn single_observer(name: &str) -> Box<dyn Observer> {
    match name {
        "log" => Box::new(LogObserver),
        "none" | "noop" | "" => Box::new(NoopObserver),
        other => {
            tracing::warn!(backend = other, "Unknown observability backend, using noop");
            Box::new(NoopObserver)
        }
    }
}

/// Create an observer from configuration.
///
/// Returns a [`NoopObserver`] for "none"/"noop" (or unknown values),
/// a [`LogObserver`] for "log", or a [`MultiObserver`] for compound
/// backends like "log+noop".
pub fn create_observer(config: &ObservabilityConfig) -> Box<dyn Observer> {
    let parts: Vec<&str> = config
        .backend
        .split('+')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    match parts.as_slice() {
        [] => Box::new(NoopObserver),
        [single] => single_observer(single),
        many => Box::new(MultiObserver::new(
            many.iter().map(|p| single_observer(p)).collect(),
        )),
    }
}
