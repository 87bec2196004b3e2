//! Shared fixtures: a dispatcher over in-memory backends and a scripted
//! container runtime.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use agent_hub::agents::{AgentDescriptor, InMemoryAgentRegistry};
use agent_hub::config::{DispatcherConfig, PolicyConfig, SandboxConfig};
use agent_hub::context::ContextStore;
use agent_hub::db::InMemoryStore;
use agent_hub::dispatcher::{Dispatcher, DispatcherDeps};
use agent_hub::jobs::JobStatus;
use agent_hub::observability::{Observer, ObserverEvent, ObserverMetric};
use agent_hub::policy::SecurityPolicyGate;
use agent_hub::queue::MemoryQueue;
use agent_hub::sandbox::ContainerManager;
use agent_hub::sandbox::testing::ScriptedRuntime;

pub const IMAGE: &str = "agent-runtime:latest";

/// Observer that keeps every event for later assertions.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<ObserverEvent>>,
}

impl EventLog {
    pub fn events(&self) -> Vec<ObserverEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Observer for EventLog {
    fn record_event(&self, event: &ObserverEvent) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn record_metric(&self, _metric: &ObserverMetric) {}

    fn name(&self) -> &str {
        "event-log"
    }
}

pub struct Hub {
    pub dir: TempDir,
    pub store: Arc<InMemoryStore>,
    pub queue: Arc<MemoryQueue>,
    pub runtime: Arc<ScriptedRuntime>,
    pub registry: Arc<InMemoryAgentRegistry>,
    pub contexts: Arc<ContextStore>,
    pub events: Arc<EventLog>,
    pub dispatcher: Dispatcher,
}

pub fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        workers: 2,
        max_attempts: 3,
        max_concurrent_executions: 4,
        queue_backoff_base: Duration::ZERO,
        queue_backoff_max: Duration::ZERO,
        shutdown_grace: Duration::from_secs(5),
        ..DispatcherConfig::default()
    }
}

pub async fn hub(config: DispatcherConfig) -> Hub {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
    hub_with(dir, store, queue, Arc::new(ScriptedRuntime::new()), config).await
}

/// Build a dispatcher over existing backends, as a restarted process would.
pub async fn hub_with(
    dir: TempDir,
    store: Arc<InMemoryStore>,
    queue: Arc<MemoryQueue>,
    runtime: Arc<ScriptedRuntime>,
    config: DispatcherConfig,
) -> Hub {
    let registry = Arc::new(InMemoryAgentRegistry::new());
    registry
        .register(AgentDescriptor::new("echo", IMAGE))
        .await
        .unwrap();
    let contexts = Arc::new(ContextStore::new(dir.path().join("data"), 64 * 1024));
    let events = Arc::new(EventLog::default());
    let observer: Arc<dyn Observer> = Arc::clone(&events) as _;
    let containers = Arc::new(ContainerManager::new(
        Arc::clone(&runtime) as _,
        Arc::clone(&store) as _,
        Arc::clone(&contexts),
        SandboxConfig {
            work_dir: dir.path().join("work"),
            ..SandboxConfig::default()
        },
        config.max_concurrent_executions,
        Arc::clone(&observer),
    ));
    let dispatcher = Dispatcher::new(DispatcherDeps {
        jobs: Arc::clone(&store) as _,
        queue: Arc::clone(&queue) as _,
        registry: Arc::clone(&registry) as _,
        gate: SecurityPolicyGate::new(PolicyConfig::default(), None),
        containers,
        contexts: Arc::clone(&contexts),
        observer,
        config,
        poll_interval: Duration::from_millis(20),
        lease_timeout: Duration::from_secs(30),
    });
    Hub {
        dir,
        store,
        queue,
        runtime,
        registry,
        contexts,
        events,
        dispatcher,
    }
}

pub fn context() -> serde_json::Value {
    json!({
        "schema_version": "1",
        "user_id": "user-1",
        "messages": [
            { "role": "user", "content": "hello", "message_id": "m-1", "timestamp": 1767225600 }
        ]
    })
}

pub async fn wait_terminal(dispatcher: &Dispatcher, job_id: Uuid) -> JobStatus {
    for _ in 0..1000 {
        let status = dispatcher.get_job_status(job_id).await.unwrap();
        if status.state.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} did not reach a terminal state");
}
