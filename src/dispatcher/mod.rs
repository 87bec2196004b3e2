//! The dispatcher: submission, the worker pool, and the control loop that
//! drives each job from `queued` to a terminal state.
//!
//! ```text
//! submit ──► ContextStore + JobStore + JobQueue
//!                                   │
//!          worker ◄── dequeue ──────┘
//!            │ claim (queued → running, attempt += 1)
//!            │ registry → policy gate → ContainerManager
//!            │ launch → await_exit → collect_result → cleanup
//!            └ settle: succeeded / retry / failed, then ack or nack
//! ```

mod health;
mod lock;
mod recovery;
mod retry;
mod worker;

pub use health::HealthReport;
pub use lock::DispatcherLock;
pub use recovery::RecoveryReport;
pub use retry::{AttemptFailure, RetryDecision, RetryPolicy, backoff_delay};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agents::{AgentRegistry, FsAgentRegistry, validate_agent_id};
use crate::config::{Config, DispatcherConfig};
use crate::context::ContextStore;
use crate::db::{Database, JobStore};
use crate::error::{Error, JobError};
use crate::jobs::{FailureKind, Job, JobFailure, JobState, JobStatus, Priority};
use crate::observability::{Observer, ObserverEvent, create_observer};
use crate::policy::SecurityPolicyGate;
use crate::queue::{JobQueue, QueueEntry};
use crate::sandbox::{ContainerManager, ContainerRuntime};

/// Everything the dispatcher needs, already constructed.
pub struct DispatcherDeps {
    pub jobs: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
    pub registry: Arc<dyn AgentRegistry>,
    pub gate: SecurityPolicyGate,
    pub containers: Arc<ContainerManager>,
    pub contexts: Arc<ContextStore>,
    pub observer: Arc<dyn Observer>,
    pub config: DispatcherConfig,
    /// How long an idle worker waits on an empty queue per poll.
    pub poll_interval: Duration,
    /// Queue visibility timeout; leases are extended well inside it.
    pub lease_timeout: Duration,
}

/// State shared by the dispatcher handle and its workers.
pub(crate) struct Shared {
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    registry: Arc<dyn AgentRegistry>,
    gate: SecurityPolicyGate,
    containers: Arc<ContainerManager>,
    contexts: Arc<ContextStore>,
    observer: Arc<dyn Observer>,
    config: DispatcherConfig,
    retry: RetryPolicy,
    poll_interval: Duration,
    lease_timeout: Duration,
    /// Jobs this process is working on, with the token that cancels them.
    active_jobs: Mutex<HashMap<Uuid, CancellationToken>>,
    active_workers: AtomicU64,
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    workers: Mutex<JoinSet<()>>,
    lock: Mutex<Option<DispatcherLock>>,
}

impl Dispatcher {
    pub fn new(deps: DispatcherDeps) -> Self {
        let retry = RetryPolicy::from_config(&deps.config);
        Self {
            shared: Arc::new(Shared {
                jobs: deps.jobs,
                queue: deps.queue,
                registry: deps.registry,
                gate: deps.gate,
                containers: deps.containers,
                contexts: deps.contexts,
                observer: deps.observer,
                config: deps.config,
                retry,
                poll_interval: deps.poll_interval,
                lease_timeout: deps.lease_timeout,
                active_jobs: Mutex::new(HashMap::new()),
                active_workers: AtomicU64::new(0),
            }),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(JoinSet::new()),
            lock: Mutex::new(None),
        }
    }

    /// Wire up every component from configuration.
    pub async fn from_config(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, Error> {
        let backends = crate::db::connect_from_config(&config.database, &config.queue).await?;
        let observer: Arc<dyn Observer> = Arc::from(create_observer(&config.observability));
        let contexts = Arc::new(ContextStore::from_config(&config.context));
        let registry = Arc::new(FsAgentRegistry::new(
            &config.context.agents_dir,
            &config.sandbox.image,
            config.sandbox.default_limits,
        ));
        let db: Arc<dyn Database> = backends.db;
        let containers = Arc::new(ContainerManager::new(
            runtime,
            Arc::clone(&db) as _,
            Arc::clone(&contexts),
            config.sandbox.clone(),
            config.dispatcher.max_concurrent_executions,
            Arc::clone(&observer),
        ));
        let gate = SecurityPolicyGate::new(config.policy.clone(), config.sandbox.hub_url.as_deref());

        Ok(Self::new(DispatcherDeps {
            jobs: db as _,
            queue: backends.queue,
            registry,
            gate,
            containers,
            contexts,
            observer,
            config: config.dispatcher.clone(),
            poll_interval: config.queue.poll_interval,
            lease_timeout: config.queue.visibility_timeout,
        }))
    }

    pub fn containers(&self) -> &Arc<ContainerManager> {
        &self.shared.containers
    }

    pub fn registry(&self) -> &Arc<dyn AgentRegistry> {
        &self.shared.registry
    }

    /// Submit a job at normal priority.
    pub async fn submit_job(
        &self,
        agent_id: &str,
        context_data: serde_json::Value,
    ) -> Result<Uuid, Error> {
        self.submit_job_with_priority(agent_id, context_data, Priority::Normal)
            .await
    }

    /// Persist the context, record the job as `queued` and enqueue it.
    ///
    /// If the enqueue itself fails the job stays recorded as `queued` and
    /// [`recover`](Self::recover) offers it to the queue again.
    pub async fn submit_job_with_priority(
        &self,
        agent_id: &str,
        context_data: serde_json::Value,
        priority: Priority,
    ) -> Result<Uuid, Error> {
        validate_agent_id(agent_id)?;

        let job_id = Uuid::new_v4();
        let context_ref = self.shared.contexts.write_context(job_id, context_data).await?;
        let job = Job::new(job_id, agent_id, context_ref, priority);
        self.shared.jobs.insert_job(&job).await?;
        self.shared
            .queue
            .enqueue(QueueEntry::new(job_id, priority))
            .await?;

        tracing::info!(job_id = %job_id, agent_id, priority = %priority, "Job submitted");
        self.shared.observer.record_event(&ObserverEvent::JobSubmitted {
            job_id,
            agent_id: agent_id.to_string(),
            priority,
        });
        Ok(job_id)
    }

    pub async fn get_job_status(&self, job_id: Uuid) -> Result<JobStatus, Error> {
        self.shared
            .jobs
            .get_job(job_id)
            .await?
            .map(|job| job.status())
            .ok_or_else(|| JobError::NotFound { id: job_id }.into())
    }

    /// Jobs in any of `states`, oldest first.
    pub async fn list_jobs(&self, states: &[JobState], limit: usize) -> Result<Vec<JobStatus>, Error> {
        let jobs = self.shared.jobs.list_jobs(states, limit).await?;
        Ok(jobs.iter().map(Job::status).collect())
    }

    /// Cancel a job.
    ///
    /// A queued job becomes `cancelled` at once; its queue entry is dropped
    /// when next delivered. A job running in this process has its
    /// cancellation token fired and the owning worker kills the container.
    /// A job running in another process is marked `cancelled` in the store;
    /// its worker sees that on its next lease check and kills the container.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<JobStatus, Error> {
        if let Some(token) = self.shared.active_jobs.lock().await.get(&job_id) {
            token.cancel();
            tracing::info!(job_id = %job_id, "Cancellation requested for running job");
            return self.get_job_status(job_id).await;
        }

        for _ in 0..3 {
            let mut job = self
                .shared
                .jobs
                .get_job(job_id)
                .await?
                .ok_or(JobError::NotFound { id: job_id })?;
            let previous = job.state;
            if previous.is_terminal() {
                return Err(JobError::AlreadyTerminal {
                    id: job_id,
                    state: previous,
                }
                .into());
            }
            job.transition_to(JobState::Cancelled)?;
            job.failure = Some(JobFailure::new(FailureKind::Cancelled, "cancelled by request"));
            if self.shared.jobs.update_job(&job, previous).await? {
                tracing::info!(job_id = %job_id, from = %previous, "Job cancelled");
                self.shared.observer.record_event(&ObserverEvent::JobFinished {
                    job_id,
                    state: JobState::Cancelled,
                    attempts: job.attempt_count,
                    failure: job.failure.as_ref().map(ToString::to_string),
                });
                return Ok(job.status());
            }
            // Raced with a worker; look again.
        }
        self.get_job_status(job_id).await
    }

    /// Take the dispatcher lock unless this dispatcher already holds it or
    /// locking is disabled.
    pub(crate) async fn hold_lock(&self) -> Result<(), Error> {
        let Some(ref path) = self.shared.config.lock_file else {
            return Ok(());
        };
        let mut held = self.lock.lock().await;
        if held.is_none() {
            let lock = DispatcherLock::acquire(path)?;
            tracing::debug!(path = %lock.path().display(), "Dispatcher lock taken");
            *held = Some(lock);
        }
        Ok(())
    }

    /// Spawn the worker pool. Returns once the workers are spawned.
    ///
    /// Fails when another dispatcher holds the lock.
    pub async fn start(&self) -> Result<(), Error> {
        self.hold_lock().await?;
        let mut workers = self.workers.lock().await;
        for index in 0..self.shared.config.workers {
            let shared = Arc::clone(&self.shared);
            let shutdown = self.shutdown.child_token();
            workers.spawn(async move { worker::run(shared, shutdown, index).await });
        }
        tracing::info!(
            workers = self.shared.config.workers,
            max_concurrent = self.shared.config.max_concurrent_executions,
            "Dispatcher started"
        );
        Ok(())
    }

    /// Stop taking work and wait for in-flight jobs.
    ///
    /// Workers still busy after `shutdown_grace` are aborted; their jobs stay
    /// `running` with an unacked lease and are picked up by the next
    /// [`recover`](Self::recover).
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut workers = self.workers.lock().await;
        let grace = self.shared.config.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    tracing::error!(error = %e, "Worker panicked");
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(grace_secs = grace.as_secs(), "Workers did not drain in time, aborting");
            workers.abort_all();
            while workers.join_next().await.is_some() {}
            self.shared.containers.cleanup_all().await;
        }
        self.shared.observer.flush();
        self.lock.lock().await.take();
        tracing::info!("Dispatcher stopped");
    }

    /// Recover, start the pool, run until `signal` resolves, then shut down.
    pub async fn run_until(&self, signal: impl Future<Output = ()>) -> Result<(), Error> {
        let report = self.recover().await?;
        if !report.is_empty() {
            tracing::info!(?report, "Recovered state from previous run");
        }
        self.start().await?;
        signal.await;
        self.shutdown().await;
        Ok(())
    }
}
