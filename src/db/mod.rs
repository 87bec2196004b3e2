//! Persistence for job records and execution records.
//!
//! Two backends:
//! - [`InMemoryStore`]: process-local, for tests and throwaway runs
//! - `LibSqlBackend`: embedded libSQL file (optionally a Turso replica),
//!   which also provides the durable [`JobQueue`](crate::queue::JobQueue)

mod memory;

#[cfg(feature = "libsql")]
pub mod libsql;
#[cfg(feature = "libsql")]
pub mod libsql_migrations;

pub use memory::InMemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::{DatabaseBackend, DatabaseConfig, QueueConfig};
use crate::error::DatabaseError;
use crate::jobs::{Job, JobState};
use crate::queue::{JobQueue, MemoryQueue};
use crate::sandbox::ExecutionRecord;

/// Job record persistence. Only the dispatcher writes through this.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Persist `job` only if the stored state is still `expected`.
    ///
    /// Returns `false` when another writer got there first. This is the
    /// conditional transition behind claims and recovery.
    async fn update_job(&self, job: &Job, expected: JobState) -> Result<bool, DatabaseError>;

    /// Jobs in any of `states`, oldest first.
    async fn list_jobs(&self, states: &[JobState], limit: usize)
    -> Result<Vec<Job>, DatabaseError>;
}

/// Execution record persistence. Only the container manager writes through this.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<(), DatabaseError>;

    /// Overwrite a record. Fails with `Constraint` once the stored copy is closed.
    async fn update_execution(&self, record: &ExecutionRecord) -> Result<(), DatabaseError>;

    async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionRecord>, DatabaseError>;

    /// Every record for a job, by attempt.
    async fn list_executions(&self, job_id: Uuid) -> Result<Vec<ExecutionRecord>, DatabaseError>;

    /// Records that were never closed, e.g. after a crash.
    async fn open_executions(&self) -> Result<Vec<ExecutionRecord>, DatabaseError>;
}

/// A full persistence backend.
#[async_trait]
pub trait Database: JobStore + ExecutionStore {
    /// Create tables if missing. Idempotent.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}

/// Store and queue built from configuration.
pub struct Backends {
    pub db: Arc<dyn Database>,
    pub queue: Arc<dyn JobQueue>,
}

/// Open the configured backend, run migrations, and pair it with a queue.
pub async fn connect_from_config(
    config: &DatabaseConfig,
    queue: &QueueConfig,
) -> Result<Backends, DatabaseError> {
    match config.backend {
        DatabaseBackend::Memory => {
            let db = Arc::new(InMemoryStore::new());
            Ok(Backends {
                db,
                queue: Arc::new(MemoryQueue::new(queue.visibility_timeout)),
            })
        }
        #[cfg(feature = "libsql")]
        DatabaseBackend::LibSql => {
            use secrecy::ExposeSecret;

            let path = config.libsql_path();
            let backend = match (&config.libsql_url, &config.libsql_auth_token) {
                (Some(url), Some(token)) => {
                    libsql::LibSqlBackend::new_remote_replica(&path, url, token.expose_secret())
                        .await?
                }
                _ => libsql::LibSqlBackend::new_local(&path).await?,
            };
            let backend = Arc::new(backend.with_visibility_timeout(queue.visibility_timeout));
            backend.run_migrations().await?;
            tracing::info!(path = %path.display(), "libSQL job store ready");
            Ok(Backends {
                db: Arc::clone(&backend) as Arc<dyn Database>,
                queue: backend,
            })
        }
        #[cfg(not(feature = "libsql"))]
        DatabaseBackend::LibSql => Err(DatabaseError::Pool(
            "libsql backend requested but the libsql feature is disabled".into(),
        )),
    }
}
