use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::{Database, ExecutionStore, JobStore};
use crate::error::DatabaseError;
use crate::jobs::{Job, JobState};
use crate::sandbox::ExecutionRecord;

/// Process-local store backed by hash maps.
#[derive(Default)]
pub struct InMemoryStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    executions: RwLock<HashMap<Uuid, ExecutionRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.job_id) {
            return Err(DatabaseError::Constraint(format!(
                "job {} already exists",
                job.job_id
            )));
        }
        jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, DatabaseError> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn update_job(&self, job: &Job, expected: JobState) -> Result<bool, DatabaseError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.job_id) {
            Some(stored) if stored.state == expected => {
                *stored = job.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(DatabaseError::NotFound {
                entity: "job".into(),
                id: job.job_id.to_string(),
            }),
        }
    }

    async fn list_jobs(
        &self,
        states: &[JobState],
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError> {
        let jobs = self.jobs.read().await;
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|j| states.contains(&j.state))
            .cloned()
            .collect();
        out.sort_by_key(|j| j.created_at);
        out.truncate(limit);
        Ok(out)
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<(), DatabaseError> {
        let mut execs = self.executions.write().await;
        if execs.contains_key(&record.execution_id) {
            return Err(DatabaseError::Constraint(format!(
                "execution {} already exists",
                record.execution_id
            )));
        }
        execs.insert(record.execution_id, record.clone());
        Ok(())
    }

    async fn update_execution(&self, record: &ExecutionRecord) -> Result<(), DatabaseError> {
        let mut execs = self.executions.write().await;
        match execs.get_mut(&record.execution_id) {
            Some(stored) if stored.is_closed() => Err(DatabaseError::Constraint(format!(
                "execution {} is closed",
                record.execution_id
            ))),
            Some(stored) => {
                *stored = record.clone();
                Ok(())
            }
            None => Err(DatabaseError::NotFound {
                entity: "execution".into(),
                id: record.execution_id.to_string(),
            }),
        }
    }

    async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionRecord>, DatabaseError> {
        Ok(self.executions.read().await.get(&execution_id).cloned())
    }

    async fn list_executions(&self, job_id: Uuid) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        let execs = self.executions.read().await;
        let mut out: Vec<ExecutionRecord> = execs
            .values()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| (r.attempt, r.started_at));
        Ok(out)
    }

    async fn open_executions(&self) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        let execs = self.executions.read().await;
        let mut out: Vec<ExecutionRecord> =
            execs.values().filter(|r| !r.is_closed()).cloned().collect();
        out.sort_by_key(|r| r.started_at);
        Ok(out)
    }
}

#[async_trait]
impl Database for InMemoryStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextRef;
    use crate::jobs::Priority;
    use crate::sandbox::{ExecutionState, ExitStatus};

    fn job() -> Job {
        let id = Uuid::new_v4();
        Job::new(id, "echo", ContextRef::for_job(id), Priority::Normal)
    }

    #[tokio::test]
    async fn conditional_update_only_wins_once() {
        let store = InMemoryStore::new();
        let job = job();
        store.insert_job(&job).await.unwrap();

        let mut claimed = job.clone();
        claimed.transition_to(JobState::Running).unwrap();
        assert!(store.update_job(&claimed, JobState::Queued).await.unwrap());
        assert!(!store.update_job(&claimed, JobState::Queued).await.unwrap());

        let stored = store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Running);
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_constraint_error() {
        let store = InMemoryStore::new();
        let job = job();
        store.insert_job(&job).await.unwrap();
        assert!(matches!(
            store.insert_job(&job).await,
            Err(DatabaseError::Constraint(_))
        ));
    }

    #[tokio::test]
    async fn list_filters_by_state() {
        let store = InMemoryStore::new();
        let a = job();
        let mut b = job();
        b.transition_to(JobState::Cancelled).unwrap();
        store.insert_job(&a).await.unwrap();
        store.insert_job(&b).await.unwrap();

        let queued = store.list_jobs(&[JobState::Queued], 10).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].job_id, a.job_id);
        assert!(store.list_jobs(&[JobState::Running], 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_execution_is_frozen() {
        let store = InMemoryStore::new();
        let mut rec = ExecutionRecord::new(Uuid::new_v4(), "echo", 1);
        store.insert_execution(&rec).await.unwrap();
        assert_eq!(store.open_executions().await.unwrap().len(), 1);

        rec.advance(ExecutionState::Running).unwrap();
        rec.finish(ExitStatus::Exited { code: 0 }).unwrap();
        rec.close();
        store.update_execution(&rec).await.unwrap();
        assert!(store.open_executions().await.unwrap().is_empty());

        assert!(matches!(
            store.update_execution(&rec).await,
            Err(DatabaseError::Constraint(_))
        ));
    }
}
