//! JobStore implementation for LibSqlBackend.

use async_trait::async_trait;
use libsql::params;
use uuid::Uuid;

use crate::context::{ContextRef, ResultRef};
use crate::db::JobStore;
use crate::db::libsql::{
    LibSqlBackend, fmt_ts, get_i64, get_opt_text, get_text, get_ts, parse_uuid,
};
use crate::error::DatabaseError;
use crate::jobs::{FailureKind, Job, JobFailure, JobState, Priority};

const JOB_COLUMNS: &str = "id, agent_id, context_ref, priority, state, attempt_count, \
     result_ref, failure_kind, failure_reason, created_at, last_updated_at";

/// Column order follows [`JOB_COLUMNS`].
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let job_id = parse_uuid(&get_text(row, 0), "job")?;
    let priority: Priority = get_text(row, 3)
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let state: JobState = get_text(row, 4)
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let failure = match (get_opt_text(row, 7), get_opt_text(row, 8)) {
        (Some(kind), reason) => Some(JobFailure::new(
            kind.parse::<FailureKind>()
                .map_err(DatabaseError::Serialization)?,
            reason.unwrap_or_default(),
        )),
        (None, _) => None,
    };

    Ok(Job {
        job_id,
        agent_id: get_text(row, 1),
        context_ref: ContextRef::from_raw(get_text(row, 2)),
        priority,
        state,
        attempt_count: u32::try_from(get_i64(row, 5)).unwrap_or(0),
        created_at: get_ts(row, 9),
        last_updated_at: get_ts(row, 10),
        result_ref: get_opt_text(row, 6).map(ResultRef::from_raw),
        failure,
    })
}

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        let sql = format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        );
        conn.execute(
            &sql,
            params![
                job.job_id.to_string(),
                job.agent_id.as_str(),
                job.context_ref.as_str(),
                job.priority.as_str(),
                job.state.as_str(),
                i64::from(job.attempt_count),
                job.result_ref.as_ref().map(|r| r.as_str().to_string()),
                job.failure.as_ref().map(|f| f.kind.as_str().to_string()),
                job.failure.as_ref().map(|f| f.reason.clone()),
                fmt_ts(&job.created_at),
                fmt_ts(&job.last_updated_at),
            ],
        )
        .await
        .map_err(|e| {
            let msg = e.to_string();
            if msg.contains("UNIQUE") {
                DatabaseError::Constraint(format!("job {} already exists", job.job_id))
            } else {
                DatabaseError::Query(msg)
            }
        })?;
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let conn = self.connect().await?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let mut rows = conn
            .query(&sql, params![job_id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_job(&self, job: &Job, expected: JobState) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let affected = conn
            .execute(
                "UPDATE jobs SET state = ?2, attempt_count = ?3, result_ref = ?4, \
                 failure_kind = ?5, failure_reason = ?6, last_updated_at = ?7 \
                 WHERE id = ?1 AND state = ?8",
                params![
                    job.job_id.to_string(),
                    job.state.as_str(),
                    i64::from(job.attempt_count),
                    job.result_ref.as_ref().map(|r| r.as_str().to_string()),
                    job.failure.as_ref().map(|f| f.kind.as_str().to_string()),
                    job.failure.as_ref().map(|f| f.reason.clone()),
                    fmt_ts(&job.last_updated_at),
                    expected.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        if affected == 0 && self.get_job(job.job_id).await?.is_none() {
            return Err(DatabaseError::NotFound {
                entity: "job".into(),
                id: job.job_id.to_string(),
            });
        }
        Ok(affected == 1)
    }

    async fn list_jobs(
        &self,
        states: &[JobState],
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connect().await?;
        // States are a closed enum, so inlining their names is safe.
        let in_list = states
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE state IN ({in_list}) \
             ORDER BY created_at ASC LIMIT ?1"
        );
        let mut rows = conn
            .query(&sql, params![i64::try_from(limit).unwrap_or(i64::MAX)])
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }
}
