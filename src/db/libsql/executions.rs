//! ExecutionStore implementation for LibSqlBackend.

use async_trait::async_trait;
use libsql::params;
use uuid::Uuid;

use crate::db::ExecutionStore;
use crate::db::libsql::{
    LibSqlBackend, fmt_opt_ts, fmt_ts, get_i64, get_opt_text, get_opt_ts, get_text, get_ts,
    parse_uuid,
};
use crate::error::DatabaseError;
use crate::sandbox::{ExecutionRecord, ExecutionState, ExitStatus};

const EXECUTION_COLUMNS: &str = "id, job_id, agent_id, attempt, container_id, container_name, \
     state, started_at, ended_at, exit_status, stdout_ref, stderr_ref";

fn row_to_record(row: &libsql::Row) -> Result<ExecutionRecord, DatabaseError> {
    let state: ExecutionState = get_text(row, 6)
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let exit_status = get_opt_text(row, 9)
        .map(|raw| serde_json::from_str::<ExitStatus>(&raw))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("invalid exit status: {e}")))?;

    Ok(ExecutionRecord {
        execution_id: parse_uuid(&get_text(row, 0), "execution")?,
        job_id: parse_uuid(&get_text(row, 1), "job")?,
        agent_id: get_text(row, 2),
        attempt: u32::try_from(get_i64(row, 3)).unwrap_or(0),
        container_id: get_opt_text(row, 4),
        container_name: get_text(row, 5),
        state,
        started_at: get_ts(row, 7),
        ended_at: get_opt_ts(row, 8),
        exit_status,
        stdout_ref: get_opt_text(row, 10),
        stderr_ref: get_opt_text(row, 11),
    })
}

fn exit_status_json(record: &ExecutionRecord) -> Result<Option<String>, DatabaseError> {
    record
        .exit_status
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| DatabaseError::Serialization(e.to_string()))
}

impl LibSqlBackend {
    async fn query_records(
        &self,
        where_clause: &str,
        args: Vec<libsql::Value>,
    ) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM executions {where_clause}");
        let mut rows = conn
            .query(&sql, args)
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            out.push(row_to_record(&row)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl ExecutionStore for LibSqlBackend {
    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        let sql = format!(
            "INSERT INTO executions ({EXECUTION_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        );
        conn.execute(
            &sql,
            params![
                record.execution_id.to_string(),
                record.job_id.to_string(),
                record.agent_id.as_str(),
                i64::from(record.attempt),
                record.container_id.clone(),
                record.container_name.as_str(),
                record.state.as_str(),
                fmt_ts(&record.started_at),
                fmt_opt_ts(&record.ended_at),
                exit_status_json(record)?,
                record.stdout_ref.clone(),
                record.stderr_ref.clone(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn update_execution(&self, record: &ExecutionRecord) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        let affected = conn
            .execute(
                "UPDATE executions SET container_id = ?2, state = ?3, ended_at = ?4, \
                 exit_status = ?5, stdout_ref = ?6, stderr_ref = ?7 \
                 WHERE id = ?1 AND state != 'cleaned_up'",
                params![
                    record.execution_id.to_string(),
                    record.container_id.clone(),
                    record.state.as_str(),
                    fmt_opt_ts(&record.ended_at),
                    exit_status_json(record)?,
                    record.stdout_ref.clone(),
                    record.stderr_ref.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        if affected == 0 {
            return match self.get_execution(record.execution_id).await? {
                Some(_) => Err(DatabaseError::Constraint(format!(
                    "execution {} is closed",
                    record.execution_id
                ))),
                None => Err(DatabaseError::NotFound {
                    entity: "execution".into(),
                    id: record.execution_id.to_string(),
                }),
            };
        }
        Ok(())
    }

    async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionRecord>, DatabaseError> {
        let mut records = self
            .query_records(
                "WHERE id = ?1",
                vec![libsql::Value::Text(execution_id.to_string())],
            )
            .await?;
        Ok(records.pop())
    }

    async fn list_executions(&self, job_id: Uuid) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        self.query_records(
            "WHERE job_id = ?1 ORDER BY attempt ASC, started_at ASC",
            vec![libsql::Value::Text(job_id.to_string())],
        )
        .await
    }

    async fn open_executions(&self) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        self.query_records(
            "WHERE state != 'cleaned_up' ORDER BY started_at ASC",
            Vec::new(),
        )
        .await
    }
}
