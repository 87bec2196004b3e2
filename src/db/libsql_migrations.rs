//! SQLite-dialect schema for the libSQL/Turso backend.
//!
//! Run on every startup; idempotent via `IF NOT EXISTS`.
//!
//! Type mapping:
//! - `UUID` -> `TEXT` (hyphenated)
//! - timestamps -> `TEXT` (RFC 3339, millisecond precision, UTC)
//! - queue deadlines -> `INTEGER` (unix millis, so they compare numerically)
//! - structured values -> `TEXT` (JSON encoded)

pub const SCHEMA: &str = r#"

-- ==================== Migration tracking ====================

CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- ==================== Jobs ====================

CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    context_ref TEXT NOT NULL,
    priority TEXT NOT NULL,
    state TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    result_ref TEXT,
    failure_kind TEXT,
    failure_reason TEXT,
    created_at TEXT NOT NULL,
    last_updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
CREATE INDEX IF NOT EXISTS idx_jobs_agent ON jobs(agent_id);
CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at);

-- ==================== Executions ====================

CREATE TABLE IF NOT EXISTS executions (
    id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    agent_id TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    container_id TEXT,
    container_name TEXT NOT NULL,
    state TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    exit_status TEXT,
    stdout_ref TEXT,
    stderr_ref TEXT
);

CREATE INDEX IF NOT EXISTS idx_executions_job ON executions(job_id);
CREATE INDEX IF NOT EXISTS idx_executions_state ON executions(state);

-- ==================== Queue ====================

CREATE TABLE IF NOT EXISTS job_queue (
    job_id TEXT PRIMARY KEY,
    priority INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    delivery_count INTEGER NOT NULL DEFAULT 0,
    leased_until_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_job_queue_ready ON job_queue(priority, seq);

INSERT OR IGNORE INTO _migrations (version, name) VALUES (1, 'initial');
"#;
