pub const CREATE_CHECKPOINTS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS checkpoints (
    id VARCHAR PRIMARY KEY,
    thread_id VARCHAR NOT NULL,
    checkpoint_ns VARCHAR NOT NULL DEFAULT '',
    parent_id VARCHAR,
    channel_values JSON,
    channel_versions JSON,
    versions_seen JSON,
    pending_sends JSON,
    source VARCHAR NOT NULL DEFAULT 'loop',
    step BIGINT NOT NULL DEFAULT 0,
    created_at VARCHAR NOT NULL,
    metadata JSON
);
CREATE INDEX IF NOT EXISTS idx_checkpoints_partition ON checkpoints(thread_id, checkpoint_ns);
CREATE INDEX IF NOT EXISTS idx_checkpoints_parent ON checkpoints(parent_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_checkpoints_append ON checkpoints(thread_id, checkpoint_ns, parent_id);
";

pub const CREATE_MEMORIES_TABLE: &str = "
CREATE TABLE IF NOT EXISTS memories (
    id VARCHAR PRIMARY KEY,
    agent_id VARCHAR,
    content TEXT NOT NULL,
    embedding BLOB NOT NULL,
    memory_type VARCHAR NOT NULL DEFAULT 'episodic',
    importance FLOAT NOT NULL DEFAULT 0.5,
    access_count BIGINT NOT NULL DEFAULT 0,
    last_accessed_at VARCHAR,
    metadata JSON,
    created_at VARCHAR NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memories_agent_id ON memories(agent_id);
CREATE INDEX IF NOT EXISTS idx_memories_memory_type ON memories(memory_type);
";

pub const CREATE_APPROVAL_REQUESTS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS approval_requests (
    id VARCHAR PRIMARY KEY,
    run_id VARCHAR NOT NULL,
    requested_by VARCHAR,
    reason TEXT NOT NULL,
    context JSON,
    proposed_action JSON,
    status VARCHAR NOT NULL DEFAULT 'pending',
    reviewed_by VARCHAR,
    review_notes TEXT,
    reviewed_at VARCHAR,
    created_at VARCHAR NOT NULL,
    expires_at VARCHAR NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_approvals_run_id ON approval_requests(run_id);
CREATE INDEX IF NOT EXISTS idx_approvals_status ON approval_requests(status);
CREATE INDEX IF NOT EXISTS idx_approvals_expires_at ON approval_requests(expires_at);
";

// activity_log is append-only by design. DuckDB lacks trigger support, so
// enforcement is application-level: no code path issues UPDATE or DELETE
// against this table.
pub const CREATE_ACTIVITY_LOG_TABLE: &str = "
CREATE TABLE IF NOT EXISTS activity_log (
    id VARCHAR PRIMARY KEY,
    run_id VARCHAR NOT NULL,
    step_type VARCHAR NOT NULL,
    content TEXT NOT NULL,
    agent_id VARCHAR,
    tool_name VARCHAR,
    tool_input JSON,
    tool_output JSON,
    duration_ms BIGINT,
    timestamp VARCHAR NOT NULL,
    metadata JSON
);
CREATE INDEX IF NOT EXISTS idx_activity_run_id ON activity_log(run_id);
CREATE INDEX IF NOT EXISTS idx_activity_run_ts ON activity_log(run_id, timestamp);
";

pub fn run_migrations(conn: &duckdb::Connection) -> duckdb::Result<()> {
    conn.execute_batch(CREATE_CHECKPOINTS_TABLE)?;
    conn.execute_batch(CREATE_MEMORIES_TABLE)?;
    conn.execute_batch(CREATE_APPROVAL_REQUESTS_TABLE)?;
    conn.execute_batch(CREATE_ACTIVITY_LOG_TABLE)?;
    Ok(())
}
