use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::activity::ActivityEntry;
use crate::model::approval::{ApprovalRequest, ApprovalStatus};
use crate::model::checkpoint::{Checkpoint, PendingSend};
use crate::model::memory::MemoryRecord;
use crate::storage::{MemoryFilter, StorageBackend};
use uuid::Uuid;

pub struct DuckDbStorage {
    conn: Arc<Mutex<duckdb::Connection>>,
}

impl DuckDbStorage {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = duckdb::Connection::open(path)?;
        super::migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = duckdb::Connection::open_in_memory()?;
        super::migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn deserialize_embedding(blob: Vec<u8>) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn row_to_checkpoint(row: &duckdb::Row<'_>) -> duckdb::Result<Checkpoint> {
    let id_str: String = row.get(0)?;
    let parent_str: Option<String> = row.get(3)?;
    let channel_values: Option<String> = row.get(4)?;
    let channel_versions: Option<String> = row.get(5)?;
    let versions_seen: Option<String> = row.get(6)?;
    let pending_sends: Option<String> = row.get(7)?;
    let metadata: Option<String> = row.get(11)?;

    Ok(Checkpoint {
        id: Uuid::parse_str(&id_str).unwrap(),
        thread_id: row.get(1)?,
        checkpoint_ns: row.get(2)?,
        parent_id: parent_str.and_then(|s| Uuid::parse_str(&s).ok()),
        channel_values: channel_values
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        channel_versions: channel_versions
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        versions_seen: versions_seen
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        pending_sends: pending_sends
            .and_then(|s| serde_json::from_str::<Vec<PendingSend>>(&s).ok())
            .unwrap_or_default(),
        source: row.get(8)?,
        step: row.get(9)?,
        created_at: row.get(10)?,
        metadata: metadata
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
    })
}

const CHECKPOINT_COLUMNS: &str = "id, thread_id, checkpoint_ns, parent_id, channel_values, channel_versions, versions_seen, pending_sends, source, step, created_at, metadata";

fn row_to_memory(row: &duckdb::Row<'_>) -> duckdb::Result<MemoryRecord> {
    let id_str: String = row.get(0)?;
    let embedding_blob: Vec<u8> = row.get(3)?;
    let metadata: Option<String> = row.get(8)?;

    Ok(MemoryRecord {
        id: Uuid::parse_str(&id_str).unwrap(),
        agent_id: row.get(1)?,
        content: row.get(2)?,
        embedding: deserialize_embedding(embedding_blob),
        memory_type: row.get::<_, String>(4)?.parse().unwrap(),
        importance: row.get(5)?,
        access_count: row.get::<_, i64>(6)? as u64,
        last_accessed_at: row.get(7)?,
        metadata: metadata
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
        created_at: row.get(9)?,
    })
}

const MEMORY_COLUMNS: &str = "id, agent_id, content, embedding, memory_type, importance, access_count, last_accessed_at, metadata, created_at";

fn row_to_approval(row: &duckdb::Row<'_>) -> duckdb::Result<ApprovalRequest> {
    let id_str: String = row.get(0)?;
    let context: Option<String> = row.get(4)?;
    let proposed_action: Option<String> = row.get(5)?;

    Ok(ApprovalRequest {
        id: Uuid::parse_str(&id_str).unwrap(),
        run_id: row.get(1)?,
        requested_by: row.get(2)?,
        reason: row.get(3)?,
        context: context
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
        proposed_action: proposed_action
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
        status: row.get::<_, String>(6)?.parse().unwrap(),
        reviewed_by: row.get(7)?,
        review_notes: row.get(8)?,
        reviewed_at: row.get(9)?,
        created_at: row.get(10)?,
        expires_at: row.get(11)?,
    })
}

const APPROVAL_COLUMNS: &str = "id, run_id, requested_by, reason, context, proposed_action, status, reviewed_by, review_notes, reviewed_at, created_at, expires_at";

fn row_to_activity(row: &duckdb::Row<'_>) -> duckdb::Result<ActivityEntry> {
    let id_str: String = row.get(0)?;
    let tool_input: Option<String> = row.get(6)?;
    let tool_output: Option<String> = row.get(7)?;
    let metadata: Option<String> = row.get(10)?;

    Ok(ActivityEntry {
        id: Uuid::parse_str(&id_str).unwrap(),
        run_id: row.get(1)?,
        step_type: row.get::<_, String>(2)?.parse().unwrap(),
        content: row.get(3)?,
        agent_id: row.get(4)?,
        tool_name: row.get(5)?,
        tool_input: tool_input.and_then(|s| serde_json::from_str(&s).ok()),
        tool_output: tool_output.and_then(|s| serde_json::from_str(&s).ok()),
        duration_ms: row.get(8)?,
        timestamp: row.get(9)?,
        metadata: metadata
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
    })
}

const ACTIVITY_COLUMNS: &str = "id, run_id, step_type, content, agent_id, tool_name, tool_input, tool_output, duration_ms, timestamp, metadata";

#[async_trait::async_trait]
impl StorageBackend for DuckDbStorage {
    async fn insert_checkpoint(&self, cp: &Checkpoint) -> Result<()> {
        let conn = self.conn.lock().await;

        // Per-partition append serialization: one root per partition, one
        // child per parent within a partition. The connection mutex makes
        // the check-then-insert atomic in-process; the unique index on
        // (thread_id, checkpoint_ns, parent_id) backs it at the schema level.
        let conflict: i64 = match cp.parent_id {
            Some(parent) => {
                let mut stmt = conn.prepare(
                    "SELECT COUNT(*) FROM checkpoints WHERE thread_id = ? AND checkpoint_ns = ? AND parent_id = ?",
                )?;
                stmt.query_row(
                    duckdb::params![cp.thread_id, cp.checkpoint_ns, parent.to_string()],
                    |row| row.get(0),
                )?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT COUNT(*) FROM checkpoints WHERE thread_id = ? AND checkpoint_ns = ?",
                )?;
                stmt.query_row(
                    duckdb::params![cp.thread_id, cp.checkpoint_ns],
                    |row| row.get(0),
                )?
            }
        };
        if conflict > 0 {
            return Err(Error::Conflict(format!(
                "checkpoint append collision in thread '{}' ns '{}' under parent {:?}",
                cp.thread_id, cp.checkpoint_ns, cp.parent_id
            )));
        }

        conn.execute(
            "INSERT INTO checkpoints (id, thread_id, checkpoint_ns, parent_id, channel_values, channel_versions, versions_seen, pending_sends, source, step, created_at, metadata) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            duckdb::params![
                cp.id.to_string(),
                cp.thread_id,
                cp.checkpoint_ns,
                cp.parent_id.map(|id| id.to_string()),
                serde_json::to_string(&cp.channel_values)?,
                serde_json::to_string(&cp.channel_versions)?,
                serde_json::to_string(&cp.versions_seen)?,
                serde_json::to_string(&cp.pending_sends)?,
                cp.source,
                cp.step,
                cp.created_at,
                serde_json::to_string(&cp.metadata)?,
            ],
        )?;
        Ok(())
    }

    async fn get_checkpoint(&self, id: Uuid) -> Result<Option<Checkpoint>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE id = ?"
        ))?;
        match stmt.query_row([id.to_string()], row_to_checkpoint) {
            Ok(cp) => Ok(Some(cp)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }

    async fn latest_checkpoint(&self, thread_id: &str, checkpoint_ns: &str) -> Result<Option<Checkpoint>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE thread_id = ? AND checkpoint_ns = ? ORDER BY created_at DESC, id DESC LIMIT 1"
        ))?;
        match stmt.query_row(duckdb::params![thread_id, checkpoint_ns], row_to_checkpoint) {
            Ok(cp) => Ok(Some(cp)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }

    async fn checkpoint_children(&self, parent_id: Uuid) -> Result<Vec<Checkpoint>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE parent_id = ? ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map([parent_id.to_string()], row_to_checkpoint)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row.map_err(|e| Error::Storage(e.to_string()))?);
        }
        Ok(results)
    }

    async fn insert_memory(&self, record: &MemoryRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO memories (id, agent_id, content, embedding, memory_type, importance, access_count, last_accessed_at, metadata, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            duckdb::params![
                record.id.to_string(),
                record.agent_id,
                record.content,
                serialize_embedding(&record.embedding),
                record.memory_type.to_string(),
                record.importance,
                record.access_count as i64,
                record.last_accessed_at,
                serde_json::to_string(&record.metadata)?,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    async fn get_memory(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?"
        ))?;
        match stmt.query_row([id.to_string()], row_to_memory) {
            Ok(record) => Ok(Some(record)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }

    async fn list_memories(&self, filter: &MemoryFilter, limit: usize, offset: usize) -> Result<Vec<MemoryRecord>> {
        let conn = self.conn.lock().await;
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn duckdb::ToSql>> = Vec::new();

        if let Some(ref agent_id) = filter.agent_id {
            conditions.push(format!("agent_id = ${}", params.len() + 1));
            params.push(Box::new(agent_id.clone()));
        }

        if let Some(memory_type) = filter.memory_type {
            conditions.push(format!("memory_type = ${}", params.len() + 1));
            params.push(Box::new(memory_type.to_string()));
        }

        if let Some(min_importance) = filter.min_importance {
            conditions.push(format!("importance >= ${}", params.len() + 1));
            params.push(Box::new(min_importance));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories {where_clause} ORDER BY created_at ASC, id ASC LIMIT {limit} OFFSET {offset}"
        );

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn duckdb::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(param_refs.as_slice(), row_to_memory)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row.map_err(|e| Error::Storage(e.to_string()))?);
        }
        Ok(results)
    }

    async fn list_memory_ids_by_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT id FROM memories WHERE agent_id = ? ORDER BY id ASC LIMIT {limit}"
        ))?;
        let rows = stmt.query_map([agent_id], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            let id_str = row.map_err(|e| Error::Storage(e.to_string()))?;
            ids.push(Uuid::parse_str(&id_str).map_err(|e| Error::Storage(e.to_string()))?);
        }
        Ok(ids)
    }

    async fn touch_memories(&self, ids: &[Uuid], accessed_at: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        for id in ids {
            conn.execute(
                "UPDATE memories SET access_count = access_count + 1, last_accessed_at = ? WHERE id = ?",
                duckdb::params![accessed_at, id.to_string()],
            )?;
        }
        Ok(())
    }

    async fn set_importance(&self, id: Uuid, importance: f32) -> Result<()> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "UPDATE memories SET importance = ? WHERE id = ?",
            duckdb::params![importance, id.to_string()],
        )?;
        if affected == 0 {
            return Err(Error::NotFound(format!("memory {id} not found")));
        }
        Ok(())
    }

    async fn list_embeddings(&self, limit: usize, offset: usize) -> Result<Vec<(Uuid, Vec<f32>)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, embedding FROM memories ORDER BY id ASC LIMIT {limit} OFFSET {offset}"
        ))?;
        let rows = stmt.query_map([], |row| {
            let id_str: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((id_str, blob))
        })?;
        let mut results = Vec::new();
        for row in rows {
            let (id_str, blob) = row.map_err(|e| Error::Storage(e.to_string()))?;
            let id = Uuid::parse_str(&id_str).map_err(|e| Error::Storage(e.to_string()))?;
            results.push((id, deserialize_embedding(blob)));
        }
        Ok(results)
    }

    async fn insert_approval(&self, request: &ApprovalRequest) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO approval_requests (id, run_id, requested_by, reason, context, proposed_action, status, reviewed_by, review_notes, reviewed_at, created_at, expires_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            duckdb::params![
                request.id.to_string(),
                request.run_id,
                request.requested_by,
                request.reason,
                serde_json::to_string(&request.context)?,
                serde_json::to_string(&request.proposed_action)?,
                request.status.to_string(),
                request.reviewed_by,
                request.review_notes,
                request.reviewed_at,
                request.created_at,
                request.expires_at,
            ],
        )?;
        Ok(())
    }

    async fn get_approval(&self, id: Uuid) -> Result<Option<ApprovalRequest>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approval_requests WHERE id = ?"
        ))?;
        match stmt.query_row([id.to_string()], row_to_approval) {
            Ok(request) => Ok(Some(request)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }

    async fn settle_approval(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        reviewer_id: &str,
        notes: Option<&str>,
        reviewed_at: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        // Conditional write: the row must still be pending and unexpired at
        // the moment of review. A lost race shows up as zero rows affected.
        let affected = conn.execute(
            "UPDATE approval_requests SET status = ?, reviewed_by = ?, review_notes = ?, reviewed_at = ? WHERE id = ? AND status = 'pending' AND expires_at > ?",
            duckdb::params![
                status.to_string(),
                reviewer_id,
                notes,
                reviewed_at,
                id.to_string(),
                reviewed_at,
            ],
        )?;
        Ok(affected > 0)
    }

    async fn expire_approval(&self, id: Uuid, now: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "UPDATE approval_requests SET status = 'expired' WHERE id = ? AND status = 'pending' AND expires_at <= ?",
            duckdb::params![id.to_string(), now],
        )?;
        Ok(affected > 0)
    }

    async fn expire_due_approvals(&self, now: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "UPDATE approval_requests SET status = 'expired' WHERE status = 'pending' AND expires_at <= ?",
            duckdb::params![now],
        )?;
        Ok(affected)
    }

    async fn list_pending_approvals(&self, now: &str, limit: usize) -> Result<Vec<ApprovalRequest>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approval_requests WHERE status = 'pending' AND expires_at > ? ORDER BY created_at DESC LIMIT {limit}"
        ))?;
        let rows = stmt.query_map(duckdb::params![now], row_to_approval)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row.map_err(|e| Error::Storage(e.to_string()))?);
        }
        Ok(results)
    }

    async fn list_approvals_by_run(&self, run_id: &str, limit: usize) -> Result<Vec<ApprovalRequest>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approval_requests WHERE run_id = ? ORDER BY created_at ASC, id ASC LIMIT {limit}"
        ))?;
        let rows = stmt.query_map(duckdb::params![run_id], row_to_approval)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row.map_err(|e| Error::Storage(e.to_string()))?);
        }
        Ok(results)
    }

    async fn insert_activity(&self, entry: &ActivityEntry) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO activity_log (id, run_id, step_type, content, agent_id, tool_name, tool_input, tool_output, duration_ms, timestamp, metadata) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            duckdb::params![
                entry.id.to_string(),
                entry.run_id,
                entry.step_type.to_string(),
                entry.content,
                entry.agent_id,
                entry.tool_name,
                entry.tool_input.as_ref().map(|v| v.to_string()),
                entry.tool_output.as_ref().map(|v| v.to_string()),
                entry.duration_ms,
                entry.timestamp,
                serde_json::to_string(&entry.metadata)?,
            ],
        )?;
        Ok(())
    }

    async fn list_activity(&self, run_id: &str, limit: usize) -> Result<Vec<ActivityEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activity_log WHERE run_id = ? ORDER BY timestamp ASC, id ASC LIMIT {limit}"
        ))?;
        let rows = stmt.query_map(duckdb::params![run_id], row_to_activity)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row.map_err(|e| Error::Storage(e.to_string()))?);
        }
        Ok(results)
    }
}
