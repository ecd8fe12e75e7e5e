pub mod duckdb;
pub mod migrations;

use crate::error::Result;
use crate::model::activity::ActivityEntry;
use crate::model::approval::{ApprovalRequest, ApprovalStatus};
use crate::model::checkpoint::Checkpoint;
use crate::model::memory::MemoryRecord;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    pub agent_id: Option<String>,
    pub memory_type: Option<crate::model::memory::MemoryType>,
    pub min_importance: Option<f32>,
}

/// The single boundary to durable storage. No component above this trait
/// touches the underlying database directly.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    // Checkpoints (append-only tree nodes)
    /// Insert a new checkpoint. Returns `Conflict` when the partition
    /// already has a root (parentless insert) or the parent already has a
    /// child within the partition; callers re-read latest and retry.
    async fn insert_checkpoint(&self, cp: &Checkpoint) -> Result<()>;
    async fn get_checkpoint(&self, id: Uuid) -> Result<Option<Checkpoint>>;
    async fn latest_checkpoint(&self, thread_id: &str, checkpoint_ns: &str) -> Result<Option<Checkpoint>>;
    async fn checkpoint_children(&self, parent_id: Uuid) -> Result<Vec<Checkpoint>>;

    // Memories
    async fn insert_memory(&self, record: &MemoryRecord) -> Result<()>;
    async fn get_memory(&self, id: Uuid) -> Result<Option<MemoryRecord>>;
    async fn list_memories(&self, filter: &MemoryFilter, limit: usize, offset: usize) -> Result<Vec<MemoryRecord>>;
    async fn list_memory_ids_by_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<Uuid>>;
    /// Atomic per-row `access_count + 1` and last-access stamp; safe under
    /// concurrent retrievals (never read-modify-write).
    async fn touch_memories(&self, ids: &[Uuid], accessed_at: &str) -> Result<()>;
    /// Importance revision path; `NotFound` if the memory is absent.
    async fn set_importance(&self, id: Uuid, importance: f32) -> Result<()>;
    /// Page through stored embeddings to rebuild the vector index.
    async fn list_embeddings(&self, limit: usize, offset: usize) -> Result<Vec<(Uuid, Vec<f32>)>>;

    // Approval requests
    async fn insert_approval(&self, request: &ApprovalRequest) -> Result<()>;
    async fn get_approval(&self, id: Uuid) -> Result<Option<ApprovalRequest>>;
    /// Conditional review transition keyed on `status = 'pending'` and an
    /// unexpired deadline. Returns whether the update applied.
    async fn settle_approval(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        reviewer_id: &str,
        notes: Option<&str>,
        reviewed_at: &str,
    ) -> Result<bool>;
    /// Conditional single-row expiry (`status = 'pending' AND expires_at <= now`).
    async fn expire_approval(&self, id: Uuid, now: &str) -> Result<bool>;
    /// Bulk expiry sweep; returns the number of requests transitioned.
    async fn expire_due_approvals(&self, now: &str) -> Result<usize>;
    async fn list_pending_approvals(&self, now: &str, limit: usize) -> Result<Vec<ApprovalRequest>>;
    async fn list_approvals_by_run(&self, run_id: &str, limit: usize) -> Result<Vec<ApprovalRequest>>;

    // Activity log (append-only)
    async fn insert_activity(&self, entry: &ActivityEntry) -> Result<()>;
    async fn list_activity(&self, run_id: &str, limit: usize) -> Result<Vec<ActivityEntry>>;
}
