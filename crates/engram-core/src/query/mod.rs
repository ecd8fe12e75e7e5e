pub mod activity;
pub mod ancestry;
pub mod checkpoint;
pub mod fork;
pub mod gate;
pub mod recall;
pub mod reinforce;
pub mod remember;

use std::sync::Arc;
use std::time::Duration;

use crate::cache::RecordCache;
use crate::error::Result;
use crate::index::VectorIndex;
use crate::model::activity::ActivityEntry;
use crate::model::approval::ApprovalRequest;
use crate::model::checkpoint::Checkpoint;
use crate::storage::StorageBackend;

/// The four store contracts behind one handle: checkpoints, memories, the
/// approval gate, and the activity log. All state flows through `storage`;
/// the vector index is a derived structure rebuilt from it.
pub struct EngramEngine {
    pub storage: Arc<dyn StorageBackend>,
    pub index: Arc<dyn VectorIndex>,
    pub cache: Option<Arc<RecordCache>>,
}

impl EngramEngine {
    pub fn new(storage: Arc<dyn StorageBackend>, index: Arc<dyn VectorIndex>) -> Self {
        Self {
            storage,
            index,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<RecordCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn dimensions(&self) -> usize {
        self.index.dimensions()
    }

    // Checkpoint store

    pub async fn checkpoint(&self, request: checkpoint::CheckpointRequest) -> Result<Checkpoint> {
        checkpoint::execute(self, request).await
    }

    pub async fn latest_checkpoint(&self, thread_id: &str, checkpoint_ns: &str) -> Result<Checkpoint> {
        checkpoint::latest(self, thread_id, checkpoint_ns).await
    }

    pub async fn get_checkpoint(&self, id: uuid::Uuid) -> Result<Checkpoint> {
        checkpoint::get(self, id).await
    }

    pub async fn ancestors(&self, id: uuid::Uuid) -> Result<Vec<Checkpoint>> {
        ancestry::ancestors(self, id).await
    }

    pub async fn children(&self, id: uuid::Uuid) -> Result<Vec<Checkpoint>> {
        ancestry::children(self, id).await
    }

    pub async fn fork(&self, request: fork::ForkRequest) -> Result<Checkpoint> {
        fork::execute(self, request).await
    }

    // Memory store

    pub async fn remember(&self, request: remember::RememberRequest) -> Result<remember::RememberResponse> {
        remember::execute(self, request).await
    }

    /// The single external retrieval entry point: similarity-ranked,
    /// importance-weighted recall with access bookkeeping.
    pub async fn recall(&self, request: recall::RecallRequest) -> Result<recall::RecallResponse> {
        recall::execute(self, request).await
    }

    pub async fn reinforce(&self, memory_id: uuid::Uuid, importance: f32) -> Result<()> {
        reinforce::execute(self, memory_id, importance).await
    }

    /// Repopulate the vector index from stored embeddings. Called once on
    /// startup; returns the number of vectors indexed.
    pub async fn rebuild_index(&self) -> Result<usize> {
        const PAGE: usize = 512;
        let mut offset = 0;
        let mut total = 0;
        loop {
            let page = self.storage.list_embeddings(PAGE, offset).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            for (id, embedding) in page {
                self.index.add(id, &embedding)?;
                total += 1;
            }
        }
        Ok(total)
    }

    // Approval gate

    pub async fn request_approval(&self, request: gate::ApprovalInput) -> Result<ApprovalRequest> {
        gate::request(self, request).await
    }

    pub async fn review(&self, request: gate::ReviewInput) -> Result<ApprovalRequest> {
        gate::review(self, request).await
    }

    pub async fn sweep_expired(&self, now: chrono::DateTime<chrono::Utc>) -> Result<usize> {
        gate::sweep_expired(self, now).await
    }

    pub async fn await_decision(
        &self,
        request_id: uuid::Uuid,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<ApprovalRequest> {
        gate::await_decision(self, request_id, poll_interval, timeout).await
    }

    pub async fn pending_approvals(&self, limit: usize) -> Result<Vec<ApprovalRequest>> {
        gate::list_pending(self, limit).await
    }

    // Activity log

    pub async fn record_activity(&self, input: activity::ActivityInput) -> Result<ActivityEntry> {
        activity::record(self, input).await
    }

    pub async fn run_activity(&self, run_id: &str, limit: usize) -> Result<Vec<ActivityEntry>> {
        activity::list(self, run_id, limit).await
    }
}
