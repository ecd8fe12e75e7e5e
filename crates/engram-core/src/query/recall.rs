use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::memory::{MemoryRecord, MemoryType};
use crate::query::EngramEngine;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallRequest {
    pub embedding: Vec<f32>,
    /// Only results with similarity strictly greater than this are returned.
    pub threshold: Option<f32>,
    pub limit: Option<usize>,
    pub agent_id: Option<String>,
    pub memory_type: Option<MemoryType>,
}

impl RecallRequest {
    pub fn new(embedding: Vec<f32>) -> Self {
        Self {
            embedding,
            threshold: None,
            limit: None,
            agent_id: None,
            memory_type: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallResponse {
    pub memories: Vec<ScoredMemory>,
    pub total: usize,
}

/// A retrieved memory with its cosine similarity to the query. The record
/// snapshot predates this retrieval's access-count bump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub id: Uuid,
    pub agent_id: Option<String>,
    pub content: String,
    pub memory_type: MemoryType,
    pub importance: f32,
    pub access_count: u64,
    pub metadata: serde_json::Value,
    pub created_at: String,
    pub similarity: f32,
}

impl From<(MemoryRecord, f32)> for ScoredMemory {
    fn from((record, similarity): (MemoryRecord, f32)) -> Self {
        Self {
            id: record.id,
            agent_id: record.agent_id,
            content: record.content,
            memory_type: record.memory_type,
            importance: record.importance,
            access_count: record.access_count,
            metadata: record.metadata,
            created_at: record.created_at,
            similarity,
        }
    }
}

async fn get_memory_cached(engine: &EngramEngine, id: Uuid) -> Result<Option<MemoryRecord>> {
    if let Some(ref cache) = engine.cache {
        if let Some(record) = cache.get(id) {
            return Ok(Some(record));
        }
    }
    let result = engine.storage.get_memory(id).await?;
    if let Some(ref record) = result {
        if let Some(ref cache) = engine.cache {
            cache.put(record.clone());
        }
    }
    Ok(result)
}

pub async fn execute(engine: &EngramEngine, request: RecallRequest) -> Result<RecallResponse> {
    let dimensions = engine.dimensions();
    if request.embedding.len() != dimensions {
        return Err(Error::Validation(format!(
            "expected {dimensions} embedding dimensions, got {}",
            request.embedding.len()
        )));
    }

    let threshold = request.threshold.unwrap_or(0.7);
    if !(-1.0..=1.0).contains(&threshold) {
        return Err(Error::Validation(
            "threshold must be between -1.0 and 1.0".to_string(),
        ));
    }
    let limit = request.limit.unwrap_or(5).max(1);

    // Owner restriction happens inside the index search so oversampling can
    // compensate for filtered-out neighbors.
    let candidates = match request.agent_id {
        Some(ref agent_id) => {
            let owned: HashSet<Uuid> = engine
                .storage
                .list_memory_ids_by_agent(agent_id, 10_000)
                .await?
                .into_iter()
                .collect();
            engine
                .index
                .filtered_search(&request.embedding, limit * 3, &|id| owned.contains(&id))?
        }
        None => engine.index.search(&request.embedding, limit * 3)?,
    };

    let mut scored: Vec<(MemoryRecord, f32)> = Vec::new();
    for (id, distance) in candidates {
        let similarity = 1.0 - distance;
        if similarity <= threshold {
            // Candidates arrive in ascending distance order, so everything
            // after this point is below threshold too.
            break;
        }
        if let Some(record) = get_memory_cached(engine, id).await? {
            if let Some(memory_type) = request.memory_type {
                if record.memory_type != memory_type {
                    continue;
                }
            }
            scored.push((record, similarity));
        }
        if scored.len() >= limit {
            break;
        }
    }

    // Access bookkeeping is a write on the read path: one atomic increment
    // per returned memory, durable before the response is handed back.
    let accessed_at = chrono::Utc::now().to_rfc3339();
    let ids: Vec<Uuid> = scored.iter().map(|(record, _)| record.id).collect();
    engine.storage.touch_memories(&ids, &accessed_at).await?;
    if let Some(ref cache) = engine.cache {
        for id in &ids {
            cache.invalidate(*id);
        }
    }

    let total = scored.len();
    let memories = scored.into_iter().map(ScoredMemory::from).collect();

    tracing::debug!(results = total, threshold, "memories recalled");

    Ok(RecallResponse { memories, total })
}
