use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::memory::{MemoryRecord, MemoryType};
use crate::query::EngramEngine;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RememberRequest {
    pub content: String,
    pub embedding: Vec<f32>,
    pub memory_type: Option<MemoryType>,
    pub importance: Option<f32>,
    pub agent_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl RememberRequest {
    pub fn new(content: String, embedding: Vec<f32>) -> Self {
        Self {
            content,
            embedding,
            memory_type: None,
            importance: None,
            agent_id: None,
            metadata: None,
        }
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RememberResponse {
    pub id: Uuid,
    pub created_at: String,
}

impl RememberResponse {
    pub fn new(id: Uuid, created_at: String) -> Self {
        Self { id, created_at }
    }
}

pub async fn execute(engine: &EngramEngine, request: RememberRequest) -> Result<RememberResponse> {
    if request.content.trim().is_empty() {
        return Err(Error::Validation("content cannot be empty".to_string()));
    }

    let dimensions = engine.dimensions();
    if request.embedding.len() != dimensions {
        return Err(Error::Validation(format!(
            "expected {dimensions} embedding dimensions, got {}",
            request.embedding.len()
        )));
    }

    let importance = request.importance.unwrap_or(0.5);
    if !(0.0..=1.0).contains(&importance) {
        return Err(Error::Validation(
            "importance must be between 0.0 and 1.0".to_string(),
        ));
    }

    let id = Uuid::now_v7();
    let now = chrono::Utc::now().to_rfc3339();

    let record = MemoryRecord {
        id,
        agent_id: request.agent_id,
        content: request.content,
        embedding: request.embedding,
        memory_type: request.memory_type.unwrap_or(MemoryType::Episodic),
        importance,
        access_count: 0,
        last_accessed_at: None,
        metadata: request
            .metadata
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
        created_at: now.clone(),
    };

    // Durable row first, then the derived index entry.
    engine.storage.insert_memory(&record).await?;
    engine.index.add(id, &record.embedding)?;

    if let Some(ref cache) = engine.cache {
        cache.put(record);
    }

    Ok(RememberResponse { id, created_at: now })
}
