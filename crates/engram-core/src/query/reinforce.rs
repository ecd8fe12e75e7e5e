use uuid::Uuid;

use crate::error::Result;
use crate::query::EngramEngine;

/// Revise a memory's importance, clamped to [0, 1]. This is the write path
/// the (external) consolidation process uses; retrieval never calls it.
pub async fn execute(engine: &EngramEngine, memory_id: Uuid, importance: f32) -> Result<()> {
    let clamped = importance.clamp(0.0, 1.0);
    engine.storage.set_importance(memory_id, clamped).await?;
    if let Some(ref cache) = engine.cache {
        cache.invalidate(memory_id);
    }
    tracing::debug!(memory_id = %memory_id, importance = clamped, "memory reinforced");
    Ok(())
}
