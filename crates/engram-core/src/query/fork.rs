use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::checkpoint::Checkpoint;
use crate::query::EngramEngine;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkRequest {
    pub thread_id: String,
    /// Namespace to fork from; the root namespace when omitted.
    pub source_ns: Option<String>,
    pub new_ns: String,
    /// Specific branch point; latest of the source namespace when omitted.
    pub source_checkpoint_id: Option<Uuid>,
}

impl ForkRequest {
    pub fn new(thread_id: String, new_ns: String) -> Self {
        Self {
            thread_id,
            source_ns: None,
            new_ns,
            source_checkpoint_id: None,
        }
    }
}

/// Branch a thread's history into a new namespace for replay or what-if
/// execution. The fork checkpoint copies the source state and keeps a
/// cross-namespace parent reference, so ancestry walks reach the original
/// root while committed history within each namespace stays linear.
pub async fn execute(engine: &EngramEngine, request: ForkRequest) -> Result<Checkpoint> {
    if request.thread_id.trim().is_empty() {
        return Err(Error::Validation("thread_id cannot be empty".to_string()));
    }
    if request.new_ns.trim().is_empty() {
        return Err(Error::Validation("new_ns cannot be empty".to_string()));
    }
    let source_ns = request.source_ns.unwrap_or_default();
    if request.new_ns == source_ns {
        return Err(Error::Validation(
            "cannot fork a namespace onto itself".to_string(),
        ));
    }

    if engine
        .storage
        .latest_checkpoint(&request.thread_id, &request.new_ns)
        .await?
        .is_some()
    {
        return Err(Error::Conflict(format!(
            "namespace '{}' already has history in thread '{}'",
            request.new_ns, request.thread_id
        )));
    }

    let source = match request.source_checkpoint_id {
        Some(cp_id) => {
            let cp = engine
                .storage
                .get_checkpoint(cp_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("checkpoint {cp_id} not found")))?;
            if cp.thread_id != request.thread_id || cp.checkpoint_ns != source_ns {
                return Err(Error::InvalidParent(format!(
                    "checkpoint {cp_id} belongs to thread '{}' ns '{}'",
                    cp.thread_id, cp.checkpoint_ns
                )));
            }
            cp
        }
        None => engine
            .storage
            .latest_checkpoint(&request.thread_id, &source_ns)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no checkpoint to fork in thread '{}' ns '{source_ns}'",
                    request.thread_id
                ))
            })?,
    };

    let cp = Checkpoint {
        id: Uuid::now_v7(),
        thread_id: request.thread_id,
        checkpoint_ns: request.new_ns,
        parent_id: Some(source.id),
        channel_values: source.channel_values.clone(),
        channel_versions: source.channel_versions.clone(),
        versions_seen: source.versions_seen.clone(),
        pending_sends: source.pending_sends.clone(),
        source: "fork".to_string(),
        step: source.step,
        created_at: chrono::Utc::now().to_rfc3339(),
        metadata: serde_json::json!({"forked_from": source.id.to_string()}),
    };

    engine.storage.insert_checkpoint(&cp).await?;

    tracing::debug!(
        checkpoint_id = %cp.id,
        source_checkpoint = %source.id,
        ns = %cp.checkpoint_ns,
        "namespace forked"
    );

    Ok(cp)
}
