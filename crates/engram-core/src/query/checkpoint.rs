use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::checkpoint::{Checkpoint, PendingSend};
use crate::query::EngramEngine;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRequest {
    pub thread_id: String,
    pub checkpoint_ns: Option<String>,
    pub parent_id: Option<Uuid>,
    pub channel_values: BTreeMap<String, serde_json::Value>,
    pub channel_versions: BTreeMap<String, u64>,
    pub versions_seen: BTreeMap<String, BTreeMap<String, u64>>,
    pub pending_sends: Vec<PendingSend>,
    pub source: Option<String>,
    pub step: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}

impl CheckpointRequest {
    pub fn new(thread_id: String, channel_values: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            thread_id,
            checkpoint_ns: None,
            parent_id: None,
            channel_values,
            channel_versions: BTreeMap::new(),
            versions_seen: BTreeMap::new(),
            pending_sends: Vec::new(),
            source: None,
            step: None,
            metadata: None,
        }
    }
}

/// Append a new immutable checkpoint to a (thread, namespace) partition.
pub async fn execute(engine: &EngramEngine, request: CheckpointRequest) -> Result<Checkpoint> {
    if request.thread_id.trim().is_empty() {
        return Err(Error::Validation("thread_id cannot be empty".to_string()));
    }

    let checkpoint_ns = request.checkpoint_ns.unwrap_or_default();

    // A supplied parent must exist and live in the same partition.
    let parent = match request.parent_id {
        Some(parent_id) => {
            let parent = engine
                .storage
                .get_checkpoint(parent_id)
                .await?
                .ok_or_else(|| Error::InvalidParent(format!("checkpoint {parent_id} does not exist")))?;
            if parent.thread_id != request.thread_id || parent.checkpoint_ns != checkpoint_ns {
                return Err(Error::InvalidParent(format!(
                    "checkpoint {parent_id} belongs to thread '{}' ns '{}'",
                    parent.thread_id, parent.checkpoint_ns
                )));
            }
            Some(parent)
        }
        None => None,
    };

    // Channel versions never move backwards relative to the parent.
    if let Some(ref parent) = parent {
        for (channel, version) in &parent.channel_versions {
            let new_version = request.channel_versions.get(channel).copied().unwrap_or(0);
            if new_version < *version {
                return Err(Error::Validation(format!(
                    "channel '{channel}' version regressed from {version} to {new_version}"
                )));
            }
        }
    }

    let step = request
        .step
        .unwrap_or_else(|| parent.as_ref().map(|p| p.step + 1).unwrap_or(0));

    let cp = Checkpoint {
        id: Uuid::now_v7(),
        thread_id: request.thread_id,
        checkpoint_ns,
        parent_id: request.parent_id,
        channel_values: request.channel_values,
        channel_versions: request.channel_versions,
        versions_seen: request.versions_seen,
        pending_sends: request.pending_sends,
        source: request.source.unwrap_or_else(|| "loop".to_string()),
        step,
        created_at: chrono::Utc::now().to_rfc3339(),
        metadata: request
            .metadata
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
    };

    engine.storage.insert_checkpoint(&cp).await?;

    tracing::debug!(
        checkpoint_id = %cp.id,
        thread_id = %cp.thread_id,
        step = cp.step,
        "checkpoint saved"
    );

    Ok(cp)
}

/// Latest checkpoint of a partition; `NotFound` distinguishes an empty
/// history from a storage failure.
pub async fn latest(engine: &EngramEngine, thread_id: &str, checkpoint_ns: &str) -> Result<Checkpoint> {
    engine
        .storage
        .latest_checkpoint(thread_id, checkpoint_ns)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!(
                "no checkpoint in thread '{thread_id}' ns '{checkpoint_ns}'"
            ))
        })
}

pub async fn get(engine: &EngramEngine, id: Uuid) -> Result<Checkpoint> {
    engine
        .storage
        .get_checkpoint(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("checkpoint {id} not found")))
}
