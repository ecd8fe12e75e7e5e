use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One immutable snapshot of a graph execution's working state.
///
/// Checkpoints within a (thread_id, checkpoint_ns) partition form a linear
/// committed history; forking into a new namespace creates the branch points
/// of the overall tree. Once written, a checkpoint is never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub id: Uuid,
    pub thread_id: String,
    pub checkpoint_ns: String,
    pub parent_id: Option<Uuid>,
    /// Latest value per named channel.
    pub channel_values: BTreeMap<String, serde_json::Value>,
    /// Monotonically increasing version per channel, used to detect which
    /// channels changed between checkpoints.
    pub channel_versions: BTreeMap<String, u64>,
    /// Per-consumer record of the channel versions it has already observed.
    pub versions_seen: BTreeMap<String, BTreeMap<String, u64>>,
    /// Messages scheduled for delivery but not yet applied, carried forward
    /// so a crash between "decide to send" and "apply send" is recoverable.
    pub pending_sends: Vec<PendingSend>,
    pub source: String,
    pub step: i64,
    pub created_at: String,
    pub metadata: serde_json::Value,
}

impl Checkpoint {
    /// True when a consumer has unseen channel versions and must re-run.
    pub fn needs_step(&self, consumer_id: &str) -> bool {
        let seen = self.versions_seen.get(consumer_id);
        self.channel_versions.iter().any(|(channel, version)| {
            let observed = seen.and_then(|s| s.get(channel)).copied().unwrap_or(0);
            *version > observed
        })
    }

    pub fn is_done(&self) -> bool {
        self.metadata
            .get("done")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// A message queued inside a checkpoint for crash-safe, at-least-once
/// delivery. The id is the dedup identity receivers key on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingSend {
    pub id: Uuid,
    pub channel: String,
    pub payload: serde_json::Value,
    /// Sensitive sends must pass the approval gate before execution.
    pub sensitive: bool,
    pub reason: Option<String>,
}
