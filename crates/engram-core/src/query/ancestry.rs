use std::collections::HashSet;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::checkpoint::Checkpoint;
use crate::query::EngramEngine;

/// Walk parent references from a checkpoint back to the root and return the
/// path root-first. A repeated id or a dangling parent reference means the
/// history is corrupt; both fail loudly instead of looping or repairing.
pub async fn ancestors(engine: &EngramEngine, id: Uuid) -> Result<Vec<Checkpoint>> {
    let mut chain = Vec::new();
    let mut seen: HashSet<Uuid> = HashSet::new();
    let mut cursor = Some(id);

    while let Some(current) = cursor {
        if !seen.insert(current) {
            return Err(Error::CorruptHistory(format!(
                "cycle through checkpoint {current}"
            )));
        }
        let cp = match engine.storage.get_checkpoint(current).await? {
            Some(cp) => cp,
            None if chain.is_empty() => {
                return Err(Error::NotFound(format!("checkpoint {current} not found")));
            }
            None => {
                return Err(Error::CorruptHistory(format!(
                    "dangling parent reference to {current}"
                )));
            }
        };
        cursor = cp.parent_id;
        chain.push(cp);
    }

    chain.reverse();
    Ok(chain)
}

/// Direct children of a checkpoint, across namespaces (fork points show up
/// here alongside the linear successor).
pub async fn children(engine: &EngramEngine, id: Uuid) -> Result<Vec<Checkpoint>> {
    if engine.storage.get_checkpoint(id).await?.is_none() {
        return Err(Error::NotFound(format!("checkpoint {id} not found")));
    }
    engine.storage.checkpoint_children(id).await
}
