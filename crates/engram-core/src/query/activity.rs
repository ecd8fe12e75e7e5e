use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::activity::{ActivityEntry, StepType};
use crate::query::EngramEngine;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityInput {
    pub run_id: String,
    pub step_type: StepType,
    pub content: String,
    pub agent_id: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<serde_json::Value>,
    pub tool_output: Option<serde_json::Value>,
    pub duration_ms: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}

impl ActivityInput {
    pub fn new(run_id: String, step_type: StepType, content: String) -> Self {
        Self {
            run_id,
            step_type,
            content,
            agent_id: None,
            tool_name: None,
            tool_input: None,
            tool_output: None,
            duration_ms: None,
            metadata: None,
        }
    }
}

pub async fn record(engine: &EngramEngine, input: ActivityInput) -> Result<ActivityEntry> {
    if input.run_id.trim().is_empty() {
        return Err(Error::Validation("run_id cannot be empty".to_string()));
    }

    let entry = ActivityEntry {
        id: Uuid::now_v7(),
        run_id: input.run_id,
        step_type: input.step_type,
        content: input.content,
        agent_id: input.agent_id,
        tool_name: input.tool_name,
        tool_input: input.tool_input,
        tool_output: input.tool_output,
        duration_ms: input.duration_ms,
        timestamp: chrono::Utc::now().to_rfc3339(),
        metadata: input
            .metadata
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
    };
    engine.storage.insert_activity(&entry).await?;
    Ok(entry)
}

pub async fn list(engine: &EngramEngine, run_id: &str, limit: usize) -> Result<Vec<ActivityEntry>> {
    engine.storage.list_activity(run_id, limit).await
}
