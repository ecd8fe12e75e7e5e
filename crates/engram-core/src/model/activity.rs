use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Append-only record of one runtime event within a run. Never mutated or
/// deleted; ordering is by timestamp (id as tiebreak) within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityEntry {
    pub id: Uuid,
    pub run_id: String,
    pub step_type: StepType,
    pub content: String,
    pub agent_id: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<serde_json::Value>,
    pub tool_output: Option<serde_json::Value>,
    pub duration_ms: Option<i64>,
    pub timestamp: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Thinking,
    Action,
    Observation,
    Decision,
    Error,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepType::Thinking => write!(f, "thinking"),
            StepType::Action => write!(f, "action"),
            StepType::Observation => write!(f, "observation"),
            StepType::Decision => write!(f, "decision"),
            StepType::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for StepType {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "thinking" => Ok(StepType::Thinking),
            "action" => Ok(StepType::Action),
            "observation" => Ok(StepType::Observation),
            "decision" => Ok(StepType::Decision),
            "error" => Ok(StepType::Error),
            _ => Err(crate::error::Error::Validation(format!(
                "invalid step type: {s}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_serde() {
        let entry = ActivityEntry {
            id: Uuid::now_v7(),
            run_id: "run-1".to_string(),
            step_type: StepType::Action,
            content: "Executing tool: send_notification".to_string(),
            agent_id: Some("agent-1".to_string()),
            tool_name: Some("send_notification".to_string()),
            tool_input: Some(serde_json::json!({"to": "ops"})),
            tool_output: None,
            duration_ms: Some(12),
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            metadata: serde_json::json!({}),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let deserialized: ActivityEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(entry, deserialized);
    }

    #[test]
    fn test_step_type_display_fromstr() {
        assert_eq!(StepType::Thinking.to_string(), "thinking");
        assert_eq!("decision".parse::<StepType>().unwrap(), StepType::Decision);
        assert_eq!("error".parse::<StepType>().unwrap(), StepType::Error);
        assert!("invalid".parse::<StepType>().is_err());
    }
}
