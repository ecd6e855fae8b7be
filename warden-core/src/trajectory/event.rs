use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::correction::Correction;
use crate::rules::Violation;

/// One entry of the trajectory journal
///
/// Serialized with a `type` tag in snake_case and camelCase fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TrajectoryEvent {
    /// The agent invoked a tool
    ToolUse {
        agent_id: String,
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<serde_json::Value>,
        timestamp: DateTime<Utc>,
    },

    /// A tool returned
    ToolResult {
        agent_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Assistant text
    Message {
        agent_id: String,
        text: String,
        timestamp: DateTime<Utc>,
    },

    Heartbeat {
        agent_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A rule fired against the agent
    Correction {
        agent_id: String,
        violation: Violation,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correction: Option<Correction>,
        timestamp: DateTime<Utc>,
    },

    Spawn {
        agent_id: String,
        agent_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        session_id: String,
        timestamp: DateTime<Utc>,
    },

    PhaseTransition {
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
    },

    TaskClaim {
        agent_id: String,
        task_id: String,
        timestamp: DateTime<Utc>,
    },

    TaskComplete {
        agent_id: String,
        task_id: String,
        timestamp: DateTime<Utc>,
    },

    /// The agent declared itself finished
    Stop {
        agent_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl TrajectoryEvent {
    pub fn tool_use(
        agent_id: impl Into<String>,
        tool: impl Into<String>,
        path: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        TrajectoryEvent::ToolUse {
            agent_id: agent_id.into(),
            tool: tool.into(),
            path,
            args: None,
            timestamp,
        }
    }

    pub fn message(agent_id: impl Into<String>, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        TrajectoryEvent::Message {
            agent_id: agent_id.into(),
            text: text.into(),
            timestamp,
        }
    }

    pub fn heartbeat(agent_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        TrajectoryEvent::Heartbeat {
            agent_id: agent_id.into(),
            timestamp,
        }
    }

    pub fn stop(agent_id: impl Into<String>, reason: Option<String>, timestamp: DateTime<Utc>) -> Self {
        TrajectoryEvent::Stop {
            agent_id: agent_id.into(),
            reason,
            timestamp,
        }
    }

    /// Wire tag of this event
    pub fn kind(&self) -> &'static str {
        match self {
            TrajectoryEvent::ToolUse { .. } => "tool_use",
            TrajectoryEvent::ToolResult { .. } => "tool_result",
            TrajectoryEvent::Message { .. } => "message",
            TrajectoryEvent::Heartbeat { .. } => "heartbeat",
            TrajectoryEvent::Correction { .. } => "correction",
            TrajectoryEvent::Spawn { .. } => "spawn",
            TrajectoryEvent::PhaseTransition { .. } => "phase_transition",
            TrajectoryEvent::TaskClaim { .. } => "task_claim",
            TrajectoryEvent::TaskComplete { .. } => "task_complete",
            TrajectoryEvent::Stop { .. } => "stop",
        }
    }

    /// Agent the event belongs to; phase transitions belong to none
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            TrajectoryEvent::ToolUse { agent_id, .. }
            | TrajectoryEvent::ToolResult { agent_id, .. }
            | TrajectoryEvent::Message { agent_id, .. }
            | TrajectoryEvent::Heartbeat { agent_id, .. }
            | TrajectoryEvent::Correction { agent_id, .. }
            | TrajectoryEvent::Spawn { agent_id, .. }
            | TrajectoryEvent::TaskClaim { agent_id, .. }
            | TrajectoryEvent::TaskComplete { agent_id, .. }
            | TrajectoryEvent::Stop { agent_id, .. } => Some(agent_id),
            TrajectoryEvent::PhaseTransition { .. } => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TrajectoryEvent::ToolUse { timestamp, .. }
            | TrajectoryEvent::ToolResult { timestamp, .. }
            | TrajectoryEvent::Message { timestamp, .. }
            | TrajectoryEvent::Heartbeat { timestamp, .. }
            | TrajectoryEvent::Correction { timestamp, .. }
            | TrajectoryEvent::Spawn { timestamp, .. }
            | TrajectoryEvent::PhaseTransition { timestamp, .. }
            | TrajectoryEvent::TaskClaim { timestamp, .. }
            | TrajectoryEvent::TaskComplete { timestamp, .. }
            | TrajectoryEvent::Stop { timestamp, .. } => *timestamp,
        }
    }

    pub fn belongs_to(&self, agent_id: &str) -> bool {
        self.agent_id() == Some(agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let event = TrajectoryEvent::tool_use("worker-1", "Write", Some("src/a.ts".into()), Utc::now());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool_use");
        assert_eq!(json["agentId"], "worker-1");
        assert_eq!(json["path"], "src/a.ts");
        assert!(json.get("args").is_none());
    }

    #[test]
    fn test_parse_phase_transition() {
        let json = r#"{"type":"phase_transition","from":"explore","to":"plan","timestamp":"2025-01-01T00:00:00Z"}"#;
        let event: TrajectoryEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind(), "phase_transition");
        assert!(event.agent_id().is_none());
    }

    #[test]
    fn test_parse_tool_result_defaults() {
        let json = r#"{"type":"tool_result","agentId":"a","timestamp":"2025-01-01T00:00:00Z"}"#;
        let event: TrajectoryEvent = serde_json::from_str(json).unwrap();
        match event {
            TrajectoryEvent::ToolResult { is_error, output, .. } => {
                assert!(!is_error);
                assert!(output.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
