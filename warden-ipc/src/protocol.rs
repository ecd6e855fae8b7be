//! Wire types of the control protocol
//!
//! One JSON document per line in both directions. Clients send a
//! [`Request`]; the daemon answers each one with a [`Response`] and, on
//! subscribed connections, interleaves [`PushEvent`]s.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Topics the daemon publishes
pub const CHANNELS: &[&str] = &["trajectory", "state", "violations"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Request {
    Ping,
    GetState,
    /// Daemon summary; `event_count` adds that many recent trajectory events
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_count: Option<usize>,
    },
    Heartbeat {
        worker_id: String,
    },
    TaskClaim {
        worker_id: String,
    },
    TaskComplete {
        task_id: String,
        worker_id: String,
        #[serde(default)]
        force: bool,
    },
    /// Drop all workflow state and start the plan over
    PlanReset,
    GetLogs {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },
    Subscribe {
        channel: String,
    },
    Shutdown,
    Exec(ExecRequest),
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::GetState => "get_state",
            Request::Status { .. } => "status",
            Request::Heartbeat { .. } => "heartbeat",
            Request::TaskClaim { .. } => "task_claim",
            Request::TaskComplete { .. } => "task_complete",
            Request::PlanReset => "plan_reset",
            Request::GetLogs { .. } => "get_logs",
            Request::Subscribe { .. } => "subscribe",
            Request::Shutdown => "shutdown",
            Request::Exec(_) => "exec",
        }
    }
}

/// A process to run on the daemon's host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    /// Program followed by its arguments
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Milliseconds before the process is killed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Run only while no other exclusive exec is running
    #[serde(default)]
    pub exclusive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Ok {
        #[serde(default)]
        data: serde_json::Value,
    },
    Error {
        message: String,
    },
}

impl Response {
    pub fn ok(data: serde_json::Value) -> Self {
        Response::Ok { data }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }
}

/// Notification sent to subscribers of a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    /// Always `"event"`
    #[serde(rename = "type")]
    pub kind: String,
    pub event: String,
    pub data: serde_json::Value,
}

impl PushEvent {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: "event".to_string(),
            event: event.into(),
            data,
        }
    }
}

/// Anything the daemon writes to a connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Event(PushEvent),
    Response(Response),
}

/// One line of JSON, newline included
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
