//! Output parsing for the agent stream-json format

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::trajectory::TrajectoryEvent;

/// A message from the stream-json output
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// System message at the start
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Assistant output (text and tool calls)
    Assistant {
        #[serde(default)]
        message: StreamContent,
    },

    /// Tool results echoed back as user turns
    User {
        #[serde(default)]
        message: StreamContent,
    },

    /// Flat tool usage
    ToolUse {
        tool: String,
        #[serde(default)]
        input: serde_json::Value,
    },

    /// Flat tool result
    ToolResult {
        #[serde(default)]
        output: String,
        #[serde(default)]
        is_error: bool,
    },

    /// Final result of the session
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        session_id: Option<String>,
    },
}

/// Message body: plain text or content blocks
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StreamContent {
    #[serde(default)]
    pub content: ContentBody,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ContentBody {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for ContentBody {
    fn default() -> Self {
        ContentBody::Text(String::new())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

/// Which pipe a raw line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One observation of a running agent, queued for the event loop
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutput {
    Session {
        session_id: String,
    },
    Message {
        text: String,
    },
    ToolUse {
        tool: String,
        path: Option<String>,
        input: serde_json::Value,
    },
    ToolResult {
        tool: Option<String>,
        output: String,
        is_error: bool,
    },
    /// The agent finished its turn
    Stop {
        reason: Option<String>,
    },
    /// A line that is not stream-json
    Raw {
        stream: OutputStream,
        line: String,
    },
    /// The process is gone
    Exited {
        code: Option<i32>,
    },
}

impl AgentOutput {
    /// Trajectory form of this output; raw lines, session notices and exits have none
    pub fn to_event(&self, agent_id: &str, now: DateTime<Utc>) -> Option<TrajectoryEvent> {
        match self {
            AgentOutput::Message { text } => Some(TrajectoryEvent::message(agent_id, text.clone(), now)),
            AgentOutput::ToolUse { tool, path, input } => Some(TrajectoryEvent::ToolUse {
                agent_id: agent_id.to_string(),
                tool: tool.clone(),
                path: path.clone(),
                args: if input.is_null() { None } else { Some(input.clone()) },
                timestamp: now,
            }),
            AgentOutput::ToolResult {
                tool,
                output,
                is_error,
            } => Some(TrajectoryEvent::ToolResult {
                agent_id: agent_id.to_string(),
                tool: tool.clone(),
                is_error: *is_error,
                output: Some(output.clone()),
                timestamp: now,
            }),
            AgentOutput::Stop { reason } => Some(TrajectoryEvent::stop(agent_id, reason.clone(), now)),
            AgentOutput::Session { .. } | AgentOutput::Raw { .. } | AgentOutput::Exited { .. } => None,
        }
    }
}

/// Path a tool call targets, from the usual input keys
pub fn tool_path(input: &serde_json::Value) -> Option<String> {
    ["file_path", "path", "notebook_path"]
        .iter()
        .find_map(|key| input.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string)
}

/// Line-by-line parser for one agent's stdout
///
/// Remembers tool-use ids so block-style tool results can be attributed to
/// the tool that produced them.
#[derive(Debug, Default)]
pub struct StreamParser {
    tool_names: HashMap<String, String>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_line(&mut self, line: &str) -> Vec<AgentOutput> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        match serde_json::from_str::<StreamMessage>(trimmed) {
            Ok(msg) => self.dispatch(msg),
            Err(_) => vec![AgentOutput::Raw {
                stream: OutputStream::Stdout,
                line: trimmed.to_string(),
            }],
        }
    }

    fn dispatch(&mut self, msg: StreamMessage) -> Vec<AgentOutput> {
        match msg {
            StreamMessage::System { session_id, .. } => session_id
                .map(|session_id| vec![AgentOutput::Session { session_id }])
                .unwrap_or_default(),
            StreamMessage::Assistant { message } | StreamMessage::User { message } => {
                self.content(message.content)
            }
            StreamMessage::ToolUse { tool, input } => vec![AgentOutput::ToolUse {
                path: tool_path(&input),
                tool,
                input,
            }],
            StreamMessage::ToolResult { output, is_error } => vec![AgentOutput::ToolResult {
                tool: None,
                output,
                is_error,
            }],
            StreamMessage::Result {
                subtype,
                result,
                is_error,
                ..
            } => {
                // the turn is over; unanswered tool ids will never resolve
                self.tool_names.clear();
                let reason = if is_error {
                    Some(subtype.unwrap_or_else(|| "error".to_string()))
                } else {
                    result.or(subtype)
                };
                vec![AgentOutput::Stop { reason }]
            }
        }
    }

    fn content(&mut self, body: ContentBody) -> Vec<AgentOutput> {
        let blocks = match body {
            ContentBody::Text(text) if text.is_empty() => return Vec::new(),
            ContentBody::Text(text) => return vec![AgentOutput::Message { text }],
            ContentBody::Blocks(blocks) => blocks,
        };

        let mut out = Vec::new();
        for block in blocks {
            match block {
                ContentBlock::Text { text } if !text.is_empty() => out.push(AgentOutput::Message { text }),
                ContentBlock::Text { .. } | ContentBlock::Other => {}
                ContentBlock::ToolUse { id, name, input } => {
                    if let Some(id) = id {
                        self.tool_names.insert(id, name.clone());
                    }
                    out.push(AgentOutput::ToolUse {
                        path: tool_path(&input),
                        tool: name,
                        input,
                    });
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    let tool = tool_use_id.and_then(|id| self.tool_names.remove(&id));
                    let output = match content {
                        serde_json::Value::String(s) => s,
                        serde_json::Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    out.push(AgentOutput::ToolResult { tool, output, is_error });
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flat_tool_use() {
        let mut parser = StreamParser::new();
        let out = parser.parse_line(r#"{"type":"tool_use","tool":"Write","input":{"file_path":"src/a.ts"}}"#);
        assert_eq!(
            out,
            vec![AgentOutput::ToolUse {
                tool: "Write".into(),
                path: Some("src/a.ts".into()),
                input: serde_json::json!({"file_path": "src/a.ts"}),
            }]
        );
    }

    #[test]
    fn test_block_tool_result_is_attributed() {
        let mut parser = StreamParser::new();
        let uses = parser.parse_line(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"editing"},{"type":"tool_use","id":"tu_1","name":"Edit","input":{"file_path":"x.rs"}}]}}"#,
        );
        assert_eq!(uses.len(), 2);
        assert_eq!(uses[0], AgentOutput::Message { text: "editing".into() });

        let results = parser.parse_line(
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"tu_1","content":"ok","is_error":false}]}}"#,
        );
        assert_eq!(
            results,
            vec![AgentOutput::ToolResult {
                tool: Some("Edit".into()),
                output: "ok".into(),
                is_error: false,
            }]
        );
    }

    #[test]
    fn test_unanswered_tool_ids_forgotten_at_turn_end() {
        let mut parser = StreamParser::new();
        parser.parse_line(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"tu_9","name":"Bash","input":{"command":"ls"}}]}}"#,
        );
        assert_eq!(parser.tool_names.len(), 1);

        let out = parser.parse_line(r#"{"type":"result","subtype":"success","result":"done","is_error":false}"#);
        assert!(matches!(out.as_slice(), [AgentOutput::Stop { .. }]));
        assert!(parser.tool_names.is_empty());

        let late = parser.parse_line(
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"tu_9","content":"x"}]}}"#,
        );
        assert!(matches!(late.as_slice(), [AgentOutput::ToolResult { tool: None, .. }]));
    }

    #[test]
    fn test_system_and_result() {
        let mut parser = StreamParser::new();
        assert_eq!(
            parser.parse_line(r#"{"type":"system","subtype":"init","session_id":"abc123"}"#),
            vec![AgentOutput::Session { session_id: "abc123".into() }]
        );
        assert_eq!(
            parser.parse_line(r#"{"type":"result","subtype":"success","result":"done"}"#),
            vec![AgentOutput::Stop { reason: Some("done".into()) }]
        );
    }

    #[test]
    fn test_non_json_is_raw() {
        let mut parser = StreamParser::new();
        assert_eq!(
            parser.parse_line("warning: something odd"),
            vec![AgentOutput::Raw {
                stream: OutputStream::Stdout,
                line: "warning: something odd".into(),
            }]
        );
        assert!(parser.parse_line("   ").is_empty());
        // JSON of an unknown shape is passed through too
        assert_eq!(parser.parse_line(r#"{"type":"mystery"}"#).len(), 1);
    }

    #[test]
    fn test_to_event() {
        let now = Utc::now();
        let out = AgentOutput::ToolUse {
            tool: "Read".into(),
            path: Some("a.rs".into()),
            input: serde_json::Value::Null,
        };
        assert_eq!(
            out.to_event("a", now),
            Some(TrajectoryEvent::tool_use("a", "Read", Some("a.rs".into()), now))
        );
        assert!(AgentOutput::Exited { code: Some(0) }.to_event("a", now).is_none());
    }
}
