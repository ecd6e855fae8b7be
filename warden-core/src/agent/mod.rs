//! Agent module for spawning, supervising and monitoring agent processes

mod backend;
mod heartbeat;
mod manager;
mod output;
mod role;

pub use backend::{Backend, ClaudeBackend, CommandBackend, LaunchSpec};
pub use heartbeat::{HeartbeatMonitor, HeartbeatStatus, OverdueAgent};
pub use manager::{AgentControl, AgentInfo, AgentManager};
pub use output::{tool_path, AgentOutput, OutputStream, StreamMessage, StreamParser};
pub use role::AgentRole;
