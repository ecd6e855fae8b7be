//! Backend abstraction for agent processes

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};

use crate::{Error, Result};

/// Everything needed to launch (and relaunch) one agent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchSpec {
    /// Agent definition name from the workflow
    pub agent_type: String,
    pub task_id: Option<String>,
    pub model: Option<String>,
    /// First message sent to the agent
    pub prompt: String,
    pub tools: Vec<String>,
    pub env: HashMap<String, String>,
    /// Heartbeat interval in milliseconds
    pub heartbeat_ms: Option<u64>,
}

impl LaunchSpec {
    pub fn new(agent_type: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Trait for agent process backends
#[async_trait]
pub trait Backend: Send + Sync {
    /// Get the name of this backend
    fn name(&self) -> &'static str;

    /// Build the command for one agent session
    fn build_command(&self, spec: &LaunchSpec, session_id: &str, workdir: &Path) -> Command;

    /// Encode text as one line for the agent's stdin
    fn encode_input(&self, text: &str) -> String {
        let msg = serde_json::json!({
            "type": "user",
            "message": {"role": "user", "content": text},
        });
        format!("{}\n", msg)
    }

    /// Start the process with piped stdio
    async fn spawn(&self, spec: &LaunchSpec, session_id: &str, workdir: &Path) -> Result<Child> {
        if !workdir.exists() {
            return Err(Error::Agent(format!(
                "Working directory does not exist: {}",
                workdir.display()
            )));
        }

        let mut cmd = self.build_command(spec, session_id, workdir);
        cmd.current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Agent(format!("{} executable not found. Is it installed?", self.name()))
            } else {
                Error::Io(e)
            }
        })
    }

    /// Check if this backend is available on the system
    fn is_available(&self) -> bool;
}

/// Claude Code CLI in bidirectional stream-json mode
#[derive(Debug, Clone)]
pub struct ClaudeBackend {
    pub claude_path: String,
    pub model: Option<String>,
    pub extra_args: Vec<String>,
}

impl ClaudeBackend {
    /// Create a new Claude backend with default settings
    pub fn new() -> Self {
        Self {
            claude_path: "claude".to_string(),
            model: None,
            extra_args: Vec::new(),
        }
    }

    /// Create a Claude backend with custom path
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.claude_path = path.into();
        self
    }

    /// Force a model for every agent, overriding the workflow's choice
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

impl Default for ClaudeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for ClaudeBackend {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn build_command(&self, spec: &LaunchSpec, session_id: &str, _workdir: &Path) -> Command {
        let mut cmd = Command::new(&self.claude_path);
        cmd.arg("--print")
            .arg("--verbose")
            .arg("--input-format")
            .arg("stream-json")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--dangerously-skip-permissions")
            .arg("--session-id")
            .arg(session_id);

        if let Some(model) = self.model.as_ref().or(spec.model.as_ref()) {
            cmd.arg("--model").arg(model);
        }
        if !spec.tools.is_empty() {
            cmd.arg("--allowed-tools").arg(spec.tools.join(","));
        }
        cmd.args(&self.extra_args);
        cmd
    }

    fn is_available(&self) -> bool {
        std::process::Command::new(&self.claude_path)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
    }
}

/// Runs an arbitrary program as the agent
///
/// Useful for custom harnesses; the program gets the same stdio protocol.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `sh -c <script>`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh", vec!["-c".to_string(), script.into()])
    }
}

#[async_trait]
impl Backend for CommandBackend {
    fn name(&self) -> &'static str {
        "command"
    }

    fn build_command(&self, spec: &LaunchSpec, session_id: &str, _workdir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("WARDEN_AGENT_TYPE", &spec.agent_type)
            .env("WARDEN_SESSION_ID", session_id);
        if let Some(task) = &spec.task_id {
            cmd.env("WARDEN_TASK_ID", task);
        }
        cmd
    }

    fn is_available(&self) -> bool {
        std::process::Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_claude_backend_builder() {
        let backend = ClaudeBackend::new().with_path("/custom/claude").with_model("opus");
        assert_eq!(backend.name(), "claude");
        assert_eq!(backend.claude_path, "/custom/claude");
        assert_eq!(backend.model, Some("opus".to_string()));
    }

    #[test]
    fn test_claude_command_args() {
        let mut spec = LaunchSpec::new("implementer", "go").with_model(Some("sonnet".into()));
        spec.tools = vec!["Read".into(), "Write".into()];
        let cmd = ClaudeBackend::new().build_command(&spec, "sess-1", Path::new("."));
        let args = args_of(&cmd);

        assert!(args.windows(2).any(|w| w == ["--output-format", "stream-json"]));
        assert!(args.windows(2).any(|w| w == ["--input-format", "stream-json"]));
        assert!(args.windows(2).any(|w| w == ["--session-id", "sess-1"]));
        assert!(args.windows(2).any(|w| w == ["--model", "sonnet"]));
        assert!(args.windows(2).any(|w| w == ["--allowed-tools", "Read,Write"]));
    }

    #[test]
    fn test_backend_model_override_wins() {
        let spec = LaunchSpec::new("implementer", "go").with_model(Some("sonnet".into()));
        let cmd = ClaudeBackend::new().with_model("opus").build_command(&spec, "s", Path::new("."));
        assert!(args_of(&cmd).windows(2).any(|w| w == ["--model", "opus"]));
    }

    #[test]
    fn test_encode_input_is_one_json_line() {
        let line = ClaudeBackend::new().encode_input("stop editing\nthat file");
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["type"], "user");
        assert_eq!(value["message"]["content"], "stop editing\nthat file");
    }

    #[tokio::test]
    async fn test_spawn_invalid_workdir() {
        let backend = CommandBackend::shell("true");
        let spec = LaunchSpec::new("implementer", "");
        let err = backend
            .spawn(&spec, "s", Path::new("/nonexistent/path/12345"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Agent(_)));
    }
}
