//! Configuration management for Warden
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. CLI flags
//! 2. Environment variables (WARDEN_*)
//! 3. Project config file (`<project>/.warden/config.toml`)
//! 4. User config file (~/.config/warden/config.toml)
//! 5. Default values

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Agent-related configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Path to the agent executable
    pub command: String,

    /// Model override applied to every agent (workflow models otherwise)
    pub model: Option<String>,

    /// Extra arguments appended to every agent invocation
    pub extra_args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            model: None,
            extra_args: Vec::new(),
        }
    }
}

/// Daemon scheduling and lifecycle configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Interval between event loop ticks
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,

    /// How long a stopped agent gets before it is killed
    #[serde(with = "humantime_serde")]
    pub stop_grace_period: Duration,

    /// Heartbeat interval for agents whose definition does not set one
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Clean exits a task survives before it is failed instead of released
    pub max_task_attempts: u32,

    /// State directory, relative to the project root
    pub state_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1000),
            stop_grace_period: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            max_task_attempts: 3,
            state_dir: PathBuf::from(".warden"),
        }
    }
}

/// Rule engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Number of trajectory events handed to the checkers per agent
    pub trajectory_window: usize,

    /// Todo file consulted by the todo rule when it names none
    pub todo_file: PathBuf,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            trajectory_window: 200,
            todo_file: PathBuf::from("TODO.md"),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Agent configuration
    pub agent: AgentConfig,

    /// Daemon configuration
    pub daemon: DaemonConfig,

    /// Rule engine configuration
    pub rules: RulesConfig,
}

impl Config {
    /// Load configuration from the user config file, then the project one
    ///
    /// Missing files are skipped; a project file replaces whole sections.
    pub fn load(project_root: Option<&Path>) -> Result<Self> {
        let mut config = match Self::default_config_path() {
            Some(path) if path.exists() => Self::load_from_file(&path)?,
            _ => Self::default(),
        };

        if let Some(root) = project_root {
            let project_path = root.join(&config.daemon.state_dir).join("config.toml");
            if project_path.exists() {
                config = Self::load_from_file(&project_path)?;
            }
        }

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(Error::Io)?;
        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config {}: {}", path.display(), e)))
    }

    /// Get the default config file path
    ///
    /// Returns `~/.config/warden/config.toml` on Unix
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("warden").join("config.toml"))
    }

    /// Apply environment variable overrides
    ///
    /// Supported variables:
    /// - WARDEN_AGENT_COMMAND: Path to the agent executable
    /// - WARDEN_MODEL: Model override
    /// - WARDEN_TICK_MS: Event loop tick interval in milliseconds
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(command) = std::env::var("WARDEN_AGENT_COMMAND") {
            self.agent.command = command;
        }

        if let Ok(model) = std::env::var("WARDEN_MODEL") {
            self.agent.model = Some(model);
        }

        if let Some(ms) = std::env::var("WARDEN_TICK_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.daemon.tick_interval = Duration::from_millis(ms);
        }

        self
    }

    /// Apply CLI flag overrides
    pub fn with_cli_overrides(mut self, agent_command: Option<String>, model: Option<String>) -> Self {
        if let Some(command) = agent_command {
            self.agent.command = command;
        }

        if let Some(m) = model {
            self.agent.model = Some(m);
        }

        self
    }

    /// Load configuration with all overrides applied
    ///
    /// Priority: CLI > env > project file > user file > defaults
    pub fn load_with_overrides(
        project_root: Option<&Path>,
        agent_command: Option<String>,
        model: Option<String>,
    ) -> Result<Self> {
        Ok(Self::load(project_root)?
            .with_env_overrides()
            .with_cli_overrides(agent_command, model))
    }

    /// Validate values that would make the daemon misbehave
    pub fn validate(&self) -> Result<()> {
        if self.daemon.tick_interval.is_zero() {
            return Err(Error::Config("daemon.tick_interval must be > 0".to_string()));
        }
        if self.daemon.max_task_attempts == 0 {
            return Err(Error::Config("daemon.max_task_attempts must be > 0".to_string()));
        }
        if self.rules.trajectory_window == 0 {
            return Err(Error::Config("rules.trajectory_window must be > 0".to_string()));
        }
        if self.agent.command.trim().is_empty() {
            return Err(Error::Config("agent.command must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Resolve the project root for a working directory
///
/// Uses the enclosing git work tree when there is one, otherwise the
/// directory itself.
pub fn discover_project_root(dir: &Path) -> PathBuf {
    let fallback = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    match git2::Repository::discover(dir) {
        Ok(repo) => repo
            .workdir()
            .map(|p| p.canonicalize().unwrap_or_else(|_| p.to_path_buf()))
            .unwrap_or(fallback),
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "No git repository, using directory as project root");
            fallback
        }
    }
}
