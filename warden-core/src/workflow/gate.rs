//! Gate execution
//!
//! A gate is an ordered list of shell-free commands. Checks run one after
//! another and the gate stops at the first failure.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::compiled::{CompiledGate, GateCheck};

/// Per-check limit when the check sets none
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(300);

/// Outcome of running a gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateResult {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_check: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GateResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            failed_check: None,
            error: None,
        }
    }

    pub fn fail(check: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            passed: false,
            failed_check: Some(check.into()),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GateExecutor {
    workdir: PathBuf,
}

impl GateExecutor {
    /// Checks without a `cwd` run in `workdir`; relative `cwd`s are resolved against it
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub async fn execute(&self, gate: &CompiledGate) -> GateResult {
        for check in &gate.checks {
            if let Err(error) = self.run_check(check).await {
                tracing::warn!(check = %check.name, error = %error, "Gate check failed");
                return GateResult::fail(&check.name, error);
            }
            tracing::debug!(check = %check.name, "Gate check passed");
        }
        GateResult::pass()
    }

    async fn run_check(&self, check: &GateCheck) -> std::result::Result<(), String> {
        let cwd = match &check.cwd {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.workdir.join(dir),
            None => self.workdir.clone(),
        };
        let limit = check
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CHECK_TIMEOUT);

        let mut cmd = Command::new(&check.command);
        cmd.args(&check.args)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(limit, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(format!("failed to run {}: {}", check.command, e)),
            Err(_) => return Err(format!("timed out after {}s", limit.as_secs())),
        };

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.lines().last().unwrap_or("").trim().to_string();
        Err(match output.status.code() {
            Some(code) if detail.is_empty() => format!("exited with code {}", code),
            Some(code) => format!("exited with code {}: {}", code, detail),
            None => "terminated by signal".to_string(),
        })
    }
}
