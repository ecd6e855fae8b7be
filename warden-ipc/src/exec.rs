//! Process execution on behalf of clients

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::protocol::{ExecRequest, ExecResult};
use crate::{Error, Result};

/// Runs `exec` requests; exclusive requests run one at a time
#[derive(Debug)]
pub struct ExecRunner {
    workdir: PathBuf,
    exclusive: Mutex<()>,
}

impl ExecRunner {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            exclusive: Mutex::new(()),
        }
    }

    pub async fn run(&self, request: &ExecRequest) -> Result<ExecResult> {
        let (program, args) = request
            .args
            .split_first()
            .ok_or_else(|| Error::InvalidRequest("exec needs at least a program".to_string()))?;

        let _guard = if request.exclusive {
            Some(self.exclusive.lock().await)
        } else {
            None
        };

        let cwd = match &request.cwd {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.workdir.join(dir),
            None => self.workdir.clone(),
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&cwd)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(program = %program, args = ?args, cwd = %cwd.display(), "Exec");
        let mut child = cmd.spawn()?;
        let stdout = tokio::spawn(read_all(child.stdout.take()));
        let stderr = tokio::spawn(read_all(child.stderr.take()));

        let (exit_code, timed_out) = match request.timeout.map(Duration::from_millis) {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => (status?.code(), false),
                Err(_) => {
                    tracing::warn!(program = %program, timeout_ms = limit.as_millis() as u64, "Exec timed out, killing");
                    child.kill().await?;
                    (None, true)
                }
            },
            None => (child.wait().await?.code(), false),
        };

        Ok(ExecResult {
            exit_code,
            stdout: stdout.await.unwrap_or_default(),
            stderr: stderr.await.unwrap_or_default(),
            timed_out,
        })
    }
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}
