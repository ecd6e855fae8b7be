//! Exec command - run a process through the daemon

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use warden_ipc::{ControlClient, ExecRequest, ExecResult, Request};

/// Arguments for the exec command
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Working directory, relative to the project root
    #[arg(short = 'd', long)]
    cwd: Option<PathBuf>,

    /// Environment variable as KEY=VALUE (repeatable)
    #[arg(short, long = "env", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Kill the process after this many milliseconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Wait for other exclusive execs to finish first
    #[arg(long)]
    exclusive: bool,

    /// Program and arguments
    #[arg(required = true, last = true)]
    args: Vec<String>,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

impl ExecArgs {
    /// Returns the exit code to exit with
    pub async fn execute(&self, client: &ControlClient) -> anyhow::Result<i32> {
        let request = ExecRequest {
            args: self.args.clone(),
            cwd: self.cwd.clone(),
            env: self.env.iter().cloned().collect::<BTreeMap<_, _>>(),
            timeout: self.timeout,
            exclusive: self.exclusive,
        };
        let data = client.request(&Request::Exec(request)).await?;
        let result: ExecResult = serde_json::from_value(data).context("Malformed exec result")?;

        std::io::stdout().write_all(result.stdout.as_bytes())?;
        std::io::stderr().write_all(result.stderr.as_bytes())?;
        if result.timed_out {
            eprintln!("warden: command timed out");
            return Ok(124);
        }
        Ok(result.exit_code.unwrap_or(1))
    }
}
