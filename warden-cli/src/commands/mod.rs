//! CLI command implementations

pub mod daemon;
pub mod exec;
pub mod request;
pub mod watch;

use std::path::Path;

use warden_ipc::ControlClient;

pub use daemon::DaemonArgs;
pub use exec::ExecArgs;
pub use request::{heartbeat, ping, reset, shutdown, state, ClaimArgs, CompleteArgs, LogsArgs, StatusArgs};
pub use watch::WatchArgs;

pub fn client(project_root: &Path) -> ControlClient {
    ControlClient::for_project(project_root)
}

fn print_json(data: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(data)?);
    Ok(())
}
