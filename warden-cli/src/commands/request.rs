//! One-shot protocol requests

use clap::Args;
use warden_ipc::{ControlClient, Request};

use super::print_json;

pub async fn ping(client: &ControlClient) -> anyhow::Result<()> {
    let data = client.request(&Request::Ping).await?;
    println!("pong ({})", data["time"].as_str().unwrap_or("?"));
    Ok(())
}

pub async fn state(client: &ControlClient) -> anyhow::Result<()> {
    print_json(&client.request(&Request::GetState).await?)
}

pub async fn heartbeat(client: &ControlClient, worker_id: String) -> anyhow::Result<()> {
    print_json(&client.request(&Request::Heartbeat { worker_id }).await?)
}

pub async fn reset(client: &ControlClient) -> anyhow::Result<()> {
    client.request(&Request::PlanReset).await?;
    println!("Plan reset.");
    Ok(())
}

pub async fn shutdown(client: &ControlClient) -> anyhow::Result<()> {
    client.request(&Request::Shutdown).await?;
    println!("Daemon shutting down.");
    Ok(())
}

/// Show daemon status
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Include this many recent trajectory events
    #[arg(short = 'n', long)]
    events: Option<usize>,
}

impl StatusArgs {
    pub async fn execute(&self, client: &ControlClient) -> anyhow::Result<()> {
        let data = client
            .request(&Request::Status {
                event_count: self.events,
            })
            .await?;
        print_json(&data)
    }
}

/// Claim the next task
#[derive(Args, Debug)]
pub struct ClaimArgs {
    /// Worker id
    worker_id: String,
}

impl ClaimArgs {
    pub async fn execute(&self, client: &ControlClient) -> anyhow::Result<()> {
        let data = client
            .request(&Request::TaskClaim {
                worker_id: self.worker_id.clone(),
            })
            .await?;
        if data["task"].is_null() {
            println!("No task available.");
            return Ok(());
        }
        print_json(&data)
    }
}

/// Complete a task
#[derive(Args, Debug)]
pub struct CompleteArgs {
    /// Task id
    task_id: String,

    /// Worker id that holds the task
    worker_id: String,

    /// Complete even if another worker holds the task
    #[arg(long)]
    force: bool,
}

impl CompleteArgs {
    pub async fn execute(&self, client: &ControlClient) -> anyhow::Result<()> {
        let data = client
            .request(&Request::TaskComplete {
                task_id: self.task_id.clone(),
                worker_id: self.worker_id.clone(),
                force: self.force,
            })
            .await?;
        print_json(&data)
    }
}

/// Show trajectory events
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Number of events
    #[arg(short = 'n', long)]
    limit: Option<usize>,

    /// Only events of this agent
    #[arg(short, long)]
    agent: Option<String>,
}

impl LogsArgs {
    pub async fn execute(&self, client: &ControlClient) -> anyhow::Result<()> {
        let data = client
            .request(&Request::GetLogs {
                limit: self.limit,
                agent_id: self.agent.clone(),
            })
            .await?;
        for event in data.as_array().into_iter().flatten() {
            println!("{}", serde_json::to_string(event)?);
        }
        Ok(())
    }
}
