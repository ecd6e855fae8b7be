//! Daemon command - run the orchestrator for one project

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use tokio::signal::unix::{signal, SignalKind};
use warden_core::agent::{AgentManager, Backend, ClaudeBackend, HeartbeatMonitor};
use warden_core::rules::RuleEngine;
use warden_core::state::StateStore;
use warden_core::trajectory::TrajectoryLog;
use warden_core::workflow::{CompiledWorkflow, FileArtifactStore, WorkflowCoordinator};
use warden_core::{Config, EventLoop};
use warden_ipc::{socket_path, ControlHandler, ControlServer, ExecRunner};

/// Arguments for the daemon command
#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Compiled workflow (default: <state dir>/workflow.json)
    #[arg(short, long)]
    workflow: Option<std::path::PathBuf>,
}

impl DaemonArgs {
    pub async fn execute(&self, project_root: &Path, config: Config) -> anyhow::Result<()> {
        config.validate()?;
        let state_dir = project_root.join(&config.daemon.state_dir);
        tokio::fs::create_dir_all(&state_dir)
            .await
            .with_context(|| format!("Failed to create {}", state_dir.display()))?;

        let workflow_path = self
            .workflow
            .clone()
            .unwrap_or_else(|| state_dir.join("workflow.json"));
        let workflow = CompiledWorkflow::load(&workflow_path)
            .with_context(|| format!("Failed to load workflow from {}", workflow_path.display()))?;

        let store = Arc::new(StateStore::new(state_dir.join("state.json")));
        let trajectory = Arc::new(TrajectoryLog::new(state_dir.join("trajectory.jsonl")));

        let recovery = store.recover_from_crash().await?;
        if !recovery.repaired.is_empty() {
            tracing::warn!(repairs = recovery.repaired.len(), "Recovered from unclean shutdown");
        }

        let artifacts = Arc::new(FileArtifactStore::new(state_dir.join("artifacts")));
        let coordinator = Arc::new(WorkflowCoordinator::new(
            workflow,
            project_root,
            store.clone(),
            trajectory.clone(),
            artifacts,
        ));
        let state = coordinator.ensure_state().await?;
        let engine = Arc::new(RuleEngine::from_workflow(coordinator.workflow(), project_root, &config.rules));

        let mut backend = ClaudeBackend::new()
            .with_path(config.agent.command.clone())
            .with_extra_args(config.agent.extra_args.clone());
        if let Some(model) = &config.agent.model {
            backend = backend.with_model(model.clone());
        }
        if !backend.is_available() {
            tracing::warn!(command = %backend.claude_path, "Agent command not found; spawns will fail");
        }
        let agents = Arc::new(
            AgentManager::new(Arc::new(backend), project_root).with_grace_period(config.daemon.stop_grace_period),
        );
        let heartbeats = Arc::new(HeartbeatMonitor::default());

        let server = ControlServer::bind(socket_path(project_root)).await?;

        let event_loop = Arc::new(
            EventLoop::new(
                store.clone(),
                trajectory.clone(),
                engine,
                agents.clone(),
                heartbeats.clone(),
                coordinator.clone(),
            )
            .with_sink(server.clone())
            .with_tick_interval(config.daemon.tick_interval)
            .with_default_heartbeat(config.daemon.heartbeat_interval)
            .with_max_task_attempts(config.daemon.max_task_attempts),
        );

        let handler = ControlHandler::new(store, trajectory, heartbeats, ExecRunner::new(project_root))
            .with_sink(server.clone())
            .with_agents(agents.clone())
            .with_coordinator(coordinator)
            .with_event_loop(event_loop.clone());
        let mut shutdown_requested = handler.shutdown_requested();

        tracing::info!(
            project_root = %project_root.display(),
            workflow = %state.workflow_name,
            phase = %state.current_phase,
            socket = %server.path().display(),
            "Warden daemon started"
        );

        event_loop.start().await;
        let serving = tokio::spawn(server.clone().serve(Arc::new(handler)));

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
            _ = terminate.recv() => tracing::info!("Terminated"),
            _ = shutdown_requested.wait_for(|requested| *requested) => {}
        }

        tracing::info!("Shutting down");
        event_loop.stop().await;
        agents.kill_all().await;
        server.shutdown();
        match serving.await {
            Ok(result) => result?,
            Err(e) => tracing::warn!(error = %e, "Control server task failed"),
        }
        tracing::info!("Warden daemon stopped");
        Ok(())
    }
}
