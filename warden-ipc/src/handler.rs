//! Request handling for the control protocol

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::watch;
use warden_core::agent::{AgentManager, HeartbeatMonitor};
use warden_core::clock::{Clock, SystemClock};
use warden_core::state::{StateStore, TaskStatus};
use warden_core::trajectory::{TrajectoryEvent, TrajectoryLog};
use warden_core::workflow::WorkflowCoordinator;
use warden_core::{EventLoop, EventSink, NullSink};

use crate::exec::ExecRunner;
use crate::protocol::{ExecRequest, Request, Response};
use crate::Result;

const DEFAULT_LOG_LIMIT: usize = 50;

/// Answers one request
///
/// `subscribe` never reaches a handler; the server owns subscriptions.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

/// The daemon's request handler
pub struct ControlHandler {
    store: Arc<StateStore>,
    trajectory: Arc<TrajectoryLog>,
    heartbeats: Arc<HeartbeatMonitor>,
    exec: ExecRunner,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    agents: Option<Arc<AgentManager>>,
    coordinator: Option<Arc<WorkflowCoordinator>>,
    event_loop: Option<Arc<EventLoop>>,
    started_at: DateTime<Utc>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for ControlHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlHandler")
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl ControlHandler {
    pub fn new(
        store: Arc<StateStore>,
        trajectory: Arc<TrajectoryLog>,
        heartbeats: Arc<HeartbeatMonitor>,
        exec: ExecRunner,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            trajectory,
            heartbeats,
            exec,
            sink: Arc::new(NullSink),
            clock: Arc::new(SystemClock),
            agents: None,
            coordinator: None,
            event_loop: None,
            started_at: Utc::now(),
            shutdown,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.started_at = clock.now();
        self.clock = clock;
        self
    }

    pub fn with_agents(mut self, agents: Arc<AgentManager>) -> Self {
        self.agents = Some(agents);
        self
    }

    /// Lets `plan_reset` seed a fresh state
    pub fn with_coordinator(mut self, coordinator: Arc<WorkflowCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_event_loop(mut self, event_loop: Arc<EventLoop>) -> Self {
        self.event_loop = Some(event_loop);
        self
    }

    /// Flips to `true` once a client asks the daemon to shut down
    pub fn shutdown_requested(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    async fn record(&self, event: TrajectoryEvent) -> Result<()> {
        self.trajectory.log(&event).await?;
        self.sink.publish("trajectory", serde_json::to_value(&event)?);
        Ok(())
    }

    async fn dispatch(&self, request: Request) -> Result<serde_json::Value> {
        match request {
            Request::Ping => Ok(json!({ "pong": true, "time": self.clock.now() })),
            Request::GetState => Ok(serde_json::to_value(self.store.snapshot().await?)?),
            Request::Status { event_count } => self.status(event_count).await,
            Request::Heartbeat { worker_id } => self.heartbeat(&worker_id).await,
            Request::TaskClaim { worker_id } => {
                let claim = self.store.claim_task(&worker_id).await?;
                if let Some(task) = &claim.task {
                    if !claim.is_retry {
                        self.record(TrajectoryEvent::TaskClaim {
                            agent_id: worker_id.clone(),
                            task_id: task.id.clone(),
                            timestamp: self.clock.now(),
                        })
                        .await?;
                    }
                }
                Ok(serde_json::to_value(claim)?)
            }
            Request::TaskComplete {
                task_id,
                worker_id,
                force,
            } => {
                let task = self.store.complete_task(&task_id, &worker_id, force).await?;
                self.record(TrajectoryEvent::TaskComplete {
                    agent_id: worker_id,
                    task_id,
                    timestamp: self.clock.now(),
                })
                .await?;
                Ok(serde_json::to_value(task)?)
            }
            Request::PlanReset => self.plan_reset().await,
            Request::GetLogs { limit, agent_id } => {
                let limit = limit.unwrap_or(DEFAULT_LOG_LIMIT);
                let events = match agent_id {
                    Some(agent_id) => self.trajectory.filter_by_agent(&agent_id, limit).await?,
                    None => self.trajectory.tail(limit).await?,
                };
                Ok(serde_json::to_value(events)?)
            }
            Request::Subscribe { .. } => Err(crate::Error::InvalidRequest(
                "subscribe must be sent on a server connection".to_string(),
            )),
            Request::Shutdown => {
                tracing::info!("Shutdown requested over control socket");
                self.shutdown.send_replace(true);
                Ok(json!({ "shuttingDown": true }))
            }
            Request::Exec(request) => self.exec(&request).await,
        }
    }

    async fn status(&self, event_count: Option<usize>) -> Result<serde_json::Value> {
        let state = self.store.snapshot().await?;
        let now = self.clock.now();
        let mut status = json!({
            "uptimeSeconds": (now - self.started_at).num_seconds(),
            "eventCount": self.trajectory.count().await?,
            "overdueAgents": self.heartbeats.overdue_agents(),
        });

        if let Some(state) = &state {
            status["workflow"] = json!({
                "id": state.workflow_id,
                "name": state.workflow_name,
                "currentPhase": state.current_phase,
                "startedAt": state.started_at,
            });
            status["tasks"] = json!({
                "total": state.tasks.len(),
                "pending": state.tasks.count_by_status(TaskStatus::Pending),
                "running": state.tasks.count_by_status(TaskStatus::Running),
                "completed": state.tasks.count_by_status(TaskStatus::Completed),
                "failed": state.tasks.count_by_status(TaskStatus::Failed),
            });
            status["agents"] = serde_json::to_value(&state.agents)?;
            status["pendingHumanActions"] = serde_json::to_value(&state.pending_human_actions)?;
        }
        if let Some(agents) = &self.agents {
            status["liveAgents"] = serde_json::to_value(agents.list().await)?;
        }
        if let Some(event_loop) = &self.event_loop {
            status["loop"] = serde_json::to_value(event_loop.stats())?;
        }
        if let Some(n) = event_count {
            status["recentEvents"] = serde_json::to_value(self.trajectory.tail(n).await?)?;
        }
        Ok(status)
    }

    async fn heartbeat(&self, worker_id: &str) -> Result<serde_json::Value> {
        let now = self.clock.now();
        let known = self.heartbeats.record_heartbeat(worker_id);
        let result = self
            .store
            .update(|state| {
                if let Some(agent) = state.agents.get_mut(worker_id) {
                    agent.last_heartbeat = Some(now);
                }
                Ok(())
            })
            .await;
        match result {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        self.record(TrajectoryEvent::heartbeat(worker_id, now)).await?;
        Ok(json!({ "workerId": worker_id, "registered": known }))
    }

    async fn plan_reset(&self) -> Result<serde_json::Value> {
        if let Some(agents) = &self.agents {
            agents.kill_all().await;
        }
        self.store.reset().await?;
        let reseeded = match &self.coordinator {
            Some(coordinator) => {
                let state = coordinator.ensure_state().await?;
                Some(state.workflow_id)
            }
            None => None,
        };
        tracing::warn!(reseeded = ?reseeded, "Plan reset");
        Ok(json!({ "reset": true, "workflowId": reseeded }))
    }

    async fn exec(&self, request: &ExecRequest) -> Result<serde_json::Value> {
        let result = self.exec.run(request).await?;
        Ok(serde_json::to_value(result)?)
    }
}

#[async_trait]
impl RequestHandler for ControlHandler {
    async fn handle(&self, request: Request) -> Response {
        let command = request.name();
        match self.dispatch(request).await {
            Ok(data) => Response::ok(data),
            Err(e) => {
                tracing::debug!(command, error = %e, "Request failed");
                Response::error(e.to_string())
            }
        }
    }
}
