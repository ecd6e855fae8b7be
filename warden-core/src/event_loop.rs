//! The daemon's tick scheduler
//!
//! Every tick runs the same steps in a fixed order:
//!
//! 1. drain agent output, journal it, run the rules and apply corrections
//! 2. spawn agents the current phase asks for
//! 3. move to the next phase when it is ready
//! 4. count overdue heartbeats
//! 5. flush state
//!
//! A failing step is logged and the tick carries on with the next one.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::agent::{AgentManager, AgentOutput, HeartbeatMonitor, HeartbeatStatus};
use crate::clock::{Clock, SystemClock};
use crate::correction::{Correction, CorrectionApplicator, CorrectionKind};
use crate::rules::{RuleEngine, Violation};
use crate::sink::{EventSink, NullSink};
use crate::state::{AgentState, AgentStatus, StateStore, TaskStatus, WorkflowState};
use crate::trajectory::{TrajectoryEvent, TrajectoryLog};
use crate::workflow::{TransitionCheck, WorkflowCoordinator};
use crate::Result;

/// Counters exposed through `status`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStats {
    pub ticks: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub step_errors: u64,
    pub violations: u64,
    pub spawned: u64,
    pub overdue_agents: usize,
}

struct Running {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct EventLoop {
    store: Arc<StateStore>,
    trajectory: Arc<TrajectoryLog>,
    engine: Arc<RuleEngine>,
    agents: Arc<AgentManager>,
    heartbeats: Arc<HeartbeatMonitor>,
    coordinator: Arc<WorkflowCoordinator>,
    applicator: CorrectionApplicator,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    default_heartbeat: Duration,
    max_task_attempts: u32,
    windows: Mutex<HashMap<String, VecDeque<TrajectoryEvent>>>,
    tick_lock: Mutex<()>,
    stats: std::sync::Mutex<LoopStats>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("tick_interval", &self.tick_interval)
            .finish_non_exhaustive()
    }
}

impl EventLoop {
    pub fn new(
        store: Arc<StateStore>,
        trajectory: Arc<TrajectoryLog>,
        engine: Arc<RuleEngine>,
        agents: Arc<AgentManager>,
        heartbeats: Arc<HeartbeatMonitor>,
        coordinator: Arc<WorkflowCoordinator>,
    ) -> Self {
        let escalation = coordinator
            .workflow()
            .orchestrator
            .clone()
            .unwrap_or_else(|| "human".to_string());
        let applicator =
            CorrectionApplicator::new(agents.clone(), store.clone()).with_default_escalation(escalation);
        Self {
            store,
            trajectory,
            engine,
            agents,
            heartbeats,
            coordinator,
            applicator,
            sink: Arc::new(NullSink),
            clock: Arc::new(SystemClock),
            tick_interval: Duration::from_millis(1000),
            default_heartbeat: Duration::from_secs(30),
            max_task_attempts: 3,
            windows: Mutex::new(HashMap::new()),
            tick_lock: Mutex::new(()),
            stats: std::sync::Mutex::new(LoopStats::default()),
            running: Mutex::new(None),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.applicator = self.applicator.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Heartbeat interval for agents whose definition sets none
    pub fn with_default_heartbeat(mut self, interval: Duration) -> Self {
        self.default_heartbeat = interval;
        self
    }

    /// Clean exits a task survives before it is failed instead of released
    pub fn with_max_task_attempts(mut self, attempts: u32) -> Self {
        self.max_task_attempts = attempts.max(1);
        self
    }

    pub fn stats(&self) -> LoopStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn bump(&self, f: impl FnOnce(&mut LoopStats)) {
        f(&mut self.stats.lock().unwrap_or_else(|e| e.into_inner()));
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Begin ticking in a background task; a second call does nothing
    pub async fn start(self: &Arc<Self>) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::debug!("Event loop already running");
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => this.tick().await,
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Event loop task finished");
        });

        tracing::info!(tick_ms = self.tick_interval.as_millis() as u64, "Event loop started");
        *running = Some(Running { stop_tx, task });
    }

    /// Stop ticking and wait for an in-flight tick to finish
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.stop_tx.send(true);
        if let Err(e) = running.task.await {
            tracing::warn!(error = %e, "Event loop task ended abnormally");
        }
        tracing::info!("Event loop stopped");
    }

    /// Run one tick; concurrent callers queue behind each other
    pub async fn tick(&self) {
        let _guard = self.tick_lock.lock().await;

        if let Err(e) = self.process_agents().await {
            self.step_failed("agents", &e);
        }
        if let Err(e) = self.spawn_agents().await {
            self.step_failed("spawn", &e);
        }
        if let Err(e) = self.advance_phase().await {
            self.step_failed("phase", &e);
        }
        self.check_heartbeats();
        if let Err(e) = self.flush().await {
            self.step_failed("flush", &e);
        }

        let now = self.clock.now();
        self.bump(|s| {
            s.ticks += 1;
            s.last_tick_at = Some(now);
        });
    }

    fn step_failed(&self, step: &str, error: &crate::Error) {
        tracing::error!(step, error = %error, "Tick step failed");
        self.bump(|s| s.step_errors += 1);
    }

    // Step 1

    async fn process_agents(&self) -> Result<()> {
        let mut state = self.store.load().await?;
        let outputs = self.agents.drain().await;
        self.handle_outputs(outputs, &mut state).await;

        if let Some(state) = &state {
            self.check_idle_agents(state).await?;
        }
        Ok(())
    }

    /// Handle drained outputs in order; one failure does not drop the rest
    async fn handle_outputs(&self, outputs: Vec<(String, AgentOutput)>, state: &mut Option<WorkflowState>) {
        for (agent_id, output) in outputs {
            match self.handle_output(&agent_id, output, state.as_ref()).await {
                Ok(false) => {}
                Ok(true) => match self.store.load().await {
                    Ok(fresh) => *state = fresh,
                    Err(e) => tracing::warn!(error = %e, "Keeping previous state after failed reload"),
                },
                Err(e) => {
                    tracing::error!(agent_id = %agent_id, error = %e, "Agent output not handled");
                    self.bump(|s| s.step_errors += 1);
                }
            }
        }
    }

    /// Returns whether the stored state changed
    async fn handle_output(&self, agent_id: &str, output: AgentOutput, state: Option<&WorkflowState>) -> Result<bool> {
        match output {
            AgentOutput::Session { session_id } => {
                tracing::debug!(agent_id, session_id = %session_id, "Agent reported session");
                Ok(false)
            }
            AgentOutput::Raw { stream, line } => {
                tracing::debug!(agent_id, stream = ?stream, line = %line, "Agent output");
                Ok(false)
            }
            AgentOutput::Exited { code } => {
                self.handle_exit(agent_id, code).await?;
                Ok(true)
            }
            other => match other.to_event(agent_id, self.clock.now()) {
                Some(event) => Ok(self.observe(agent_id, event, state).await?.is_some()),
                None => Ok(false),
            },
        }
    }

    /// Check an agent event against the rules, then journal it
    ///
    /// The checkers see the agent's window without the event itself.
    pub async fn observe(
        &self,
        agent_id: &str,
        event: TrajectoryEvent,
        state: Option<&WorkflowState>,
    ) -> Result<Option<Violation>> {
        let violation = match state {
            Some(state) => {
                let window = self.window(agent_id).await?;
                self.engine.check(agent_id, &event, state, &window)
            }
            None => None,
        };
        self.record(event).await?;
        if let Some(violation) = &violation {
            self.handle_violation(agent_id, violation.clone()).await?;
        }
        Ok(violation)
    }

    async fn check_idle_agents(&self, state: &WorkflowState) -> Result<()> {
        let now = self.clock.now();
        let ids: Vec<String> = state.active_agents().map(|a| a.id.clone()).collect();
        for agent_id in ids {
            let window = match self.window(&agent_id).await {
                Ok(window) => window,
                Err(e) => {
                    tracing::error!(agent_id = %agent_id, error = %e, "Idle check skipped");
                    self.bump(|s| s.step_errors += 1);
                    continue;
                }
            };
            if let Some(violation) = self.engine.check_idle(&agent_id, state, &window, now) {
                if let Err(e) = self.handle_violation(&agent_id, violation).await {
                    tracing::error!(agent_id = %agent_id, error = %e, "Idle violation not handled");
                    self.bump(|s| s.step_errors += 1);
                }
            }
        }
        Ok(())
    }

    /// The agent's recent events, seeded from the journal on first use
    async fn window(&self, agent_id: &str) -> Result<Vec<TrajectoryEvent>> {
        let mut windows = self.windows.lock().await;
        if !windows.contains_key(agent_id) {
            let seeded = self
                .trajectory
                .tail_by_agent(agent_id, self.engine.window())
                .await?;
            windows.insert(agent_id.to_string(), seeded.into());
        }
        Ok(windows
            .get(agent_id)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Journal an event, keep the agent's window current and publish it
    pub async fn record(&self, event: TrajectoryEvent) -> Result<()> {
        self.trajectory.log(&event).await?;
        if let Some(agent_id) = event.agent_id() {
            let mut windows = self.windows.lock().await;
            if let Some(window) = windows.get_mut(agent_id) {
                window.push_back(event.clone());
                while window.len() > self.engine.window() {
                    window.pop_front();
                }
            }
        }
        match serde_json::to_value(&event) {
            Ok(data) => self.sink.publish("trajectory", data),
            Err(e) => tracing::debug!(error = %e, "Trajectory event not publishable"),
        }
        Ok(())
    }

    async fn handle_violation(&self, agent_id: &str, violation: Violation) -> Result<()> {
        tracing::warn!(
            agent_id,
            rule = %violation.rule,
            severity = %violation.severity,
            message = %violation.message,
            "Rule violation"
        );
        self.bump(|s| s.violations += 1);

        let rule = violation.rule.clone();
        let occurrence = match self
            .store
            .update(|state| Ok(state.agents.get_mut(agent_id).map(|a| a.record_violation(&rule))))
            .await
        {
            Ok(count) => count.unwrap_or(1),
            Err(e) if e.is_not_found() => 1,
            Err(e) => return Err(e),
        };

        let correction = match &violation.correction {
            Some(chain) => Some(chain.for_occurrence(occurrence).clone()),
            None if violation.is_blocking() => Some(Correction::block(violation.message.clone())),
            None => None,
        };

        self.record(TrajectoryEvent::Correction {
            agent_id: agent_id.to_string(),
            violation: violation.clone(),
            correction: correction.clone(),
            timestamp: self.clock.now(),
        })
        .await?;

        let Some(correction) = correction else {
            self.publish_violation(agent_id, &violation, occurrence, None);
            return Ok(());
        };
        let outcome = self.applicator.apply(agent_id, &correction).await?;
        self.publish_violation(agent_id, &violation, occurrence, serde_json::to_value(&outcome).ok());

        match outcome.action {
            CorrectionKind::Compact => {
                self.engine.reset(agent_id);
                self.windows.lock().await.remove(agent_id);
            }
            CorrectionKind::Restart => self.after_restart(agent_id).await?,
            CorrectionKind::Retry => {
                if let Some(retry) = outcome.retry {
                    tracing::info!(agent_id, max = retry.max, backoff_ms = retry.backoff_ms, "Retry requested");
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn publish_violation(
        &self,
        agent_id: &str,
        violation: &Violation,
        occurrence: u32,
        outcome: Option<serde_json::Value>,
    ) {
        self.sink.publish(
            "violations",
            serde_json::json!({
                "agentId": agent_id,
                "violation": violation,
                "occurrence": occurrence,
                "outcome": outcome,
            }),
        );
    }

    /// A restarted agent keeps its id; refresh what changed with the new process
    async fn after_restart(&self, agent_id: &str) -> Result<()> {
        self.engine.reset(agent_id);
        self.windows.lock().await.remove(agent_id);
        let Some(info) = self.agents.get(agent_id).await else {
            return Ok(());
        };
        self.heartbeats.record_heartbeat(agent_id);

        let now = self.clock.now();
        self.store
            .update(|state| {
                if let Some(agent) = state.agents.get_mut(agent_id) {
                    agent.status = AgentStatus::Active;
                    agent.pid = info.pid;
                    agent.session_id = Some(info.session_id.clone());
                    agent.spawned_at = Some(info.spawned_at);
                    agent.last_heartbeat = Some(now);
                }
                Ok(())
            })
            .await?;
        self.record(TrajectoryEvent::Spawn {
            agent_id: info.id.clone(),
            agent_type: info.agent_type.clone(),
            task_id: info.task_id.clone(),
            pid: info.pid,
            session_id: info.session_id.clone(),
            timestamp: now,
        })
        .await
    }

    async fn handle_exit(&self, agent_id: &str, code: Option<i32>) -> Result<()> {
        if self.agents.is_running(agent_id).await {
            tracing::debug!(agent_id, "Exit of a replaced session");
            return Ok(());
        }
        tracing::info!(agent_id, code = ?code, "Agent exited");
        self.heartbeats.unregister(agent_id);
        self.engine.reset(agent_id);
        self.windows.lock().await.remove(agent_id);

        let held = self
            .store
            .update(|state| {
                let held = state.task_held_by(agent_id).map(|t| (t.id.clone(), t.attempts));
                if let Some(agent) = state.agents.get_mut(agent_id) {
                    agent.status = AgentStatus::Stopped;
                    agent.pid = None;
                }
                Ok(held)
            })
            .await;
        let held = match held {
            Ok(held) => held,
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        // unfinished work goes back to the pool after a clean exit, up to the attempt cap
        if let Some((task_id, attempts)) = held {
            let reason = match code {
                Some(0) if attempts < self.max_task_attempts => {
                    self.store.release_task(&task_id).await?;
                    tracing::warn!(agent_id, task_id = %task_id, attempts, "Agent exited without completing its task");
                    return Ok(());
                }
                Some(0) => format!("agent exited {} times without completing the task", attempts),
                Some(code) => format!("agent exited with code {}", code),
                None => "agent was killed".to_string(),
            };
            self.store.fail_task(&task_id, agent_id, reason).await?;
        }
        Ok(())
    }

    // Step 2

    async fn spawn_agents(&self) -> Result<()> {
        let Some(state) = self.store.load().await? else {
            return Ok(());
        };
        for spec in self.coordinator.spawn_specs(&state) {
            let task = spec.task_id.as_deref().and_then(|id| state.tasks.get(id));
            let launch = self.coordinator.launch_spec(&spec, task)?;
            let heartbeat_ms = launch
                .heartbeat_ms
                .unwrap_or(self.default_heartbeat.as_millis() as u64);

            let info = match self.agents.spawn(launch).await {
                Ok(info) => info,
                Err(e) => {
                    tracing::error!(agent_type = %spec.agent_type, task_id = ?spec.task_id, error = %e, "Spawn failed");
                    self.bump(|s| s.step_errors += 1);
                    continue;
                }
            };

            let now = self.clock.now();
            self.store
                .update(|state| {
                    let mut agent = AgentState::new(&info.id, &info.agent_type);
                    agent.status = AgentStatus::Active;
                    agent.pid = info.pid;
                    agent.session_id = Some(info.session_id.clone());
                    agent.spawned_at = Some(info.spawned_at);
                    agent.last_heartbeat = Some(now);
                    state.agents.insert(info.id.clone(), agent);
                    Ok(())
                })
                .await?;
            self.heartbeats.register(&info.id, heartbeat_ms);
            self.bump(|s| s.spawned += 1);

            self.record(TrajectoryEvent::Spawn {
                agent_id: info.id.clone(),
                agent_type: info.agent_type.clone(),
                task_id: info.task_id.clone(),
                pid: info.pid,
                session_id: info.session_id.clone(),
                timestamp: now,
            })
            .await?;

            if let Some(task_id) = &spec.task_id {
                let claim = self.store.assign_task(task_id, &info.id).await?;
                if claim.task.is_some() {
                    self.record(TrajectoryEvent::TaskClaim {
                        agent_id: info.id.clone(),
                        task_id: task_id.clone(),
                        timestamp: now,
                    })
                    .await?;
                } else {
                    tracing::warn!(agent_id = %info.id, task_id = %task_id, "Task no longer claimable for spawned agent");
                }
            }
            tracing::info!(agent_id = %info.id, agent_type = %info.agent_type, task_id = ?info.task_id, "Agent spawned");
        }
        Ok(())
    }

    // Step 3

    async fn advance_phase(&self) -> Result<()> {
        if self.store.load().await?.is_none() {
            return Ok(());
        }
        match self.coordinator.check_phase_transition().await? {
            TransitionCheck::Ready { to, .. } => {
                let entry = self.coordinator.transition_to(&to).await?;
                let event = TrajectoryEvent::PhaseTransition {
                    from: entry.from,
                    to: entry.to,
                    timestamp: entry.timestamp,
                };
                if let Ok(data) = serde_json::to_value(&event) {
                    self.sink.publish("trajectory", data);
                }
            }
            TransitionCheck::Blocked { to, reason } => {
                tracing::trace!(to = %to, reason = %reason, "Phase transition not ready");
            }
            TransitionCheck::Final => {}
        }
        Ok(())
    }

    // Step 4

    fn check_heartbeats(&self) {
        let overdue = self.heartbeats.overdue_agents();
        for agent in &overdue {
            if let Some(HeartbeatStatus::Miss { count }) = self.heartbeats.check(&agent.agent_id) {
                tracing::warn!(agent_id = %agent.agent_id, misses = count, overdue_ms = agent.overdue_ms, "Heartbeat missed");
            }
        }
        self.bump(|s| s.overdue_agents = overdue.len());
    }

    // Step 5

    async fn flush(&self) -> Result<()> {
        self.store.flush().await?;
        if let Some(state) = self.store.snapshot().await? {
            let summary = serde_json::json!({
                "currentPhase": state.current_phase,
                "pending": state.tasks.count_by_status(TaskStatus::Pending),
                "running": state.tasks.count_by_status(TaskStatus::Running),
                "completed": state.tasks.count_by_status(TaskStatus::Completed),
                "failed": state.tasks.count_by_status(TaskStatus::Failed),
                "activeAgents": state.active_agents().count(),
            });
            self.sink.publish("state", summary);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::CommandBackend;
    use crate::clock::ManualClock;
    use crate::config::RulesConfig;
    use crate::sink::RecordingSink;
    use crate::workflow::compiled::fixtures::workflow;
    use crate::workflow::{CompiledWorkflow, FileArtifactStore};
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        store: Arc<StateStore>,
        trajectory: Arc<TrajectoryLog>,
        agents: Arc<AgentManager>,
        heartbeats: Arc<HeartbeatMonitor>,
        sink: Arc<RecordingSink>,
        clock: ManualClock,
        event_loop: Arc<EventLoop>,
    }

    async fn harness(wf: CompiledWorkflow, script: &str) -> Harness {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(Utc::now().timestamp_millis());
        let store = Arc::new(StateStore::with_clock(dir.path().join("state.json"), Arc::new(clock.clone())));
        let trajectory = Arc::new(TrajectoryLog::new(dir.path().join("trajectory.jsonl")));
        let engine = Arc::new(RuleEngine::from_workflow(&wf, dir.path(), &RulesConfig::default()));
        let agents = Arc::new(
            AgentManager::new(Arc::new(CommandBackend::shell(script)), dir.path())
                .with_grace_period(Duration::from_millis(200)),
        );
        let heartbeats = Arc::new(HeartbeatMonitor::new(Arc::new(clock.clone())));
        let coordinator = Arc::new(
            WorkflowCoordinator::new(
                wf,
                dir.path(),
                store.clone(),
                trajectory.clone(),
                Arc::new(FileArtifactStore::new(dir.path().join("artifacts"))),
            )
            .with_clock(Arc::new(clock.clone())),
        );
        coordinator.ensure_state().await.unwrap();
        let sink = Arc::new(RecordingSink::new());
        let event_loop = Arc::new(
            EventLoop::new(
                store.clone(),
                trajectory.clone(),
                engine,
                agents.clone(),
                heartbeats.clone(),
                coordinator,
            )
            .with_sink(sink.clone())
            .with_clock(Arc::new(clock.clone()))
            .with_tick_interval(Duration::from_millis(20)),
        );
        Harness {
            _dir: dir,
            store,
            trajectory,
            agents,
            heartbeats,
            sink,
            clock,
            event_loop,
        }
    }

    fn implement_first() -> CompiledWorkflow {
        let mut wf = workflow();
        // start in the implementation phase
        wf.phases.remove(0);
        wf.phases[0].requires.clear();
        wf
    }

    /// Put a task in the hands of a worker the manager never spawned
    async fn hold(h: &Harness, task_id: &str, worker: &str, attempts: u32) {
        let now = h.clock.now();
        h.store
            .update(|s| {
                let task = s.tasks.get_mut(task_id).unwrap();
                task.status = TaskStatus::Running;
                task.claimed_by = Some(worker.to_string());
                task.claimed_at = Some(now);
                task.started_at = Some(now);
                task.attempts = attempts;
                Ok(())
            })
            .await
            .unwrap();
    }

    async fn wait_for_spawn(agents: &AgentManager) {
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !agents.is_empty().await {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_tick_spawns_and_assigns() {
        let h = harness(implement_first(), "sleep 5").await;
        h.event_loop.tick().await;

        let state = h.store.load().await.unwrap().unwrap();
        assert_eq!(state.agents.len(), 1);
        let agent = state.agents.values().next().unwrap();
        assert_eq!(agent.status, AgentStatus::Active);
        assert_eq!(agent.current_task.as_deref(), Some("T1"));
        assert_eq!(state.tasks.get("T1").unwrap().claimed_by.as_deref(), Some(agent.id.as_str()));
        assert!(h.heartbeats.is_registered(&agent.id));

        let kinds: Vec<_> = h.trajectory.tail(10).await.unwrap().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, ["spawn", "task_claim"]);
        assert_eq!(h.sink.topic("state").len(), 1);

        // T2 is blocked on T1 and the phase cap is not reached, so nothing more spawns
        h.event_loop.tick().await;
        assert_eq!(h.store.load().await.unwrap().unwrap().agents.len(), 1);
        h.agents.kill_all().await;
    }

    #[tokio::test]
    async fn test_violation_applies_correction_ladder() {
        let h = harness(implement_first(), "sleep 5").await;
        h.event_loop.tick().await;
        let agent_id = h.store.load().await.unwrap().unwrap().agents.keys().next().unwrap().clone();
        let state = h.store.load().await.unwrap().unwrap();

        let write = TrajectoryEvent::tool_use(&agent_id, "Write", Some("src/auth/token.ts".into()), h.clock.now());
        let violation = h.event_loop.observe(&agent_id, write, Some(&state)).await.unwrap().unwrap();
        assert_eq!(violation.rule, "tdd");

        let state = h.store.load().await.unwrap().unwrap();
        assert_eq!(state.agents[&agent_id].violation_counts["tdd"], 1);
        let events = h.trajectory.tail(2).await.unwrap();
        assert_eq!(events[0].kind(), "tool_use");
        match &events[1] {
            TrajectoryEvent::Correction { correction, .. } => {
                assert_eq!(correction.as_ref().unwrap().kind, CorrectionKind::Prompt);
            }
            other => panic!("expected correction, got {:?}", other),
        }

        // second occurrence takes the restart link; the agent keeps its id
        let session_before = h.agents.get(&agent_id).await.unwrap().session_id;
        let write = TrajectoryEvent::tool_use(&agent_id, "Edit", Some("src/auth/token.ts".into()), h.clock.now());
        h.event_loop.observe(&agent_id, write, Some(&state)).await.unwrap();
        let after = h.agents.get(&agent_id).await.unwrap();
        assert_ne!(after.session_id, session_before);
        assert_eq!(h.sink.topic("violations").len(), 2);

        h.agents.kill_all().await;
    }

    #[tokio::test]
    async fn test_exit_releases_task_after_clean_exit() {
        let h = harness(implement_first(), "exit 0").await;
        h.event_loop.tick().await;
        let agent_id = h.store.load().await.unwrap().unwrap().agents.keys().next().unwrap().clone();

        for _ in 0..100 {
            if !h.agents.is_running(&agent_id).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // let the exit notice reach the queue
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.event_loop.tick().await;

        let state = h.store.load().await.unwrap().unwrap();
        assert_eq!(state.agents[&agent_id].status, AgentStatus::Stopped);
        assert!(!h.heartbeats.is_registered(&agent_id));
        // T1 went back to pending and a new agent picked it up in the same tick
        let t1 = state.tasks.get("T1").unwrap();
        assert_ne!(t1.claimed_by.as_deref(), Some(agent_id.as_str()));
        h.agents.kill_all().await;
    }

    #[tokio::test]
    async fn test_failed_output_does_not_drop_the_rest() {
        let h = harness(implement_first(), "sleep 5").await;
        hold(&h, "T1", "ghost", 1).await;
        // a directory in place of the journal makes every event write fail
        let journal = h.trajectory.path().to_path_buf();
        let _ = std::fs::remove_file(&journal);
        std::fs::create_dir_all(&journal).unwrap();

        let mut state = h.store.load().await.unwrap();
        let outputs = vec![
            (
                "ghost".to_string(),
                AgentOutput::ToolUse {
                    tool: "Read".into(),
                    path: Some("src/lib.rs".into()),
                    input: serde_json::Value::Null,
                },
            ),
            ("ghost".to_string(), AgentOutput::Exited { code: Some(0) }),
        ];
        h.event_loop.handle_outputs(outputs, &mut state).await;

        assert_eq!(h.event_loop.stats().step_errors, 1);
        // the exit was handled and the state handed back is the reloaded one
        let t1 = state.unwrap().tasks.get("T1").unwrap().clone();
        assert_eq!(t1.status, TaskStatus::Pending);
        assert!(t1.claimed_by.is_none());
        let stored = h.store.load().await.unwrap().unwrap();
        assert_eq!(stored.tasks.get("T1").unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_clean_exit_fails_task_at_attempt_cap() {
        let h = harness(implement_first(), "sleep 5").await;
        hold(&h, "T1", "ghost", 3).await;

        let mut state = h.store.load().await.unwrap();
        h.event_loop
            .handle_outputs(vec![("ghost".to_string(), AgentOutput::Exited { code: Some(0) })], &mut state)
            .await;

        let t1 = h.store.load().await.unwrap().unwrap().tasks.get("T1").unwrap().clone();
        assert_eq!(t1.status, TaskStatus::Failed);
        assert_eq!(t1.last_error.as_deref(), Some("agent exited 3 times without completing the task"));
        assert_eq!(h.event_loop.stats().step_errors, 0);
    }

    #[tokio::test]
    async fn test_phase_advances_when_ready() {
        let mut wf = workflow();
        wf.tasks[0].files.push("architecture.md".into());
        let h = harness(wf, "sleep 5").await;
        h.store
            .update(|s| {
                s.tasks.get_mut("T1").unwrap().status = TaskStatus::Completed;
                Ok(())
            })
            .await
            .unwrap();

        h.event_loop.tick().await;
        let state = h.store.load().await.unwrap().unwrap();
        assert_eq!(state.current_phase, "implement");
        assert!(h
            .sink
            .topic("trajectory")
            .iter()
            .any(|e| e["type"] == "phase_transition"));
        h.agents.kill_all().await;
    }

    #[tokio::test]
    async fn test_overdue_heartbeats_are_counted() {
        let h = harness(implement_first(), "sleep 5").await;
        h.event_loop.tick().await;
        assert_eq!(h.event_loop.stats().overdue_agents, 0);

        h.clock.advance(31_000);
        h.event_loop.tick().await;
        assert_eq!(h.event_loop.stats().overdue_agents, 1);
        let agent_id = h.heartbeats.overdue_agents()[0].agent_id.clone();
        assert_eq!(h.heartbeats.overdue_agents()[0].misses, 1);

        h.heartbeats.record_heartbeat(&agent_id);
        h.event_loop.tick().await;
        assert_eq!(h.event_loop.stats().overdue_agents, 0);
        h.agents.kill_all().await;
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let h = harness(implement_first(), "sleep 5").await;
        h.event_loop.start().await;
        h.event_loop.start().await;
        assert!(h.event_loop.is_running().await);

        wait_for_spawn(&h.agents).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        h.event_loop.stop().await;
        h.event_loop.stop().await;
        assert!(!h.event_loop.is_running().await);
        assert!(h.event_loop.stats().ticks >= 1);
        h.agents.kill_all().await;
    }

    #[tokio::test]
    async fn test_step_errors_are_contained() {
        let h = harness(implement_first(), "sleep 5").await;
        // a directory where the temp file goes makes every state write fail
        std::fs::create_dir_all(h.store.path().with_extension("json.tmp")).unwrap();
        h.event_loop.tick().await;

        let stats = h.event_loop.stats();
        assert_eq!(stats.ticks, 1);
        assert!(stats.step_errors >= 1);
        h.agents.kill_all().await;
    }
}
