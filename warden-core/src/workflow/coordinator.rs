//! Drives a compiled workflow through its phases
//!
//! The coordinator reads the persisted state to decide what should happen
//! next: which agents to spawn for the current phase, and whether the phase
//! is finished. It owns no state of its own apart from a cached gate result.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::artifact::ArtifactStore;
use super::compiled::CompiledWorkflow;
use super::gate::{GateExecutor, GateResult};
use super::phase::{PhaseManager, TransitionContext};
use super::spawn::{SpawnContext, SpawnSpec, SpawnTriggerManager};
use crate::agent::LaunchSpec;
use crate::clock::{Clock, SystemClock};
use crate::state::{Checkpoint, PhaseHistoryEntry, StateStore, TaskState, WorkflowState};
use crate::trajectory::{TrajectoryEvent, TrajectoryLog};
use crate::{Error, Result};

/// Result of asking whether the current phase can be left
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TransitionCheck {
    /// Every precondition holds
    Ready { from: String, to: String },
    /// The next phase exists but cannot start yet
    Blocked { to: String, reason: String },
    /// The current phase is the last one
    Final,
}

impl TransitionCheck {
    pub fn is_ready(&self) -> bool {
        matches!(self, TransitionCheck::Ready { .. })
    }

    /// Target phase when ready
    pub fn target(&self) -> Option<&str> {
        match self {
            TransitionCheck::Ready { to, .. } => Some(to),
            _ => None,
        }
    }
}

/// Gate outcome remembered until the completed task set changes
#[derive(Debug, Clone)]
struct CachedGate {
    phase: String,
    completed: usize,
    result: GateResult,
}

pub struct WorkflowCoordinator {
    workflow: CompiledWorkflow,
    phases: PhaseManager,
    triggers: SpawnTriggerManager,
    gates: GateExecutor,
    store: Arc<StateStore>,
    trajectory: Arc<TrajectoryLog>,
    artifacts: Arc<dyn ArtifactStore>,
    clock: Arc<dyn Clock>,
    gate_cache: Mutex<Option<CachedGate>>,
}

impl std::fmt::Debug for WorkflowCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowCoordinator")
            .field("workflow", &self.workflow.name)
            .finish_non_exhaustive()
    }
}

impl WorkflowCoordinator {
    pub fn new(
        workflow: CompiledWorkflow,
        workdir: impl Into<PathBuf>,
        store: Arc<StateStore>,
        trajectory: Arc<TrajectoryLog>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            phases: PhaseManager::new(workflow.phases.clone()),
            triggers: SpawnTriggerManager::new(workflow.phases.clone()),
            gates: GateExecutor::new(workdir),
            workflow,
            store,
            trajectory,
            artifacts,
            clock: Arc::new(SystemClock),
            gate_cache: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn workflow(&self) -> &CompiledWorkflow {
        &self.workflow
    }

    pub fn phases(&self) -> &PhaseManager {
        &self.phases
    }

    /// Fresh state: first phase, seed tasks in declared order
    pub fn initial_state(&self) -> Result<WorkflowState> {
        let first = self
            .phases
            .first_phase()
            .ok_or_else(|| Error::Workflow(format!("workflow '{}' has no phases", self.workflow.name)))?;
        let mut state = WorkflowState::new(
            uuid::Uuid::new_v4().to_string(),
            &self.workflow.name,
            first,
            self.clock.now(),
        );
        state.tasks = self.workflow.tasks.iter().map(|t| t.to_state()).collect();
        Ok(state)
    }

    /// Load the persisted state, starting the workflow when there is none
    pub async fn ensure_state(&self) -> Result<WorkflowState> {
        if let Some(state) = self.store.load().await? {
            if state.workflow_name != self.workflow.name {
                tracing::warn!(
                    persisted = %state.workflow_name,
                    compiled = %self.workflow.name,
                    "Persisted state belongs to a different workflow"
                );
            }
            return Ok(state);
        }
        let state = self.initial_state()?;
        self.store.save(state.clone()).await?;
        tracing::info!(
            workflow = %state.workflow_name,
            workflow_id = %state.workflow_id,
            phase = %state.current_phase,
            tasks = state.tasks.len(),
            "Workflow started"
        );
        Ok(state)
    }

    /// Agents the current phase wants started
    pub fn spawn_specs(&self, state: &WorkflowState) -> Vec<SpawnSpec> {
        let Some(phase) = self.phases.get(&state.current_phase) else {
            return Vec::new();
        };
        let (Some(agent), Some(queue)) = (&phase.agent, &phase.queue) else {
            return Vec::new();
        };
        let ctx = SpawnContext {
            phase: phase.name.clone(),
            ready_tasks: state
                .tasks
                .ready()
                .filter(|t| t.in_queue(queue))
                .map(|t| t.id.clone())
                .collect(),
            active_agents: state.active_agents().filter(|a| &a.agent_type == agent).count(),
        };
        self.triggers.check_triggers(&ctx)
    }

    /// Launch parameters for a spawn request
    pub fn launch_spec(&self, spec: &SpawnSpec, task: Option<&TaskState>) -> Result<LaunchSpec> {
        let definition = self
            .workflow
            .agent(&spec.agent_type)
            .ok_or_else(|| Error::NotFound(format!("agent definition {}", spec.agent_type)))?;

        let mut prompt = format!(
            "You are the {} agent ({}) in the '{}' phase of workflow '{}'.",
            spec.agent_type,
            definition.role.description(),
            spec.phase,
            self.workflow.name
        );
        if let Some(task) = task {
            prompt.push_str(&format!("\n\nTask {}: {}", task.id, task.description));
            if !task.files.is_empty() {
                prompt.push_str(&format!("\nFiles: {}", task.files.join(", ")));
            }
        }

        let mut launch = LaunchSpec::new(&spec.agent_type, prompt).with_model(definition.model.clone());
        launch.tools = definition.tools.clone();
        launch.heartbeat_ms = definition.heartbeat;
        if let Some(task_id) = &spec.task_id {
            launch = launch.with_task(task_id);
        }
        Ok(launch)
    }

    /// Artifact names available to the next phase
    ///
    /// Union of stored artifacts (ids and exports) of completed tasks and
    /// the files those tasks declared.
    pub async fn available_artifacts(&self, state: &WorkflowState) -> Result<HashSet<String>> {
        let completed = state.completed_task_ids();
        let mut names: HashSet<String> = state
            .tasks
            .iter()
            .filter(|t| completed.contains(&t.id))
            .flat_map(|t| t.files.iter().cloned())
            .collect();
        for (id, artifact) in self.artifacts.load_for_dependencies(&completed).await? {
            names.insert(id);
            names.extend(artifact.exports);
        }
        Ok(names)
    }

    /// Whether the current phase's queue has no unfinished work
    pub fn queue_empty(&self, state: &WorkflowState) -> bool {
        let Some(queue) = self.phases.get(&state.current_phase).and_then(|p| p.queue.as_deref()) else {
            return true;
        };
        state
            .tasks
            .iter()
            .filter(|t| t.in_queue(queue))
            .all(|t| t.status.is_terminal())
    }

    pub async fn check_phase_transition(&self) -> Result<TransitionCheck> {
        let state = self
            .store
            .load()
            .await?
            .ok_or_else(|| Error::NotFound("workflow state".to_string()))?;
        let from = state.current_phase.clone();
        let Some(to) = self.phases.next_phase(&from).map(str::to_string) else {
            return Ok(TransitionCheck::Final);
        };

        let ctx = TransitionContext {
            artifacts: self.available_artifacts(&state).await?,
            queue_empty: self.queue_empty(&state),
        };
        if !ctx.queue_empty {
            return Ok(TransitionCheck::Blocked {
                to,
                reason: format!("phase '{}' still has unfinished tasks", from),
            });
        }
        let missing = self.phases.missing_requirements(&to, &ctx);
        if !missing.is_empty() {
            return Ok(TransitionCheck::Blocked {
                to,
                reason: format!("missing artifacts: {}", missing.join(", ")),
            });
        }
        if !self.phases.can_transition(&from, &to, &ctx) {
            return Ok(TransitionCheck::Blocked {
                to,
                reason: "transition not allowed".to_string(),
            });
        }

        if let Some(gate) = self.phases.get(&from).and_then(|p| p.gate.clone()) {
            let result = self.cached_gate(&from, &gate, state.completed_task_ids().len()).await?;
            if !result.passed {
                return Ok(TransitionCheck::Blocked {
                    to,
                    reason: format!(
                        "gate '{}' failed at {}: {}",
                        gate,
                        result.failed_check.as_deref().unwrap_or("?"),
                        result.error.as_deref().unwrap_or("")
                    ),
                });
            }
        }

        Ok(TransitionCheck::Ready { from, to })
    }

    async fn cached_gate(&self, phase: &str, gate: &str, completed: usize) -> Result<GateResult> {
        let cached = self
            .gate_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .filter(|c| c.phase == phase && c.completed == completed);
        if let Some(cached) = cached {
            return Ok(cached.result);
        }
        let result = self.execute_gate(gate).await?;
        *self.gate_cache.lock().unwrap_or_else(|e| e.into_inner()) = Some(CachedGate {
            phase: phase.to_string(),
            completed,
            result: result.clone(),
        });
        Ok(result)
    }

    /// Move to `phase`, checkpointing the phase being left
    ///
    /// Unconditional; callers check readiness first.
    pub async fn transition_to(&self, phase: &str) -> Result<PhaseHistoryEntry> {
        if self.phases.get(phase).is_none() {
            return Err(Error::NotFound(format!("phase {}", phase)));
        }
        let now = self.clock.now();
        let entry = self
            .store
            .update(|state| {
                let entry = PhaseHistoryEntry {
                    from: state.current_phase.clone(),
                    to: phase.to_string(),
                    timestamp: now,
                };
                state.checkpoints.insert(
                    entry.from.clone(),
                    Checkpoint {
                        phase: entry.from.clone(),
                        completed_tasks: state.completed_task_ids(),
                        timestamp: now,
                    },
                );
                state.phase_history.push(entry.clone());
                state.current_phase = phase.to_string();
                Ok(entry)
            })
            .await?;

        self.trajectory
            .log(&TrajectoryEvent::PhaseTransition {
                from: entry.from.clone(),
                to: entry.to.clone(),
                timestamp: now,
            })
            .await?;
        tracing::info!(from = %entry.from, to = %entry.to, "Phase transition");
        Ok(entry)
    }

    pub async fn execute_gate(&self, name: &str) -> Result<GateResult> {
        let gate = self
            .workflow
            .gates
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("gate {}", name)))?;
        tracing::info!(gate = name, checks = gate.checks.len(), "Running gate");
        let result = self.gates.execute(gate).await;
        tracing::info!(gate = name, passed = result.passed, "Gate finished");
        Ok(result)
    }
}
