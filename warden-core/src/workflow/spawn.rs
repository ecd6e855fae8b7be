//! Decides which agents to start for the current phase

use serde::{Deserialize, Serialize};

use super::compiled::CompiledPhase;
use super::phase::PhaseManager;

/// A request to start one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnSpec {
    pub agent_type: String,
    pub task_id: Option<String>,
    pub phase: String,
}

/// Inputs for one trigger evaluation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnContext {
    pub phase: String,
    /// Claimable tasks of the phase's queue, in task order
    pub ready_tasks: Vec<String>,
    /// Agents of the phase's type that are currently active
    pub active_agents: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SpawnTriggerManager {
    phases: PhaseManager,
}

impl SpawnTriggerManager {
    pub fn new(phases: Vec<CompiledPhase>) -> Self {
        Self {
            phases: PhaseManager::new(phases),
        }
    }

    /// Agents to start now: `min(ready, cap - active)`
    ///
    /// A phase without a queue or without an agent never triggers spawns.
    pub fn check_triggers(&self, ctx: &SpawnContext) -> Vec<SpawnSpec> {
        let Some(phase) = self.phases.get(&ctx.phase) else {
            return Vec::new();
        };
        let (Some(agent), Some(_queue)) = (&phase.agent, &phase.queue) else {
            return Vec::new();
        };

        let capacity = match phase.max_parallel() {
            Some(max) => max.saturating_sub(ctx.active_agents),
            None => usize::MAX,
        };

        ctx.ready_tasks
            .iter()
            .take(capacity)
            .map(|task_id| SpawnSpec {
                agent_type: agent.clone(),
                task_id: Some(task_id.clone()),
                phase: phase.name.clone(),
            })
            .collect()
    }
}
