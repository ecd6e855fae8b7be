//! The compiled workflow document (`workflow.json`)
//!
//! Produced by the external workflow compiler and read once at startup. The
//! daemon never writes it.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::agent::AgentRole;
use crate::rules::RuleConfig;
use crate::state::{TaskState, DEFAULT_TASK_TIMEOUT_SECS};
use crate::{Error, Result};

/// An agent the workflow can spawn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentDefinition {
    pub model: Option<String>,
    pub role: AgentRole,
    pub tools: Vec<String>,
    /// Rules in the order they are enforced
    pub rules: Vec<RuleConfig>,
    /// Heartbeat interval in milliseconds
    pub heartbeat: Option<u64>,
}

/// How many agents a phase may run at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Parallelism {
    /// `true` means unlimited, `false` means one
    Flag(bool),
    Count(u32),
}

impl Parallelism {
    /// Concurrency cap; `None` is unlimited
    pub fn max_agents(&self) -> Option<usize> {
        match self {
            Parallelism::Flag(true) => None,
            Parallelism::Flag(false) => Some(1),
            Parallelism::Count(n) => Some(*n as usize),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledPhase {
    pub name: String,
    /// Agent definition driving this phase
    #[serde(default)]
    pub agent: Option<String>,
    /// Queue whose ready tasks spawn agents
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub parallel: Option<Parallelism>,
    /// Artifacts that must exist before this phase can start
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub produces: Vec<String>,
    /// Gate that must pass before leaving this phase
    #[serde(default)]
    pub gate: Option<String>,
}

impl CompiledPhase {
    /// Concurrency cap; absent `parallel` means one agent
    pub fn max_parallel(&self) -> Option<usize> {
        match self.parallel {
            Some(p) => p.max_agents(),
            None => Some(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompiledQueue {
    pub description: Option<String>,
}

/// One command of a gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateCheck {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompiledGate {
    pub checks: Vec<GateCheck>,
}

/// A task seeded into the state when the workflow starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledTask {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub queue: Option<String>,
}

impl CompiledTask {
    pub fn to_state(&self) -> TaskState {
        let task = TaskState::new(&self.id, &self.description)
            .with_dependencies(self.dependencies.clone())
            .with_files(self.files.clone())
            .with_timeout(self.timeout_seconds.unwrap_or(DEFAULT_TASK_TIMEOUT_SECS));
        match &self.queue {
            Some(queue) => task.with_queue(queue),
            None => task,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledWorkflow {
    pub name: String,
    /// Agent definition that receives escalations
    #[serde(default)]
    pub orchestrator: Option<String>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentDefinition>,
    pub phases: Vec<CompiledPhase>,
    #[serde(default)]
    pub queues: BTreeMap<String, CompiledQueue>,
    #[serde(default)]
    pub gates: BTreeMap<String, CompiledGate>,
    #[serde(default)]
    pub tasks: Vec<CompiledTask>,
}

impl CompiledWorkflow {
    /// Read and validate `workflow.json`
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("workflow file {}", path.display()))
            } else {
                Error::Io(e)
            }
        })?;
        let workflow: CompiledWorkflow = serde_json::from_str(&contents)
            .map_err(|e| Error::Workflow(format!("invalid {}: {}", path.display(), e)))?;
        workflow.validate()?;
        Ok(workflow)
    }

    /// Check cross references between phases, agents, queues and gates
    pub fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            return Err(Error::Workflow(format!("workflow '{}' has no phases", self.name)));
        }

        let mut seen = HashSet::new();
        for phase in &self.phases {
            if !seen.insert(phase.name.as_str()) {
                return Err(Error::Workflow(format!("duplicate phase '{}'", phase.name)));
            }
            if let Some(agent) = &phase.agent {
                if !self.agents.contains_key(agent) {
                    return Err(Error::Workflow(format!(
                        "phase '{}' uses unknown agent '{}'",
                        phase.name, agent
                    )));
                }
            }
            if let Some(queue) = &phase.queue {
                if !self.queues.contains_key(queue) {
                    return Err(Error::Workflow(format!(
                        "phase '{}' uses unknown queue '{}'",
                        phase.name, queue
                    )));
                }
            }
            if let Some(gate) = &phase.gate {
                if !self.gates.contains_key(gate) {
                    return Err(Error::Workflow(format!(
                        "phase '{}' uses unknown gate '{}'",
                        phase.name, gate
                    )));
                }
            }
        }

        if let Some(orchestrator) = &self.orchestrator {
            if !self.agents.contains_key(orchestrator) {
                return Err(Error::Workflow(format!("unknown orchestrator agent '{}'", orchestrator)));
            }
        }

        let task_ids: HashSet<&str> = self.tasks.iter().map(|t| t.id.as_str()).collect();
        if task_ids.len() != self.tasks.len() {
            return Err(Error::Workflow("duplicate task ids".to_string()));
        }
        for task in &self.tasks {
            if let Some(dep) = task.dependencies.iter().find(|d| !task_ids.contains(d.as_str())) {
                return Err(Error::Workflow(format!(
                    "task '{}' depends on unknown task '{}'",
                    task.id, dep
                )));
            }
        }
        Ok(())
    }

    pub fn phase(&self, name: &str) -> Option<&CompiledPhase> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn agent(&self, name: &str) -> Option<&AgentDefinition> {
        self.agents.get(name)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_parse_and_validate() {
        let wf = workflow();
        wf.validate().unwrap();
        assert_eq!(wf.phases.len(), 3);
        assert_eq!(wf.agent("implementer").unwrap().rules.len(), 2);
        assert_eq!(wf.agent("lead").unwrap().role, AgentRole::Orchestrator);
        assert_eq!(wf.phase("implement").unwrap().max_parallel(), Some(2));
        assert_eq!(wf.phase("explore").unwrap().max_parallel(), Some(1));
    }

    #[test]
    fn test_parallel_true_is_unlimited() {
        let phase: CompiledPhase = serde_json::from_str(r#"{"name": "p", "parallel": true}"#).unwrap();
        assert_eq!(phase.max_parallel(), None);
        let phase: CompiledPhase = serde_json::from_str(r#"{"name": "p", "parallel": false}"#).unwrap();
        assert_eq!(phase.max_parallel(), Some(1));
    }

    #[test]
    fn test_validate_rejects_dangling_references() {
        let mut wf = workflow();
        wf.phases[0].agent = Some("ghost".into());
        assert!(matches!(wf.validate(), Err(Error::Workflow(_))));

        let mut wf = workflow();
        wf.tasks[1].dependencies = vec!["T9".into()];
        assert!(wf.validate().is_err());
    }

    #[test]
    fn test_compiled_task_to_state() {
        let wf = workflow();
        let t1 = wf.tasks[0].to_state();
        assert_eq!(t1.queue.as_deref(), Some("work"));
        assert_eq!(t1.timeout_seconds, DEFAULT_TASK_TIMEOUT_SECS);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CompiledWorkflow::load(&dir.path().join("workflow.json")).unwrap_err();
        assert!(err.is_not_found());
    }
}
