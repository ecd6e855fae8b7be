//! Persisted workflow state

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

/// Default task timeout when the plan does not set one
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 30 * 60;

fn default_timeout() -> u64 {
    DEFAULT_TASK_TIMEOUT_SECS
}

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Claimed,
    Running,
    Verifying,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Verifying => "verifying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A unit of work claimable by one worker at a time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /// Queue this task feeds; `None` means every queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

impl TaskState {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            started_at: None,
            completed_at: None,
            attempts: 0,
            last_error: None,
            dependencies: Vec::new(),
            files: Vec::new(),
            timeout_seconds: DEFAULT_TASK_TIMEOUT_SECS,
            queue: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Whether this task feeds the named queue
    pub fn in_queue(&self, queue: &str) -> bool {
        self.queue.as_deref().map_or(true, |q| q == queue)
    }

    /// Running for longer than its timeout
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        match self.started_at {
            Some(started) => {
                let elapsed_ms = (now - started).num_milliseconds();
                elapsed_ms > (self.timeout_seconds as i64).saturating_mul(1000)
            }
            None => false,
        }
    }

    /// Hand the task to `worker`
    pub fn claim(&mut self, worker: &str, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.claimed_by = Some(worker.to_string());
        self.claimed_at = Some(now);
        self.started_at = Some(now);
        self.attempts += 1;
    }

    /// Put the task back into the pool
    pub fn release(&mut self) {
        self.status = TaskStatus::Pending;
        self.claimed_by = None;
        self.claimed_at = None;
        self.started_at = None;
    }
}

/// Tasks keyed by id, iterated in insertion order
///
/// Serialized as a JSON object; the order of keys on disk is the order tasks
/// were added, which is what "first pending task" means.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskMap {
    tasks: Vec<TaskState>,
}

impl TaskMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&TaskState> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut TaskState> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Insert or replace; a replaced task keeps its position
    pub fn insert(&mut self, task: TaskState) {
        match self.tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => *existing = task,
            None => self.tasks.push(task),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskState> {
        self.tasks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TaskState> {
        self.tasks.iter_mut()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == id)
    }

    pub fn at_mut(&mut self, index: usize) -> Option<&mut TaskState> {
        self.tasks.get_mut(index)
    }

    /// Every dependency of `task` is completed
    pub fn dependencies_met(&self, task: &TaskState) -> bool {
        task.dependencies.iter().all(|dep| {
            self.get(dep)
                .map(|d| d.status == TaskStatus::Completed)
                .unwrap_or(false)
        })
    }

    /// Pending tasks whose dependencies are complete, in insertion order
    pub fn ready(&self) -> impl Iterator<Item = &TaskState> {
        self.tasks
            .iter()
            .filter(move |t| t.status == TaskStatus::Pending && self.dependencies_met(t))
    }

    pub fn count_by_status(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

impl Serialize for TaskMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.tasks.len()))?;
        for task in &self.tasks {
            map.serialize_entry(&task.id, task)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for TaskMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct TaskMapVisitor;

        impl<'de> Visitor<'de> for TaskMapVisitor {
            type Value = TaskMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of task id to task")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<TaskMap, A::Error> {
                let mut tasks = TaskMap::new();
                while let Some((key, task)) = access.next_entry::<String, TaskState>()? {
                    if task.id != key {
                        return Err(serde::de::Error::custom(format!(
                            "task keyed '{}' has id '{}'",
                            key, task.id
                        )));
                    }
                    tasks.insert(task);
                }
                Ok(tasks)
            }
        }

        deserializer.deserialize_map(TaskMapVisitor)
    }
}

impl FromIterator<TaskState> for TaskMap {
    fn from_iter<I: IntoIterator<Item = TaskState>>(iter: I) -> Self {
        let mut map = TaskMap::new();
        for task in iter {
            map.insert(task);
        }
        map
    }
}

/// Liveness of an agent as recorded in state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Active,
    Stopped,
}

/// A worker agent as recorded in state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub id: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub violation_counts: BTreeMap<String, u32>,
    /// When the agent process was started
    #[serde(default)]
    pub spawned_at: Option<DateTime<Utc>>,
}

impl AgentState {
    pub fn new(id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            status: AgentStatus::Idle,
            current_task: None,
            pid: None,
            session_id: None,
            last_heartbeat: None,
            violation_counts: BTreeMap::new(),
            spawned_at: None,
        }
    }

    /// Bump the counter for a rule and return the new count
    pub fn record_violation(&mut self, rule: &str) -> u32 {
        let count = self.violation_counts.entry(rule.to_string()).or_insert(0);
        *count += 1;
        *count
    }
}

/// One entry of the append-only phase ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseHistoryEntry {
    pub from: String,
    pub to: String,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot taken when a phase is left
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub phase: String,
    pub completed_tasks: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Something only a human (or the orchestrator) can resolve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HumanAction {
    pub id: String,
    pub agent_id: String,
    pub target: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Complete persisted state of one workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub workflow_id: String,
    pub workflow_name: String,
    pub started_at: DateTime<Utc>,
    pub current_phase: String,
    #[serde(default)]
    pub phase_history: Vec<PhaseHistoryEntry>,
    #[serde(default)]
    pub tasks: TaskMap,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentState>,
    #[serde(default)]
    pub checkpoints: BTreeMap<String, Checkpoint>,
    #[serde(default)]
    pub pending_human_actions: Vec<HumanAction>,
}

impl WorkflowState {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
        first_phase: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
            started_at: now,
            current_phase: first_phase.into(),
            phase_history: Vec::new(),
            tasks: TaskMap::new(),
            agents: BTreeMap::new(),
            checkpoints: BTreeMap::new(),
            pending_human_actions: Vec::new(),
        }
    }

    /// Check the invariants a loaded state must satisfy
    pub fn validate(&self) -> Result<()> {
        if self.current_phase.trim().is_empty() {
            return Err(Error::Validation("currentPhase must not be empty".to_string()));
        }
        for task in self.tasks.iter() {
            if task.status == TaskStatus::Running
                && (task.claimed_by.is_none() || task.started_at.is_none())
            {
                return Err(Error::Validation(format!(
                    "task {} is running without claimedBy/startedAt",
                    task.id
                )));
            }
        }
        Ok(())
    }

    /// The running task a worker holds, if any
    pub fn task_held_by(&self, worker: &str) -> Option<&TaskState> {
        self.tasks
            .iter()
            .find(|t| t.status == TaskStatus::Running && t.claimed_by.as_deref() == Some(worker))
    }

    pub fn completed_task_ids(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn active_agents(&self) -> impl Iterator<Item = &AgentState> {
        self.agents.values().filter(|a| a.status == AgentStatus::Active)
    }
}
