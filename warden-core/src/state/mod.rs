//! Workflow state model and its crash-safe store

mod model;
mod store;

pub use model::{
    AgentState, AgentStatus, Checkpoint, HumanAction, PhaseHistoryEntry, TaskMap, TaskState,
    TaskStatus, WorkflowState, DEFAULT_TASK_TIMEOUT_SECS,
};
pub use store::{ClaimResult, Recovery, Repair, RepairKind, StateStore};
