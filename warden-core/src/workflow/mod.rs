//! Workflow definition and phase coordination
//!
//! - [`CompiledWorkflow`]: the read-only `workflow.json` document
//! - [`PhaseManager`]: phase order and transition preconditions
//! - [`SpawnTriggerManager`]: how many agents each phase wants
//! - [`GateExecutor`]: command checks guarding a phase exit
//! - [`WorkflowCoordinator`]: ties the above to the state store

mod artifact;
pub(crate) mod compiled;
mod coordinator;
mod gate;
mod phase;
mod spawn;

pub use artifact::{Artifact, ArtifactStore, FileArtifactStore};
pub use compiled::{
    AgentDefinition, CompiledGate, CompiledPhase, CompiledQueue, CompiledTask, CompiledWorkflow,
    GateCheck, Parallelism,
};
pub use coordinator::{TransitionCheck, WorkflowCoordinator};
pub use gate::{GateExecutor, GateResult, DEFAULT_CHECK_TIMEOUT};
pub use phase::{PhaseManager, TransitionContext};
pub use spawn::{SpawnContext, SpawnSpec, SpawnTriggerManager};
