//! Behavioral rules evaluated against every agent event
//!
//! A [`Checker`] inspects one event (plus the agent's recent trajectory and
//! the workflow state) and reports at most one [`Violation`]. Checkers are
//! combined into a [`CheckerChain`]; [`RuleEngine`] builds the chain from the
//! rules declared on each agent of a compiled workflow.

mod chain;
mod checkers;
mod config;
mod engine;
pub mod glob;
mod violation;

pub use chain::{CheckContext, CheckerChain};
pub use checkers::{
    ContextBudgetChecker, FileScopeChecker, MustProgressChecker, NoCodeChecker, PhaseToolChecker,
    ReadOnlyChecker, Scoped, TddChecker, TodoChecker,
};
pub use config::{PhaseToolPolicy, RuleConfig, RuleKind};
pub use engine::{model_context_limit, RuleEngine};
pub use violation::{Severity, Violation};

use crate::state::WorkflowState;
use crate::trajectory::TrajectoryEvent;

/// A single behavioral rule
pub trait Checker: Send + Sync {
    /// Rule name, used in logs
    fn name(&self) -> &str;

    /// Whether this rule governs the given agent
    fn applies_to(&self, _agent_id: &str, _state: &WorkflowState) -> bool {
        true
    }

    /// Inspect one event
    fn check(&self, event: &TrajectoryEvent, ctx: &CheckContext<'_>) -> Option<Violation>;

    /// Inspect an agent on the tick timer, with no event in hand
    fn check_idle(&self, _ctx: &CheckContext<'_>) -> Option<Violation> {
        None
    }

    /// Forget anything remembered about an agent
    fn reset(&self, _agent_id: &str) {}
}
