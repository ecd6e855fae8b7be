//! Built-in rule checkers

mod context_budget;
mod file_scope;
mod must_progress;
mod phase_tool;
mod restriction;
mod tdd;
mod todo;

pub use context_budget::ContextBudgetChecker;
pub use file_scope::FileScopeChecker;
pub use must_progress::MustProgressChecker;
pub use phase_tool::PhaseToolChecker;
pub use restriction::{NoCodeChecker, ReadOnlyChecker};
pub use tdd::TddChecker;
pub use todo::TodoChecker;

use super::{CheckContext, Checker, Violation};
use crate::correction::Correction;
use crate::state::WorkflowState;
use crate::trajectory::TrajectoryEvent;

/// Tools that create or modify files
pub const WRITE_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit", "NotebookEdit"];

/// Tools that run arbitrary commands
pub const SHELL_TOOLS: &[&str] = &["Bash"];

pub(crate) fn is_write_tool(tool: &str) -> bool {
    WRITE_TOOLS.contains(&tool)
}

/// Target path of a file-writing tool use
pub(crate) fn written_path(event: &TrajectoryEvent) -> Option<&str> {
    match event {
        TrajectoryEvent::ToolUse {
            tool,
            path: Some(path),
            ..
        } if is_write_tool(tool) => Some(path),
        _ => None,
    }
}

/// Restricts a checker to one agent type and attaches the rule's correction
pub struct Scoped {
    agent_type: Option<String>,
    correction: Option<Correction>,
    inner: Box<dyn Checker>,
}

impl Scoped {
    pub fn new(inner: impl Checker + 'static) -> Self {
        Self {
            agent_type: None,
            correction: None,
            inner: Box::new(inner),
        }
    }

    pub fn for_agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    pub fn with_correction(mut self, correction: Option<Correction>) -> Self {
        self.correction = correction;
        self
    }

    fn attach(&self, violation: Violation) -> Violation {
        if violation.correction.is_some() {
            violation
        } else {
            violation.with_correction(self.correction.clone())
        }
    }
}

impl Checker for Scoped {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn applies_to(&self, agent_id: &str, state: &WorkflowState) -> bool {
        let in_scope = match &self.agent_type {
            Some(agent_type) => state
                .agents
                .get(agent_id)
                .map(|a| &a.agent_type == agent_type)
                .unwrap_or(false),
            None => true,
        };
        in_scope && self.inner.applies_to(agent_id, state)
    }

    fn check(&self, event: &TrajectoryEvent, ctx: &CheckContext<'_>) -> Option<Violation> {
        self.inner.check(event, ctx).map(|v| self.attach(v))
    }

    fn check_idle(&self, ctx: &CheckContext<'_>) -> Option<Violation> {
        self.inner.check_idle(ctx).map(|v| self.attach(v))
    }

    fn reset(&self, agent_id: &str) {
        self.inner.reset(agent_id)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use chrono::{DateTime, Utc};

    use crate::rules::CheckContext;
    use crate::state::{AgentState, WorkflowState};
    use crate::trajectory::TrajectoryEvent;

    pub fn state_with_agent(agent_id: &str, agent_type: &str) -> WorkflowState {
        let mut state = WorkflowState::new("wf", "demo", "implement", Utc::now());
        state
            .agents
            .insert(agent_id.to_string(), AgentState::new(agent_id, agent_type));
        state
    }

    pub fn write(agent_id: &str, path: &str) -> TrajectoryEvent {
        TrajectoryEvent::tool_use(agent_id, "Write", Some(path.to_string()), Utc::now())
    }

    pub fn ctx<'a>(
        agent_id: &'a str,
        state: &'a WorkflowState,
        trajectory: &'a [TrajectoryEvent],
        now: DateTime<Utc>,
    ) -> CheckContext<'a> {
        CheckContext {
            agent_id,
            state,
            trajectory,
            now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::correction::CorrectionKind;
    use crate::rules::CheckerChain;

    #[test]
    fn test_scoped_checker_only_governs_its_agent_type() {
        let chain = CheckerChain::new().with(
            Scoped::new(ReadOnlyChecker::new())
                .for_agent_type("explorer")
                .with_correction(Some(Correction::block("read only"))),
        );

        let mut state = state_with_agent("explorer-1", "explorer");
        state
            .agents
            .insert("impl-1".into(), crate::state::AgentState::new("impl-1", "implementer"));

        let v = chain
            .check("explorer-1", &write("explorer-1", "src/a.rs"), &state, &[])
            .unwrap();
        assert_eq!(v.correction.unwrap().kind, CorrectionKind::Block);
        assert!(chain.check("impl-1", &write("impl-1", "src/a.rs"), &state, &[]).is_none());
        // unknown agents are not governed by scoped rules
        assert!(chain.check("ghost", &write("ghost", "src/a.rs"), &state, &[]).is_none());
    }

    #[test]
    fn test_written_path_only_for_write_tools() {
        let read = TrajectoryEvent::tool_use("a", "Read", Some("src/a.rs".into()), chrono::Utc::now());
        assert!(written_path(&read).is_none());
        assert_eq!(written_path(&write("a", "src/a.rs")), Some("src/a.rs"));
    }
}
