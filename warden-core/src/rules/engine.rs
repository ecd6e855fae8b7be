use std::path::Path;

use chrono::{DateTime, Utc};

use super::checkers::{
    ContextBudgetChecker, FileScopeChecker, MustProgressChecker, NoCodeChecker, PhaseToolChecker,
    ReadOnlyChecker, Scoped, TddChecker, TodoChecker,
};
use super::{CheckerChain, RuleConfig, RuleKind, Violation};
use crate::config::RulesConfig;
use crate::state::WorkflowState;
use crate::trajectory::TrajectoryEvent;
use crate::workflow::CompiledWorkflow;

const DEFAULT_CONTEXT_LIMIT: u64 = 200_000;
const EXTENDED_CONTEXT_LIMIT: u64 = 1_000_000;

/// Context window size in tokens for a model name
pub fn model_context_limit(model: Option<&str>) -> u64 {
    match model {
        Some(m) if m.contains("[1m]") || m.ends_with("-1m") => EXTENDED_CONTEXT_LIMIT,
        _ => DEFAULT_CONTEXT_LIMIT,
    }
}

/// The workflow's rules, scoped to the agent types that declared them
#[derive(Debug)]
pub struct RuleEngine {
    chain: CheckerChain,
    window: usize,
}

impl RuleEngine {
    pub fn new(chain: CheckerChain, window: usize) -> Self {
        Self { chain, window }
    }

    /// Register each agent definition's rules in declared order
    pub fn from_workflow(workflow: &CompiledWorkflow, project_root: &Path, config: &RulesConfig) -> Self {
        let mut chain = CheckerChain::new();
        for (agent_type, definition) in &workflow.agents {
            for rule in &definition.rules {
                let scoped = Self::build(rule, definition.model.as_deref(), project_root, config)
                    .for_agent_type(agent_type.clone())
                    .with_correction(rule.correction.clone());
                chain.register(Box::new(scoped));
            }
        }
        tracing::debug!(checkers = ?chain.names(), "Rule engine built");
        Self::new(chain, config.trajectory_window)
    }

    fn build(rule: &RuleConfig, model: Option<&str>, project_root: &Path, config: &RulesConfig) -> Scoped {
        match &rule.kind {
            RuleKind::Tdd { test_patterns } => Scoped::new(TddChecker::new(test_patterns.clone())),
            RuleKind::FileScope { allow } => Scoped::new(FileScopeChecker::new(allow.clone(), project_root)),
            RuleKind::PhaseTool { phases } => Scoped::new(PhaseToolChecker::new(phases.clone())),
            RuleKind::ContextBudget {
                warn_at,
                max_at,
                context_limit,
            } => Scoped::new(ContextBudgetChecker::new(
                *warn_at,
                *max_at,
                context_limit.unwrap_or_else(|| model_context_limit(model)),
            )),
            RuleKind::Todo { file } => {
                let file = file.clone().unwrap_or_else(|| config.todo_file.clone());
                Scoped::new(TodoChecker::new(project_root.join(file)))
            }
            RuleKind::MustProgress { window_seconds } => Scoped::new(MustProgressChecker::new(*window_seconds)),
            RuleKind::NoCode { code_extensions } => Scoped::new(NoCodeChecker::new(code_extensions.clone())),
            RuleKind::ReadOnly => Scoped::new(ReadOnlyChecker::new()),
        }
    }

    pub fn chain(&self) -> &CheckerChain {
        &self.chain
    }

    /// Number of past events handed to checkers
    pub fn window(&self) -> usize {
        self.window
    }

    pub fn check(
        &self,
        agent_id: &str,
        event: &TrajectoryEvent,
        state: &WorkflowState,
        trajectory: &[TrajectoryEvent],
    ) -> Option<Violation> {
        self.chain.check(agent_id, event, state, trajectory)
    }

    pub fn check_idle(
        &self,
        agent_id: &str,
        state: &WorkflowState,
        trajectory: &[TrajectoryEvent],
        now: DateTime<Utc>,
    ) -> Option<Violation> {
        self.chain.check_idle(agent_id, state, trajectory, now)
    }

    pub fn reset(&self, agent_id: &str) {
        self.chain.reset(agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::CorrectionKind;
    use crate::state::AgentState;
    use crate::workflow::compiled::fixtures::workflow;

    #[test]
    fn test_from_workflow_scopes_rules() {
        let wf = workflow();
        let engine = RuleEngine::from_workflow(&wf, Path::new("/work/repo"), &RulesConfig::default());
        assert_eq!(engine.chain().names(), vec!["read_only", "tdd", "file_scope"]);

        let mut state = WorkflowState::new("wf", "feature", "implement", Utc::now());
        state.agents.insert("impl-1".into(), AgentState::new("impl-1", "implementer"));
        state.agents.insert("exp-1".into(), AgentState::new("exp-1", "explorer"));

        let write = TrajectoryEvent::tool_use("impl-1", "Write", Some("src/auth/token.ts".into()), Utc::now());
        let v = engine.check("impl-1", &write, &state, &[]).unwrap();
        assert_eq!(v.rule, "tdd");
        assert_eq!(v.correction.unwrap().kind, CorrectionKind::Prompt);

        let bash = TrajectoryEvent::tool_use("exp-1", "Bash", None, Utc::now());
        assert_eq!(engine.check("exp-1", &bash, &state, &[]).unwrap().rule, "read_only");
        // implementer is not read-only
        let bash = TrajectoryEvent::tool_use("impl-1", "Bash", None, Utc::now());
        assert!(engine.check("impl-1", &bash, &state, &[]).is_none());
    }

    #[test]
    fn test_model_context_limit() {
        assert_eq!(model_context_limit(None), 200_000);
        assert_eq!(model_context_limit(Some("sonnet[1m]")), 1_000_000);
    }
}
