//! Phase ordering and transition preconditions

use std::collections::HashSet;

use super::compiled::CompiledPhase;

/// What is known when deciding whether a phase may start
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionContext {
    /// Artifacts that exist so far
    pub artifacts: HashSet<String>,
    /// The outgoing phase has no unfinished tasks
    pub queue_empty: bool,
}

impl TransitionContext {
    pub fn new(artifacts: impl IntoIterator<Item = String>, queue_empty: bool) -> Self {
        Self {
            artifacts: artifacts.into_iter().collect(),
            queue_empty,
        }
    }
}

/// Phases in workflow order
#[derive(Debug, Clone, Default)]
pub struct PhaseManager {
    phases: Vec<CompiledPhase>,
}

impl PhaseManager {
    pub fn new(phases: Vec<CompiledPhase>) -> Self {
        Self { phases }
    }

    pub fn first_phase(&self) -> Option<&str> {
        self.phases.first().map(|p| p.name.as_str())
    }

    /// The phase after `name`; `None` for the last or an unknown phase
    pub fn next_phase(&self, name: &str) -> Option<&str> {
        let index = self.phases.iter().position(|p| p.name == name)?;
        self.phases.get(index + 1).map(|p| p.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&CompiledPhase> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Required artifacts of `to` that are not in `ctx`
    pub fn missing_requirements(&self, to: &str, ctx: &TransitionContext) -> Vec<String> {
        self.get(to)
            .map(|phase| {
                phase
                    .requires
                    .iter()
                    .filter(|r| !ctx.artifacts.contains(*r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn can_transition(&self, from: &str, to: &str, ctx: &TransitionContext) -> bool {
        if from == to || self.get(to).is_none() {
            return false;
        }
        ctx.queue_empty && self.missing_requirements(to, ctx).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::compiled::fixtures::workflow;

    fn manager() -> PhaseManager {
        PhaseManager::new(workflow().phases)
    }

    #[test]
    fn test_order() {
        let phases = manager();
        assert_eq!(phases.first_phase(), Some("explore"));
        assert_eq!(phases.next_phase("explore"), Some("implement"));
        assert_eq!(phases.next_phase("verify"), None);
        assert_eq!(phases.next_phase("nowhere"), None);
    }

    #[test]
    fn test_gated_on_architecture_artifact() {
        let phases = manager();
        let without = TransitionContext::new(Vec::new(), true);
        assert!(!phases.can_transition("explore", "implement", &without));
        assert_eq!(
            phases.missing_requirements("implement", &without),
            vec!["architecture.md".to_string()]
        );

        let with = TransitionContext::new(vec!["architecture.md".to_string()], true);
        assert!(phases.can_transition("explore", "implement", &with));
    }

    #[test]
    fn test_requires_empty_queue_and_known_target() {
        let phases = manager();
        let busy = TransitionContext::new(vec!["architecture.md".to_string()], false);
        assert!(!phases.can_transition("explore", "implement", &busy));

        let idle = TransitionContext::new(Vec::new(), true);
        assert!(!phases.can_transition("verify", "deploy", &idle));
        assert!(!phases.can_transition("verify", "verify", &idle));
    }
}
