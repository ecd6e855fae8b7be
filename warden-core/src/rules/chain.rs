use chrono::{DateTime, Utc};

use super::{Checker, Violation};
use crate::state::WorkflowState;
use crate::trajectory::TrajectoryEvent;

/// What a checker gets to look at
pub struct CheckContext<'a> {
    pub agent_id: &'a str,
    pub state: &'a WorkflowState,
    /// The agent's recent events, oldest first, not including the one checked
    pub trajectory: &'a [TrajectoryEvent],
    pub now: DateTime<Utc>,
}

/// Ordered list of checkers; the first violation wins
#[derive(Default)]
pub struct CheckerChain {
    checkers: Vec<Box<dyn Checker>>,
}

impl std::fmt::Debug for CheckerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl CheckerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`register`](Self::register)
    pub fn with(mut self, checker: impl Checker + 'static) -> Self {
        self.register(Box::new(checker));
        self
    }

    pub fn register(&mut self, checker: Box<dyn Checker>) -> &mut Self {
        self.checkers.push(checker);
        self
    }

    pub fn len(&self) -> usize {
        self.checkers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.checkers.iter().map(|c| c.name()).collect()
    }

    /// Run every applicable checker against `event` in registration order
    pub fn check(
        &self,
        agent_id: &str,
        event: &TrajectoryEvent,
        state: &WorkflowState,
        trajectory: &[TrajectoryEvent],
    ) -> Option<Violation> {
        let ctx = CheckContext {
            agent_id,
            state,
            trajectory,
            now: event.timestamp(),
        };
        self.checkers
            .iter()
            .filter(|c| c.applies_to(agent_id, state))
            .find_map(|c| c.check(event, &ctx))
    }

    /// Timer-driven checks for an agent that may have gone quiet
    pub fn check_idle(
        &self,
        agent_id: &str,
        state: &WorkflowState,
        trajectory: &[TrajectoryEvent],
        now: DateTime<Utc>,
    ) -> Option<Violation> {
        let ctx = CheckContext {
            agent_id,
            state,
            trajectory,
            now,
        };
        self.checkers
            .iter()
            .filter(|c| c.applies_to(agent_id, state))
            .find_map(|c| c.check_idle(&ctx))
    }

    /// Drop per-agent memory in every checker
    pub fn reset(&self, agent_id: &str) {
        for checker in &self.checkers {
            checker.reset(agent_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Fixed {
        name: &'static str,
        hit: Option<&'static str>,
        calls: Arc<AtomicUsize>,
    }

    impl Checker for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn check(&self, _event: &TrajectoryEvent, _ctx: &CheckContext<'_>) -> Option<Violation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.hit.map(|rule| Violation::warn(rule, "hit"))
        }
    }

    #[test]
    fn test_first_violation_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = CheckerChain::new()
            .with(Fixed { name: "quiet", hit: None, calls: calls.clone() })
            .with(Fixed { name: "first", hit: Some("first"), calls: calls.clone() })
            .with(Fixed { name: "second", hit: Some("second"), calls: calls.clone() });

        let state = WorkflowState::new("wf", "demo", "implement", Utc::now());
        let event = TrajectoryEvent::message("a", "hi", Utc::now());
        let violation = chain.check("a", &event, &state, &[]).unwrap();

        assert_eq!(violation.rule, "first");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(chain.names(), vec!["quiet", "first", "second"]);
    }

    #[test]
    fn test_empty_chain_finds_nothing() {
        let chain = CheckerChain::new();
        let state = WorkflowState::new("wf", "demo", "implement", Utc::now());
        let event = TrajectoryEvent::message("a", "hi", Utc::now());
        assert!(chain.check("a", &event, &state, &[]).is_none());
        assert!(chain.check_idle("a", &state, &[], Utc::now()).is_none());
    }
}
