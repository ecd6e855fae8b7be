use std::collections::HashMap;
use std::sync::Mutex;

use crate::rules::{CheckContext, Checker, Violation};
use crate::trajectory::TrajectoryEvent;

const CHARS_PER_TOKEN: u64 = 4;

#[derive(Debug, Default)]
struct Usage {
    tokens: u64,
    warned: bool,
}

/// Estimated context usage against the model's context limit
///
/// Keeps a running token estimate per agent. The first check for an agent
/// seeds it from the trajectory window; afterwards each event only adds its
/// own size. [`reset`](Checker::reset) starts the count over, which is what
/// a compaction does.
pub struct ContextBudgetChecker {
    warn_at: f64,
    max_at: f64,
    context_limit: u64,
    usage: Mutex<HashMap<String, Usage>>,
}

impl ContextBudgetChecker {
    pub fn new(warn_at: f64, max_at: f64, context_limit: u64) -> Self {
        Self {
            warn_at,
            max_at,
            context_limit: context_limit.max(1),
            usage: Mutex::new(HashMap::new()),
        }
    }

    /// Token estimate for one event
    pub fn estimate_tokens(event: &TrajectoryEvent) -> u64 {
        let chars = serde_json::to_string(event).map(|s| s.len() as u64).unwrap_or(0);
        chars.div_ceil(CHARS_PER_TOKEN)
    }

    /// Current estimate for an agent
    pub fn tokens_for(&self, agent_id: &str) -> u64 {
        let usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        usage.get(agent_id).map(|u| u.tokens).unwrap_or(0)
    }
}

impl Checker for ContextBudgetChecker {
    fn name(&self) -> &str {
        "context_budget"
    }

    fn check(&self, event: &TrajectoryEvent, ctx: &CheckContext<'_>) -> Option<Violation> {
        let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        let entry = usage.entry(ctx.agent_id.to_string()).or_insert_with(|| Usage {
            tokens: ctx
                .trajectory
                .iter()
                .filter(|e| e.belongs_to(ctx.agent_id))
                .map(Self::estimate_tokens)
                .sum(),
            warned: false,
        });
        entry.tokens += Self::estimate_tokens(event);

        let ratio = entry.tokens as f64 / self.context_limit as f64;
        if ratio >= self.max_at {
            return Some(Violation::block(
                "context_exceeded",
                format!(
                    "Context at {:.0}% of {} tokens; compact before continuing",
                    ratio * 100.0,
                    self.context_limit
                ),
            ));
        }
        if ratio >= self.warn_at && !entry.warned {
            entry.warned = true;
            return Some(Violation::warn(
                "context_warning",
                format!("Context at {:.0}% of {} tokens", ratio * 100.0, self.context_limit),
            ));
        }
        None
    }

    fn reset(&self, agent_id: &str) {
        let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        usage.remove(agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use chrono::{DateTime, Utc};

    /// Fixed timestamp so every event serializes to the same length
    fn message(len: usize) -> TrajectoryEvent {
        let at = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        TrajectoryEvent::message("a", "x".repeat(len), at)
    }

    #[test]
    fn test_warning_then_exceeded() {
        let state = state_with_agent("a", "implementer");
        let per_event = ContextBudgetChecker::estimate_tokens(&message(400));
        // limit sized so that 7 events cross 70% and 9 cross 90%
        let checker = ContextBudgetChecker::new(0.7, 0.9, per_event * 10);
        let now = Utc::now();

        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(checker.check(&message(400), &ctx("a", &state, &[], now)).map(|v| v.rule));
        }
        assert!(seen[..6].iter().all(Option::is_none));
        assert_eq!(seen[6].as_deref(), Some("context_warning"));
        assert!(seen[7].is_none(), "warning fires once");
        assert_eq!(seen[8].as_deref(), Some("context_exceeded"));
        assert_eq!(seen[9].as_deref(), Some("context_exceeded"));
    }

    #[test]
    fn test_seeds_from_window_once() {
        let state = state_with_agent("a", "implementer");
        let window: Vec<_> = (0..5).map(|_| message(400)).collect();
        let per_event = ContextBudgetChecker::estimate_tokens(&message(400));
        let checker = ContextBudgetChecker::new(0.7, 0.9, per_event * 100);
        let now = Utc::now();

        checker.check(&message(400), &ctx("a", &state, &window, now));
        assert_eq!(checker.tokens_for("a"), per_event * 6);
        checker.check(&message(400), &ctx("a", &state, &window, now));
        assert_eq!(checker.tokens_for("a"), per_event * 7);
    }

    #[test]
    fn test_reset_starts_over() {
        let state = state_with_agent("a", "implementer");
        let checker = ContextBudgetChecker::new(0.7, 0.9, 10);
        let now = Utc::now();
        assert!(checker.check(&message(400), &ctx("a", &state, &[], now)).is_some());
        checker.reset("a");
        assert_eq!(checker.tokens_for("a"), 0);
    }
}
