use std::collections::BTreeMap;

use crate::rules::{CheckContext, Checker, PhaseToolPolicy, Violation};
use crate::trajectory::TrajectoryEvent;

/// Tool policy keyed by the workflow's current phase
pub struct PhaseToolChecker {
    phases: BTreeMap<String, PhaseToolPolicy>,
}

impl PhaseToolChecker {
    pub fn new(phases: BTreeMap<String, PhaseToolPolicy>) -> Self {
        Self { phases }
    }
}

impl Checker for PhaseToolChecker {
    fn name(&self) -> &str {
        "phase_tool"
    }

    fn check(&self, event: &TrajectoryEvent, ctx: &CheckContext<'_>) -> Option<Violation> {
        let TrajectoryEvent::ToolUse { tool, .. } = event else {
            return None;
        };
        let phase = ctx.state.current_phase.as_str();
        let policy = self.phases.get(phase)?;

        if policy.forbidden.iter().any(|t| t == tool) {
            return Some(Violation::block(
                "phase_tool",
                format!("{} is not allowed during the {} phase", tool, phase),
            ));
        }
        if !policy.expected.is_empty() && !policy.expected.iter().any(|t| t == tool) {
            return Some(Violation::warn(
                "phase_tool",
                format!(
                    "{} is unexpected during the {} phase (expected: {})",
                    tool,
                    phase,
                    policy.expected.join(", ")
                ),
            ));
        }
        None
    }
}
