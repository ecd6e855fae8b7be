use super::written_path;
use crate::rules::glob::any_match;
use crate::rules::{CheckContext, Checker, Violation};
use crate::trajectory::TrajectoryEvent;

/// Implementation files may only be written after a test file was
pub struct TddChecker {
    test_patterns: Vec<String>,
}

impl TddChecker {
    pub fn new(test_patterns: Vec<String>) -> Self {
        Self { test_patterns }
    }

    fn is_test_file(&self, path: &str) -> bool {
        any_match(&self.test_patterns, path)
    }
}

impl Checker for TddChecker {
    fn name(&self) -> &str {
        "tdd"
    }

    fn check(&self, event: &TrajectoryEvent, ctx: &CheckContext<'_>) -> Option<Violation> {
        let path = written_path(event)?;
        if self.is_test_file(path) {
            return None;
        }

        let wrote_test = ctx.trajectory.iter().any(|prior| {
            prior.belongs_to(ctx.agent_id)
                && written_path(prior).map(|p| self.is_test_file(p)).unwrap_or(false)
        });
        if wrote_test {
            return None;
        }

        Some(Violation::block(
            "tdd",
            format!("Write a failing test before changing {}", path),
        ))
    }
}
