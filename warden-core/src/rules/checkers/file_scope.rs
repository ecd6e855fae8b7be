use std::path::PathBuf;

use super::written_path;
use crate::rules::glob::{any_match, relative_to};
use crate::rules::{CheckContext, Checker, Violation};
use crate::trajectory::TrajectoryEvent;

/// Writes must land inside an allow-list of globs
///
/// With no allow-list configured, the files of the agent's current task are
/// the allow-list. An agent with neither is unrestricted.
pub struct FileScopeChecker {
    allow: Vec<String>,
    project_root: PathBuf,
}

impl FileScopeChecker {
    pub fn new(allow: Vec<String>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            allow,
            project_root: project_root.into(),
        }
    }

    fn task_files(ctx: &CheckContext<'_>) -> Vec<String> {
        let state = ctx.state;
        let by_agent = state
            .agents
            .get(ctx.agent_id)
            .and_then(|a| a.current_task.as_deref())
            .and_then(|id| state.tasks.get(id));
        by_agent
            .or_else(|| state.task_held_by(ctx.agent_id))
            .map(|t| t.files.clone())
            .unwrap_or_default()
    }
}

impl Checker for FileScopeChecker {
    fn name(&self) -> &str {
        "file_scope"
    }

    fn check(&self, event: &TrajectoryEvent, ctx: &CheckContext<'_>) -> Option<Violation> {
        let path = written_path(event)?;
        let allow = if self.allow.is_empty() {
            Self::task_files(ctx)
        } else {
            self.allow.clone()
        };
        if allow.is_empty() {
            return None;
        }

        let relative = relative_to(&self.project_root, path);
        if any_match(&allow, &relative) {
            return None;
        }

        Some(Violation::block(
            "file_scope",
            format!("{} is outside the allowed files: {}", relative, allow.join(", ")),
        ))
    }
}
