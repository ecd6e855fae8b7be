//! Blanket restrictions for roles that should not touch code

use std::path::Path;

use super::{is_write_tool, written_path, SHELL_TOOLS};
use crate::rules::{CheckContext, Checker, Violation};
use crate::trajectory::TrajectoryEvent;

const DEFAULT_CODE_EXTENSIONS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "mjs", "cjs", "py", "go", "java", "kt", "swift", "c", "cc",
    "cpp", "h", "hpp", "cs", "rb", "php", "scala", "sh",
];

/// Blocks writes to source files; docs and config stay writable
pub struct NoCodeChecker {
    code_extensions: Vec<String>,
}

impl NoCodeChecker {
    pub fn new(code_extensions: Vec<String>) -> Self {
        let code_extensions = if code_extensions.is_empty() {
            DEFAULT_CODE_EXTENSIONS.iter().map(|s| s.to_string()).collect()
        } else {
            code_extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_string())
                .collect()
        };
        Self { code_extensions }
    }

    fn is_code(&self, path: &str) -> bool {
        Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.code_extensions.iter().any(|c| c.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }
}

impl Checker for NoCodeChecker {
    fn name(&self) -> &str {
        "no_code"
    }

    fn check(&self, event: &TrajectoryEvent, _ctx: &CheckContext<'_>) -> Option<Violation> {
        let path = written_path(event)?;
        if !self.is_code(path) {
            return None;
        }
        Some(Violation::block(
            "no_code",
            format!("This role may not write source code ({})", path),
        ))
    }
}

/// Blocks every file write and shell command
#[derive(Default)]
pub struct ReadOnlyChecker;

impl ReadOnlyChecker {
    pub fn new() -> Self {
        Self
    }
}

impl Checker for ReadOnlyChecker {
    fn name(&self) -> &str {
        "read_only"
    }

    fn check(&self, event: &TrajectoryEvent, _ctx: &CheckContext<'_>) -> Option<Violation> {
        let TrajectoryEvent::ToolUse { tool, .. } = event else {
            return None;
        };
        if is_write_tool(tool) || SHELL_TOOLS.contains(&tool.as_str()) {
            return Some(Violation::block(
                "read_only",
                format!("This role is read-only; {} is not allowed", tool),
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_no_code_allows_docs() {
        let state = state_with_agent("p", "planner");
        let checker = NoCodeChecker::new(Vec::new());
        let now = Utc::now();
        assert!(checker.check(&write("p", "docs/architecture.md"), &ctx("p", &state, &[], now)).is_none());
        assert!(checker.check(&write("p", "src/lib.rs"), &ctx("p", &state, &[], now)).is_some());
    }

    #[test]
    fn test_no_code_custom_extensions() {
        let state = state_with_agent("p", "planner");
        let checker = NoCodeChecker::new(vec![".sql".into()]);
        let now = Utc::now();
        assert!(checker.check(&write("p", "db/schema.SQL"), &ctx("p", &state, &[], now)).is_some());
        assert!(checker.check(&write("p", "src/lib.rs"), &ctx("p", &state, &[], now)).is_none());
    }

    #[test]
    fn test_read_only_blocks_writes_and_shell() {
        let state = state_with_agent("e", "explorer");
        let checker = ReadOnlyChecker::new();
        let now = Utc::now();
        let bash = TrajectoryEvent::tool_use("e", "Bash", None, now);
        let grep = TrajectoryEvent::tool_use("e", "Grep", None, now);
        assert!(checker.check(&bash, &ctx("e", &state, &[], now)).is_some());
        assert!(checker.check(&write("e", "notes.md"), &ctx("e", &state, &[], now)).is_some());
        assert!(checker.check(&grep, &ctx("e", &state, &[], now)).is_none());
    }
}
