use std::path::{Path, PathBuf};

use crate::rules::{CheckContext, Checker, Violation};
use crate::trajectory::TrajectoryEvent;

/// An agent may not stop while the todo file has unchecked items
pub struct TodoChecker {
    file: PathBuf,
}

impl TodoChecker {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self { file: file.into() }
    }

    /// Unchecked `- [ ]` items in a todo file; a missing file has none
    pub fn open_items(path: &Path) -> Vec<String> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Could not read todo file");
                }
                return Vec::new();
            }
        };
        contents
            .lines()
            .map(str::trim_start)
            .filter_map(|line| {
                line.strip_prefix("- [ ]")
                    .or_else(|| line.strip_prefix("* [ ]"))
                    .map(|rest| rest.trim().to_string())
            })
            .collect()
    }
}

impl Checker for TodoChecker {
    fn name(&self) -> &str {
        "todo"
    }

    fn check(&self, event: &TrajectoryEvent, _ctx: &CheckContext<'_>) -> Option<Violation> {
        let TrajectoryEvent::Stop { .. } = event else {
            return None;
        };
        let open = Self::open_items(&self.file);
        if open.is_empty() {
            return None;
        }
        Some(Violation::block(
            "todo",
            format!(
                "{} still has {} unchecked item(s), first: {}",
                self.file.display(),
                open.len(),
                open[0]
            ),
        ))
    }
}
