use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::correction::Correction;

fn default_test_patterns() -> Vec<String> {
    ["**/*.test.*", "**/*.spec.*", "**/tests/**", "**/*_test.*"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_warn_at() -> f64 {
    0.7
}

fn default_max_at() -> f64 {
    0.9
}

fn default_window_seconds() -> u64 {
    300
}

/// Tools a phase forbids or expects
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseToolPolicy {
    pub forbidden: Vec<String>,
    pub expected: Vec<String>,
}

/// Which rule to enforce and its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RuleKind {
    /// Implementation writes need an earlier test write
    Tdd {
        #[serde(default = "default_test_patterns")]
        test_patterns: Vec<String>,
    },

    /// Writes must stay inside the allow-list
    FileScope {
        #[serde(default)]
        allow: Vec<String>,
    },

    /// Per-phase forbidden and expected tools
    PhaseTool {
        #[serde(default)]
        phases: BTreeMap<String, PhaseToolPolicy>,
    },

    /// Estimated context usage against the model limit
    ContextBudget {
        #[serde(default = "default_warn_at")]
        warn_at: f64,
        #[serde(default = "default_max_at")]
        max_at: f64,
        #[serde(default)]
        context_limit: Option<u64>,
    },

    /// No stopping while the todo file has open items
    Todo {
        #[serde(default)]
        file: Option<PathBuf>,
    },

    /// Some tool activity within every window
    MustProgress {
        #[serde(default = "default_window_seconds")]
        window_seconds: u64,
    },

    /// No writes to source files
    NoCode {
        #[serde(default)]
        code_extensions: Vec<String>,
    },

    /// No writes and no shell
    ReadOnly,
}

impl RuleKind {
    pub fn name(&self) -> &'static str {
        match self {
            RuleKind::Tdd { .. } => "tdd",
            RuleKind::FileScope { .. } => "file_scope",
            RuleKind::PhaseTool { .. } => "phase_tool",
            RuleKind::ContextBudget { .. } => "context_budget",
            RuleKind::Todo { .. } => "todo",
            RuleKind::MustProgress { .. } => "must_progress",
            RuleKind::NoCode { .. } => "no_code",
            RuleKind::ReadOnly => "read_only",
        }
    }
}

/// A rule as declared on an agent in the compiled workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(flatten)]
    pub kind: RuleKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction: Option<Correction>,
}

impl RuleConfig {
    pub fn new(kind: RuleKind) -> Self {
        Self { kind, correction: None }
    }

    pub fn with_correction(mut self, correction: Correction) -> Self {
        self.correction = Some(correction);
        self
    }
}
