//! Remedial actions attached to rule violations
//!
//! A [`Correction`] is a chain: the first link applies to the first
//! occurrence of a violation, the `then` link to the second, and so on. The
//! last link keeps applying once the chain runs out.

mod applicator;

pub use applicator::{ApplyOutcome, CorrectionApplicator, RetryDirective};

use std::fmt;

use serde::{Deserialize, Serialize};

/// What a correction does to the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionKind {
    Prompt,
    Warn,
    Block,
    Restart,
    Reassign,
    Retry,
    Escalate,
    Compact,
}

impl CorrectionKind {
    pub fn name(&self) -> &'static str {
        match self {
            CorrectionKind::Prompt => "prompt",
            CorrectionKind::Warn => "warn",
            CorrectionKind::Block => "block",
            CorrectionKind::Restart => "restart",
            CorrectionKind::Reassign => "reassign",
            CorrectionKind::Retry => "retry",
            CorrectionKind::Escalate => "escalate",
            CorrectionKind::Compact => "compact",
        }
    }
}

impl fmt::Display for CorrectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One link of a remedial escalation ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correction {
    #[serde(rename = "type")]
    pub kind: CorrectionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Escalation target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Retry limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
    /// Retry backoff in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<u64>,
    /// Trajectory event types a compaction must keep
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preserve_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<Box<Correction>>,
}

impl Correction {
    pub fn new(kind: CorrectionKind) -> Self {
        Self {
            kind,
            message: None,
            to: None,
            max: None,
            backoff: None,
            preserve_types: Vec::new(),
            then: None,
        }
    }

    pub fn prompt(message: impl Into<String>) -> Self {
        Self::new(CorrectionKind::Prompt).with_message(message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(CorrectionKind::Warn).with_message(message)
    }

    pub fn block(message: impl Into<String>) -> Self {
        Self::new(CorrectionKind::Block).with_message(message)
    }

    pub fn restart() -> Self {
        Self::new(CorrectionKind::Restart)
    }

    pub fn reassign() -> Self {
        Self::new(CorrectionKind::Reassign)
    }

    pub fn retry(max: u32, backoff_ms: u64) -> Self {
        let mut c = Self::new(CorrectionKind::Retry);
        c.max = Some(max);
        c.backoff = Some(backoff_ms);
        c
    }

    pub fn escalate(to: impl Into<String>) -> Self {
        let mut c = Self::new(CorrectionKind::Escalate);
        c.to = Some(to.into());
        c
    }

    pub fn compact(preserve_types: Vec<String>) -> Self {
        let mut c = Self::new(CorrectionKind::Compact);
        c.preserve_types = preserve_types;
        c
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Append `next` after the last link of this chain
    pub fn then(mut self, next: Correction) -> Self {
        append_tail(&mut self, next);
        self
    }

    /// Links in order
    pub fn links(&self) -> impl Iterator<Item = &Correction> {
        std::iter::successors(Some(self), |c| c.then.as_deref())
    }

    /// Number of links in the chain
    pub fn depth(&self) -> usize {
        self.links().count()
    }

    /// Link for the zero-based occurrence `n`, clamped to the last link
    pub fn nth(&self, n: usize) -> &Correction {
        let mut current = self;
        for _ in 0..n {
            match current.then.as_deref() {
                Some(next) => current = next,
                None => break,
            }
        }
        current
    }

    /// Link for the one-based repeat `count` of a violation
    pub fn for_occurrence(&self, count: u32) -> &Correction {
        self.nth(count.saturating_sub(1) as usize)
    }
}

fn append_tail(link: &mut Correction, next: Correction) {
    match link.then {
        Some(ref mut inner) => append_tail(inner, next),
        None => link.then = Some(Box::new(next)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder() -> Correction {
        Correction::prompt("write the test first")
            .then(Correction::restart())
            .then(Correction::escalate("human"))
    }

    #[test]
    fn test_then_appends_to_tail() {
        let chain = ladder();
        let kinds: Vec<_> = chain.links().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![CorrectionKind::Prompt, CorrectionKind::Restart, CorrectionKind::Escalate]
        );
        assert_eq!(chain.depth(), 3);
    }

    #[test]
    fn test_occurrence_selection_clamps() {
        let chain = ladder();
        assert_eq!(chain.for_occurrence(1).kind, CorrectionKind::Prompt);
        assert_eq!(chain.for_occurrence(2).kind, CorrectionKind::Restart);
        assert_eq!(chain.for_occurrence(3).kind, CorrectionKind::Escalate);
        assert_eq!(chain.for_occurrence(7).kind, CorrectionKind::Escalate);
        assert_eq!(chain.for_occurrence(0).kind, CorrectionKind::Prompt);
    }

    #[test]
    fn test_parse_nested_json() {
        let json = r#"{
            "type": "prompt",
            "message": "stay in scope",
            "then": {"type": "compact", "preserveTypes": ["tool_use"], "then": {"type": "escalate", "to": "orchestrator"}}
        }"#;
        let c: Correction = serde_json::from_str(json).unwrap();
        assert_eq!(c.nth(1).preserve_types, vec!["tool_use".to_string()]);
        assert_eq!(c.nth(2).to.as_deref(), Some("orchestrator"));

        let back = serde_json::to_value(&c).unwrap();
        assert_eq!(back["then"]["preserveTypes"][0], "tool_use");
        assert!(back.get("max").is_none());
    }
}
