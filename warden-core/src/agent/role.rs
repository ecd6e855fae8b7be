//! Agent role definitions
//!
//! Every agent in a compiled workflow declares the role it plays:
//! - Explorer: reads the codebase and reports findings
//! - Planner: turns findings into a task plan
//! - Implementer: writes code for one task at a time
//! - Verifier: runs checks and reviews finished work
//! - Orchestrator: oversees the run and receives escalations

use serde::{Deserialize, Serialize};
use std::fmt;

/// The role an agent plays in a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Explorer,
    Planner,
    #[default]
    Implementer,
    Verifier,
    Orchestrator,
    /// Any role the daemon has no special knowledge of
    #[serde(other)]
    Other,
}

impl AgentRole {
    /// Get all known roles
    pub fn all() -> &'static [AgentRole] {
        &[
            AgentRole::Explorer,
            AgentRole::Planner,
            AgentRole::Implementer,
            AgentRole::Verifier,
            AgentRole::Orchestrator,
        ]
    }

    /// Get the short name for this role
    pub fn name(&self) -> &'static str {
        match self {
            AgentRole::Explorer => "explorer",
            AgentRole::Planner => "planner",
            AgentRole::Implementer => "implementer",
            AgentRole::Verifier => "verifier",
            AgentRole::Orchestrator => "orchestrator",
            AgentRole::Other => "other",
        }
    }

    /// Get a description of what this role does
    pub fn description(&self) -> &'static str {
        match self {
            AgentRole::Explorer => "Reads the codebase and reports findings",
            AgentRole::Planner => "Turns findings into a plan of tasks",
            AgentRole::Implementer => "Implements one claimed task at a time",
            AgentRole::Verifier => "Runs checks and reviews finished work",
            AgentRole::Orchestrator => "Oversees the run and handles escalations",
            AgentRole::Other => "Workflow-specific role",
        }
    }

    /// Whether agents in this role claim tasks from a queue
    pub fn claims_tasks(&self) -> bool {
        matches!(self, AgentRole::Implementer | AgentRole::Verifier)
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "explorer" | "explore" => Ok(AgentRole::Explorer),
            "planner" | "plan" => Ok(AgentRole::Planner),
            "implementer" | "implement" | "impl" => Ok(AgentRole::Implementer),
            "verifier" | "verify" => Ok(AgentRole::Verifier),
            "orchestrator" => Ok(AgentRole::Orchestrator),
            _ => Err(format!("Unknown agent role: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_names_round_trip() {
        for role in AgentRole::all() {
            assert_eq!(role.name().parse::<AgentRole>().unwrap(), *role);
        }
        assert!("bard".parse::<AgentRole>().is_err());
    }

    #[test]
    fn test_unknown_role_deserializes_as_other() {
        let role: AgentRole = serde_json::from_str("\"reviewer\"").unwrap();
        assert_eq!(role, AgentRole::Other);
        let role: AgentRole = serde_json::from_str("\"planner\"").unwrap();
        assert_eq!(role, AgentRole::Planner);
    }

    #[test]
    fn test_claims_tasks() {
        assert!(AgentRole::Implementer.claims_tasks());
        assert!(!AgentRole::Explorer.claims_tasks());
    }
}
