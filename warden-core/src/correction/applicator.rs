use std::sync::Arc;

use serde::Serialize;

use super::{Correction, CorrectionKind};
use crate::agent::AgentControl;
use crate::clock::{Clock, SystemClock};
use crate::state::{HumanAction, StateStore};
use crate::{Error, Result};

/// Retry parameters handed back to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryDirective {
    pub max: u32,
    pub backoff_ms: u64,
}

/// What applying a correction did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub action: CorrectionKind,
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryDirective>,
}

impl ApplyOutcome {
    fn new(action: CorrectionKind, blocked: bool, message: Option<String>) -> Self {
        Self {
            action,
            blocked,
            message,
            retry: None,
        }
    }
}

/// Carries out one correction link against a live agent
///
/// Only the given link is applied; choosing the link for a repeat occurrence
/// is up to the caller. An agent that has vanished cannot be corrected, so
/// agent failures are logged and ignored. State failures propagate.
pub struct CorrectionApplicator {
    agents: Arc<dyn AgentControl>,
    store: Arc<StateStore>,
    clock: Arc<dyn Clock>,
    default_escalation: String,
}

impl CorrectionApplicator {
    pub fn new(agents: Arc<dyn AgentControl>, store: Arc<StateStore>) -> Self {
        Self {
            agents,
            store,
            clock: Arc::new(SystemClock),
            default_escalation: "human".to_string(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Escalation target used when a correction names none
    pub fn with_default_escalation(mut self, target: impl Into<String>) -> Self {
        self.default_escalation = target.into();
        self
    }

    pub async fn apply(&self, agent_id: &str, correction: &Correction) -> Result<ApplyOutcome> {
        let message = correction.message.clone();
        tracing::info!(agent_id, action = %correction.kind, message = ?message, "Applying correction");

        let outcome = match correction.kind {
            CorrectionKind::Prompt => {
                let text = message.clone().unwrap_or_else(|| "Please correct course.".to_string());
                swallow(agent_id, self.agents.inject(agent_id, &text).await)?;
                ApplyOutcome::new(CorrectionKind::Prompt, false, Some(text))
            }
            CorrectionKind::Warn => {
                tracing::warn!(agent_id, message = ?message, "Rule warning");
                ApplyOutcome::new(CorrectionKind::Warn, false, message)
            }
            CorrectionKind::Block => {
                let text = message.clone().unwrap_or_else(|| "That action is not allowed.".to_string());
                swallow(agent_id, self.agents.inject(agent_id, &format!("BLOCKED: {}", text)).await)?;
                ApplyOutcome::new(CorrectionKind::Block, true, Some(text))
            }
            CorrectionKind::Restart => {
                swallow(agent_id, self.agents.restart(agent_id).await.map(|_| ()))?;
                ApplyOutcome::new(CorrectionKind::Restart, true, message)
            }
            CorrectionKind::Reassign => {
                let released = self.release_task_of(agent_id).await?;
                let text = match &released {
                    Some(task_id) => format!("Task {} has been reassigned. Stop working on it.", task_id),
                    None => "Your task has been reassigned.".to_string(),
                };
                swallow(agent_id, self.agents.inject(agent_id, &text).await)?;
                ApplyOutcome::new(CorrectionKind::Reassign, true, message.or(Some(text)))
            }
            CorrectionKind::Escalate => {
                let target = correction
                    .to
                    .clone()
                    .unwrap_or_else(|| self.default_escalation.clone());
                let text = message.unwrap_or_else(|| format!("Agent {} needs attention", agent_id));
                self.record_escalation(agent_id, &target, &text).await?;
                ApplyOutcome::new(CorrectionKind::Escalate, false, Some(text))
            }
            CorrectionKind::Retry => {
                let mut outcome = ApplyOutcome::new(CorrectionKind::Retry, false, message);
                outcome.retry = Some(RetryDirective {
                    max: correction.max.unwrap_or(3),
                    backoff_ms: correction.backoff.unwrap_or(1000),
                });
                outcome
            }
            CorrectionKind::Compact => {
                let text = compaction_directive(&correction.preserve_types, message.as_deref());
                swallow(agent_id, self.agents.inject(agent_id, &text).await)?;
                ApplyOutcome::new(CorrectionKind::Compact, false, Some(text))
            }
        };
        Ok(outcome)
    }

    async fn release_task_of(&self, agent_id: &str) -> Result<Option<String>> {
        let held = self
            .store
            .snapshot()
            .await?
            .and_then(|state| state.task_held_by(agent_id).map(|t| t.id.clone()));
        match held {
            Some(task_id) => {
                self.store.release_task(&task_id).await?;
                tracing::info!(agent_id, task_id = %task_id, "Task released for reassignment");
                Ok(Some(task_id))
            }
            None => {
                tracing::debug!(agent_id, "Reassign requested but agent holds no task");
                Ok(None)
            }
        }
    }

    async fn record_escalation(&self, agent_id: &str, target: &str, message: &str) -> Result<()> {
        let action = HumanAction {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            target: target.to_string(),
            message: message.to_string(),
            created_at: self.clock.now(),
        };
        let result = self
            .store
            .update(|state| {
                state.pending_human_actions.push(action);
                Ok(())
            })
            .await;
        match result {
            Ok(()) => {
                tracing::warn!(agent_id, target, message, "Escalated to human");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!(agent_id, target, message, "Escalation with no workflow state to record it in");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn compaction_directive(preserve: &[String], message: Option<&str>) -> String {
    let mut text = String::from(message.unwrap_or("Your context is nearly full. Summarize your progress and compact your context now."));
    if !preserve.is_empty() {
        text.push_str(&format!(" Keep everything about: {}.", preserve.join(", ")));
    }
    text
}

fn swallow(agent_id: &str, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(Error::NotFound(what)) => {
            tracing::debug!(agent_id, missing = %what, "Correction target is gone");
            Ok(())
        }
        Err(Error::Agent(reason)) => {
            tracing::debug!(agent_id, reason = %reason, "Correction could not reach agent");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
