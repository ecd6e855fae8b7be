use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::rules::{CheckContext, Checker, Violation};
use crate::trajectory::TrajectoryEvent;

/// An agent must use some tool within every window
///
/// Evaluated on the tick timer. Idle time is measured from the later of the
/// agent's last tool use and its spawn; after firing, the next violation
/// needs another full window of silence.
pub struct MustProgressChecker {
    window: Duration,
    last_fired: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MustProgressChecker {
    pub fn new(window_seconds: u64) -> Self {
        Self {
            window: Duration::seconds(window_seconds as i64),
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    fn last_activity(ctx: &CheckContext<'_>) -> Option<DateTime<Utc>> {
        let last_tool = ctx
            .trajectory
            .iter()
            .rev()
            .find(|e| matches!(e, TrajectoryEvent::ToolUse { .. }) && e.belongs_to(ctx.agent_id))
            .map(|e| e.timestamp());
        let spawned = ctx.state.agents.get(ctx.agent_id).and_then(|a| a.spawned_at);
        last_tool.max(spawned)
    }
}

impl Checker for MustProgressChecker {
    fn name(&self) -> &str {
        "must_progress"
    }

    fn check(&self, _event: &TrajectoryEvent, _ctx: &CheckContext<'_>) -> Option<Violation> {
        None
    }

    fn check_idle(&self, ctx: &CheckContext<'_>) -> Option<Violation> {
        let mut fired = self.last_fired.lock().unwrap_or_else(|e| e.into_inner());
        let since = Self::last_activity(ctx).max(fired.get(ctx.agent_id).copied())?;

        let idle = ctx.now - since;
        if idle <= self.window {
            return None;
        }
        fired.insert(ctx.agent_id.to_string(), ctx.now);
        Some(Violation::warn(
            "must_progress",
            format!("No tool activity for {}s", idle.num_seconds()),
        ))
    }

    fn reset(&self, agent_id: &str) {
        let mut fired = self.last_fired.lock().unwrap_or_else(|e| e.into_inner());
        fired.remove(agent_id);
    }
}
