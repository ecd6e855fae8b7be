//! Caller-reported liveness tracking
//!
//! Agents (or their harness) report heartbeats over the control socket. The
//! monitor only compares timestamps; it never inspects a process.
//!
//! Miss counting: [`HeartbeatMonitor::check`] increments an agent's miss
//! counter on every call made while the agent is overdue and returns the new
//! value. [`HeartbeatMonitor::overdue_agents`] reports that same stored value
//! without changing it, so the two never disagree.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Ok,
    Miss { count: u32 },
}

/// An agent past its heartbeat interval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverdueAgent {
    pub agent_id: String,
    pub misses: u32,
    pub overdue_ms: i64,
}

#[derive(Debug, Clone, Copy)]
struct Beat {
    interval_ms: i64,
    last_ms: i64,
    misses: u32,
}

impl Beat {
    fn is_overdue(&self, now_ms: i64) -> bool {
        now_ms - self.last_ms >= self.interval_ms
    }
}

pub struct HeartbeatMonitor {
    clock: Arc<dyn Clock>,
    beats: Mutex<HashMap<String, Beat>>,
}

impl std::fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatMonitor").finish_non_exhaustive()
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl HeartbeatMonitor {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            beats: Mutex::new(HashMap::new()),
        }
    }

    fn beats(&self) -> std::sync::MutexGuard<'_, HashMap<String, Beat>> {
        self.beats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start tracking an agent; registration counts as a heartbeat
    pub fn register(&self, agent_id: &str, interval_ms: u64) {
        let now = self.clock.now_ms();
        self.beats().insert(
            agent_id.to_string(),
            Beat {
                interval_ms: interval_ms.max(1) as i64,
                last_ms: now,
                misses: 0,
            },
        );
    }

    /// Record a heartbeat; returns false for an unregistered agent
    pub fn record_heartbeat(&self, agent_id: &str) -> bool {
        let now = self.clock.now_ms();
        match self.beats().get_mut(agent_id) {
            Some(beat) => {
                beat.last_ms = now;
                beat.misses = 0;
                true
            }
            None => false,
        }
    }

    /// Liveness of one agent; `None` when it is not registered
    pub fn check(&self, agent_id: &str) -> Option<HeartbeatStatus> {
        let now = self.clock.now_ms();
        let mut beats = self.beats();
        let beat = beats.get_mut(agent_id)?;
        if beat.is_overdue(now) {
            beat.misses += 1;
            Some(HeartbeatStatus::Miss { count: beat.misses })
        } else {
            Some(HeartbeatStatus::Ok)
        }
    }

    /// Every agent currently past its interval, sorted by id
    pub fn overdue_agents(&self) -> Vec<OverdueAgent> {
        let now = self.clock.now_ms();
        let mut overdue: Vec<_> = self
            .beats()
            .iter()
            .filter(|(_, beat)| beat.is_overdue(now))
            .map(|(id, beat)| OverdueAgent {
                agent_id: id.clone(),
                misses: beat.misses,
                overdue_ms: now - beat.last_ms - beat.interval_ms,
            })
            .collect();
        overdue.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        overdue
    }

    pub fn unregister(&self, agent_id: &str) {
        self.beats().remove(agent_id);
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.beats().contains_key(agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn monitor() -> (ManualClock, HeartbeatMonitor) {
        let clock = ManualClock::new(1_000_000);
        let monitor = HeartbeatMonitor::new(Arc::new(clock.clone()));
        (clock, monitor)
    }

    #[test]
    fn test_miss_escalation_and_reset() {
        let (clock, monitor) = monitor();
        monitor.register("impl-1", 10_000);

        clock.advance(15_000);
        assert_eq!(monitor.check("impl-1"), Some(HeartbeatStatus::Miss { count: 1 }));

        clock.advance(10_000);
        assert_eq!(monitor.check("impl-1"), Some(HeartbeatStatus::Miss { count: 2 }));

        assert!(monitor.record_heartbeat("impl-1"));
        assert_eq!(monitor.check("impl-1"), Some(HeartbeatStatus::Ok));
    }

    #[test]
    fn test_overdue_reports_stored_count() {
        let (clock, monitor) = monitor();
        monitor.register("a", 10_000);
        monitor.register("b", 60_000);

        clock.advance(10_000);
        let overdue = monitor.overdue_agents();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].agent_id, "a");
        assert_eq!(overdue[0].misses, 0);

        monitor.check("a");
        assert_eq!(monitor.overdue_agents()[0].misses, 1);
        // reading does not change the counter
        assert_eq!(monitor.overdue_agents()[0].misses, 1);
    }

    #[test]
    fn test_unknown_agent() {
        let (_clock, monitor) = monitor();
        assert_eq!(monitor.check("ghost"), None);
        assert!(!monitor.record_heartbeat("ghost"));
        monitor.register("a", 1_000);
        monitor.unregister("a");
        assert!(!monitor.is_registered("a"));
    }

    #[test]
    fn test_status_wire_shape() {
        let json = serde_json::to_value(HeartbeatStatus::Miss { count: 2 }).unwrap();
        assert_eq!(json, serde_json::json!({"status": "miss", "count": 2}));
    }
}
