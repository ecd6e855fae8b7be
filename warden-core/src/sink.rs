//! Outbound notifications from the daemon core

use std::sync::Mutex;

/// Receives topic notifications; publishing never fails
pub trait EventSink: Send + Sync {
    fn publish(&self, topic: &str, data: serde_json::Value);
}

/// Drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _topic: &str, _data: serde_json::Value) {}
}

/// Keeps every notification in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn topic(&self, topic: &str) -> Vec<serde_json::Value> {
        self.events()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, data)| data)
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, topic: &str, data: serde_json::Value) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((topic.to_string(), data));
    }
}
