//! Error types for Warden

use thiserror::Error;

/// Result type alias for Warden operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for Warden operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Persisted or received data failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// A worker tried to act on a task it does not own
    #[error("Task {task_id} is claimed by {owner:?}, not {worker_id}")]
    Ownership {
        task_id: String,
        owner: Option<String>,
        worker_id: String,
    },

    /// A referenced task, agent, phase or gate does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Agent execution error
    #[error("Agent error: {0}")]
    Agent(String),

    /// Workflow definition error
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error means the referenced entity is simply absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
