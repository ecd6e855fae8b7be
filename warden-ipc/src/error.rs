//! Error types for the control protocol

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] warden_core::Error),

    /// Nothing is listening on the socket
    #[error("Cannot connect to daemon at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another daemon already owns the socket
    #[error("A daemon is already listening on {0}")]
    AddressInUse(PathBuf),

    #[error("Connection closed before a response arrived")]
    Closed,

    #[error("No response within {0:?}")]
    Timeout(Duration),

    /// The daemon answered with an error response
    #[error("Daemon error: {0}")]
    Remote(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}
