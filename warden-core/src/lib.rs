//! Warden Core - Core library for the Warden agent orchestration daemon
//!
//! This crate holds everything the daemon does apart from talking to
//! clients: persisted workflow state, the trajectory journal, behavioral
//! rules and their corrections, agent processes, phase coordination and the
//! tick loop that drives them.

pub mod agent;
pub mod clock;
pub mod config;
pub mod correction;
pub mod error;
pub mod event_loop;
pub mod rules;
pub mod sink;
pub mod state;
pub mod trajectory;
pub mod workflow;

pub use config::{discover_project_root, Config};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, LoopStats};
pub use sink::{EventSink, NullSink};
