//! Append-only journal of everything agents and the daemon did

mod event;
mod log;

pub use event::TrajectoryEvent;
pub use log::TrajectoryLog;
