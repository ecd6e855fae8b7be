//! Warden IPC - control protocol between the daemon and its clients
//!
//! Newline-delimited JSON over a Unix socket whose path is derived from the
//! project root. The daemon side is [`ControlServer`] plus a
//! [`RequestHandler`]; clients use [`ControlClient`].

pub mod client;
pub mod error;
pub mod exec;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod socket;

pub use client::{ControlClient, Subscription};
pub use error::{Error, Result};
pub use exec::ExecRunner;
pub use handler::{ControlHandler, RequestHandler};
pub use protocol::{ExecRequest, ExecResult, PushEvent, Request, Response, CHANNELS};
pub use server::ControlServer;
pub use socket::socket_path;
