//! monitor-agent library
//!
//! Core pieces of the host monitoring agent:
//! - Length-prefixed JSON transport and the request/response channel on top of it
//! - Client that dials the control plane, handshakes and dispatches requests
//! - Concurrent runners for one-shot Actions and progress-reporting Jobs
//! - Supervisor for long-running sub-agent processes (exporters)

pub mod actions;
pub mod backoff;
pub mod channel;
pub mod checker;
pub mod client;
pub mod config;
pub mod runner;
pub mod supervisor;
pub mod transport;
