//! Side-car agent supervision.
//!
//! The core never talks to a DCC executable directly -- a separate agent
//! process does, and this crate owns that process: spawning it, speaking
//! the JSON-framed IPC protocol over its stdio, pinging it, and tearing
//! it down. Incoming messages map 1:1 onto the render coordinator's
//! state machine.

pub mod messages;
pub mod supervisor;

pub use messages::{AgentCommand, AgentEvent};
pub use supervisor::{AgentSupervisor, AgentUpdate, SupervisorError};
