#![deny(clippy::unwrap_used)]

//! Run scripts on remote hosts over SSH.
//!
//! [`runner`] holds connection resolution, authentication and the session
//! state machine. [`script`] defines what the runner executes.

pub mod runner;
pub mod script;

pub use runner::{
    Cause, ConnectionDescriptor, ConnectionRecord, NO_EXIT_CODE, RunnerConfig, RunnerError,
    Session, SessionState, SharedBuffer,
};
pub use script::{Script, ScriptTemplate, Shell};
