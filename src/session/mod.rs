//! Relay Session Management
//!
//! - [`SessionRegistry`]: concurrent map of live sessions and terminals
//! - [`SessionHandle`]: mailbox into a session's owner task
//! - [`SessionState`]: explicit lifecycle state machine

mod actor;
mod registry;
mod state;

pub use actor::{AttachError, AttachRejected, CloseHook, SessionHandle, SessionOptions};
pub use registry::{SessionInfo, SessionRegistry, TerminalGuard};
pub use state::{CloseReason, SessionState};
