//! SSH module
//!
//! - [`JumpServer`]: the `ProxyJump` host users connect to
//! - client helpers used by the browser relay to drive both hops over
//!   in-process streams

mod client;
mod error;
mod server;

pub use client::{
    connect_with_key, open_shell, open_tunnel, RelayClientHandler, ShellChannel, BROWSER_COLS,
    BROWSER_ROWS, BROWSER_TERM,
};
pub use error::SshError;
pub use server::{usage_banner, JumpHandler, JumpServer};
