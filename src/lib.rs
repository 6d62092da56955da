//! ssh-relay - SSH over WebSocket for devices that can only dial out
//!
//! Users reach a device's sshd through a `ProxyJump` host; the device is
//! asked over its RPC channel to open a WebSocket back to the relay, and the
//! two sides are spliced together. A browser terminal drives the same path
//! from inside the relay.

pub mod athena;
pub mod bridge;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod relay;
pub mod session;
pub mod ssh;

pub use error::RelayError;
pub use relay::{Relay, RelayContext};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
