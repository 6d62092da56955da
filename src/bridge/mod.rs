//! Byte-stream plumbing shared by every relay hop
//!
//! - [`FlowGate`]: high-water-mark backpressure per direction
//! - [`PendingBuffer`]: bounded holding area while a peer is missing
//! - [`pump`] / [`bridge`]: ordered copying between duplex streams
//! - [`WsByteStream`]: a WebSocket viewed as a byte stream
//! - [`PreludeTap`]: keeps what a stream said before it failed

mod flow;
mod pending;
mod prelude;
mod pump;
mod ws_stream;

pub use flow::{FlowGate, FlowLimits};
pub use pending::{PendingBuffer, PendingOverflow};
pub use prelude::{Prelude, PreludeTap};
pub use pump::{bridge, pump, BridgeOutcome, Side};
pub use ws_stream::WsByteStream;

use tokio::io::{AsyncRead, AsyncWrite};

/// Any duplex byte stream: TCP sockets, SSH channels, WebSockets, in-memory pipes
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;
