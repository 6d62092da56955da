//! Device dial-back endpoint

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::WebSocketStream;
use tracing::{info, warn};

use crate::bridge::WsByteStream;
use crate::session::SessionHandle;

/// Hand a device's WebSocket to the session waiting for it. A refused
/// socket is closed right away.
pub async fn serve_device<S>(ws: WebSocketStream<S>, tunnel: SessionHandle)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let tag = tunnel.identity().tag();
    match tunnel.attach_device(Box::new(WsByteStream::new(ws))).await {
        Ok(()) => info!("{} device attached to session {}", tag, tunnel.id()),
        Err(rejected) => {
            warn!("{} device refused for session {}: {:?}", tag, tunnel.id(), rejected.reason);
            if let Some(mut stream) = rejected.stream {
                let _ = stream.shutdown().await;
            }
        }
    }
}
