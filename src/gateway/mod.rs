//! WebSocket gateway
//!
//! One listener serves three kinds of peers:
//!
//! - `/ssh/{sessionId}`: a device dialing back for a waiting session
//! - `/browser/{provider-dongleId-token}`: a browser terminal
//! - plain HTTP: `/health` and a redirect from `/` to the docs
//!
//! The request line is peeked before the WebSocket handshake runs. Paths
//! under `/ssh/` and `/browser/` always go to the handshake; everything
//! else gets a plain HTTP answer.

mod browser;
mod device;

pub use browser::serve_browser;
pub use device::serve_device;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::identity::{parse_identity, Identity};
use crate::relay::RelayContext;
use crate::session::{SessionHandle, SessionState};
use crate::ssh::JumpServer;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const HEAD_LIMIT: usize = 8 * 1024;
const PEEK_RETRY_DELAY: Duration = Duration::from_millis(25);
const UPGRADE_PREFIXES: [&str; 2] = ["/ssh/", "/browser/"];

/// Where an upgrade request is headed
enum Route {
    Device(SessionHandle),
    Browser(Identity),
}

/// Resolve an upgrade path, or the status to refuse it with.
fn route(ctx: &RelayContext, path: &str) -> Result<Route, (StatusCode, String)> {
    if let Some(id) = path.strip_prefix("/ssh/") {
        let tunnel = ctx
            .registry
            .get(id)
            .ok_or_else(|| (StatusCode::NOT_FOUND, "Session not found".to_string()))?;
        if tunnel.state() != SessionState::AwaitingDevice {
            return Err((StatusCode::CONFLICT, "Session already has a device".to_string()));
        }
        return Ok(Route::Device(tunnel));
    }

    if let Some(username) = path.strip_prefix("/browser/") {
        return parse_identity(username, ctx.decryptor())
            .map(Route::Browser)
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()));
    }

    Err((StatusCode::NOT_FOUND, "Not found".to_string()))
}

fn refuse(status: StatusCode, reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = status;
    response
}

/// Request head of a plain HTTP request
struct PlainRequest {
    method: String,
    path: String,
}

/// Peek until the request line is complete. `None` means the path belongs
/// to a WebSocket endpoint. The caller bounds how long this may wait.
async fn sniff_plain_request(stream: &TcpStream) -> io::Result<Option<PlainRequest>> {
    let mut buf = vec![0u8; HEAD_LIMIT];

    let n = loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "closed before request"));
        }
        if n == buf.len() || buf[..n].windows(2).any(|w| w == b"\r\n") {
            break n;
        }
        tokio::time::sleep(PEEK_RETRY_DELAY).await;
    };

    let head = String::from_utf8_lossy(&buf[..n]);
    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or("/").to_string();

    if UPGRADE_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
        return Ok(None);
    }
    Ok(Some(PlainRequest { method, path }))
}

async fn answer_plain(mut stream: TcpStream, request: &PlainRequest, docs_url: &str) -> io::Result<()> {
    // Drain the head so closing does not reset the connection.
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    while head.len() < HEAD_LIMIT && !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&chunk[..n]);
    }

    let path = request.path.split('?').next().unwrap_or_default();
    let response = match (request.method.as_str(), path) {
        ("GET", "/health") => plain_response("200 OK", "", "ok"),
        ("GET", "/") => plain_response("301 Moved Permanently", &format!("Location: {}\r\n", docs_url), ""),
        _ => plain_response("404 Not Found", "", "Not found"),
    };
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

fn plain_response(status: &str, extra_headers: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\n{}Content-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        extra_headers,
        body.len(),
        body
    )
}

pub struct Gateway {
    ctx: Arc<RelayContext>,
    jump: Arc<JumpServer>,
}

impl Gateway {
    pub fn new(ctx: Arc<RelayContext>, jump: Arc<JumpServer>) -> Self {
        Self { ctx, jump }
    }

    /// Accept connections until `cancel` fires.
    pub async fn run(&self, listener: TcpListener, cancel: CancellationToken) -> io::Result<()> {
        info!("WebSocket gateway listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("WebSocket gateway stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }
                        let ctx = self.ctx.clone();
                        let jump = self.jump.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(ctx, jump, stream, peer).await {
                                debug!("Connection from {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("WebSocket accept failed: {}", e);
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    ctx: Arc<RelayContext>,
    jump: Arc<JumpServer>,
    stream: TcpStream,
    peer: SocketAddr,
) -> io::Result<()> {
    let plain = tokio::time::timeout(HANDSHAKE_TIMEOUT, sniff_plain_request(&stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no request received"))??;

    if let Some(request) = plain {
        debug!("HTTP {} {} from {}", request.method, request.path, peer);
        return answer_plain(stream, &request, &ctx.config.docs_url).await;
    }

    let mut routed = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match route(&ctx, request.uri().path()) {
            Ok(target) => {
                routed = Some(target);
                Ok(response)
            }
            Err((status, reason)) => {
                debug!("Refusing {} from {}: {} {}", request.uri().path(), peer, status, reason);
                Err(refuse(status, reason))
            }
        }
    };

    let ws = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        tokio_tungstenite::accept_hdr_async(stream, callback),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "WebSocket handshake timed out"))?
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    match routed {
        Some(Route::Device(tunnel)) => serve_device(ws, tunnel).await,
        Some(Route::Browser(identity)) => {
            info!("{} browser terminal from {}", identity.tag(), peer);
            serve_browser(ctx, jump, ws, identity).await;
        }
        None => {}
    }
    Ok(())
}
