//! SSH client side of the browser relay
//!
//! Both hops the browser relay drives (jump client and device client) run
//! over arbitrary byte streams via `russh::client::connect_stream()`:
//!
//! ```text
//! relay --in-process pipe--> [Jump server] --direct-tcpip--> device WebSocket --> [device sshd]
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use russh::client::{self, Handle, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PrivateKey, PublicKey};
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::error::SshError;

/// Terminal type requested for browser shells
pub const BROWSER_TERM: &str = "xterm-256color";
pub const BROWSER_COLS: u32 = 80;
pub const BROWSER_ROWS: u32 = 24;

/// Client handler for the relay's own SSH connections.
///
/// Host keys are accepted without verification: the jump hop is this very
/// process, and the device hop is only reachable through a session the
/// relay itself brokered.
pub struct RelayClientHandler {
    label: &'static str,
}

impl RelayClientHandler {
    pub fn new(label: &'static str) -> Self {
        Self { label }
    }
}

impl client::Handler for RelayClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        debug!(
            "{} host key {}",
            self.label,
            server_public_key.fingerprint(Default::default())
        );
        Ok(true)
    }
}

fn client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// Run an SSH handshake over `stream` and authenticate with `key`.
pub async fn connect_with_key<S>(
    stream: S,
    label: &'static str,
    username: &str,
    key: Arc<PrivateKey>,
    timeout: Duration,
) -> Result<Handle<RelayClientHandler>, SshError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handler = RelayClientHandler::new(label);

    let mut handle = tokio::time::timeout(timeout, client::connect_stream(client_config(), stream, handler))
        .await
        .map_err(|_| SshError::Timeout(format!("{} handshake timed out", label)))?
        .map_err(|e| SshError::ConnectionFailed(format!("{}: {}", label, e)))?;

    debug!("{} handshake completed", label);

    let key_with_hash = PrivateKeyWithHashAlg::new(key, None);
    let authenticated = tokio::time::timeout(timeout, handle.authenticate_publickey(username, key_with_hash))
        .await
        .map_err(|_| SshError::Timeout(format!("{} authentication timed out", label)))?
        .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;

    if !authenticated.success() {
        return Err(SshError::AuthenticationFailed(format!("{} rejected the key", label)));
    }

    info!("{} authenticated", label);
    Ok(handle)
}

/// Open a `direct-tcpip` tunnel to `host:port` through `handle`.
pub async fn open_tunnel(
    handle: &Handle<RelayClientHandler>,
    host: &str,
    port: u16,
) -> Result<Channel<Msg>, SshError> {
    handle
        .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
        .await
        .map_err(|e| SshError::ChannelError(format!("direct-tcpip to {}:{} failed: {}", host, port, e)))
}

/// Interactive shell with a pseudo-terminal.
pub struct ShellChannel {
    pub channel: Channel<Msg>,
    /// Output that arrived before the shell request was acknowledged
    pub early_output: BytesMut,
}

/// Open a session channel, request a PTY and a shell, and wait for the
/// server to confirm both.
pub async fn open_shell(handle: &Handle<RelayClientHandler>) -> Result<ShellChannel, SshError> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| SshError::ChannelError(format!("session channel failed: {}", e)))?;

    let mut early_output = BytesMut::new();

    channel
        .request_pty(true, BROWSER_TERM, BROWSER_COLS, BROWSER_ROWS, 0, 0, &[])
        .await
        .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;
    expect_success(&mut channel, "PTY", &mut early_output).await?;

    // Servers commonly refuse env vars; the PTY already carries the term type.
    let _ = channel.set_env(false, "TERM", BROWSER_TERM).await;

    channel
        .request_shell(true)
        .await
        .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;
    expect_success(&mut channel, "Shell", &mut early_output).await?;

    debug!("PTY allocated and shell started");
    Ok(ShellChannel {
        channel,
        early_output,
    })
}

async fn expect_success(
    channel: &mut Channel<Msg>,
    what: &str,
    early_output: &mut BytesMut,
) -> Result<(), SshError> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => {
                return Err(SshError::ChannelError(format!("{} request refused", what)))
            }
            Some(ChannelMsg::Data { data }) => early_output.extend_from_slice(&data),
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                return Err(SshError::ChannelError(format!(
                    "channel closed during {} request",
                    what
                )))
            }
            Some(_) => {}
        }
    }
}
