//! Browser terminal
//!
//! Gives a browser a shell on the device without any client-side SSH:
//!
//! ```text
//! browser --WS--> jump client --loopback--> Jump server
//!                                               |
//!                            direct-tcpip -> tunnel session <--WS-- device
//!                                               |
//!                     device client (device user) -> PTY + shell
//! ```
//!
//! Keystrokes typed while the hops are being set up are held and replayed
//! once the shell is ready.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use russh::client::Handle;
use russh::Disconnect;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::athena::DEVICE_SSH_PORT;
use crate::bridge::{bridge, PendingBuffer, PreludeTap, Side, WsByteStream};
use crate::identity::Identity;
use crate::relay::RelayContext;
use crate::ssh::{
    connect_with_key, open_shell, open_tunnel, JumpServer, RelayClientHandler, ShellChannel, SshError,
};

const READ_CHUNK: usize = 4096;
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// The two SSH connections behind one terminal
struct Hops {
    jump: Handle<RelayClientHandler>,
    device: Handle<RelayClientHandler>,
}

impl Hops {
    async fn disconnect(&self) {
        let _ = self
            .device
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
        let _ = self
            .jump
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}

async fn connect_device_shell(
    ctx: &RelayContext,
    jump: &JumpServer,
    identity: &Identity,
) -> Result<(Hops, ShellChannel), SshError> {
    let key = ctx.keys.client_key.clone();
    let rpc_timeout = ctx.config.rpc_timeout();

    // Plaintext token: the jump server must not need the token key.
    let jump_handle = connect_with_key(
        jump.connect_loopback(),
        "jump client",
        &identity.username(),
        key.clone(),
        rpc_timeout,
    )
    .await?;

    let tunnel = open_tunnel(&jump_handle, "localhost", DEVICE_SSH_PORT).await?;
    let (tunnel, prelude) = PreludeTap::new(tunnel.into_stream());

    // The device handshake only starts once the device has dialed back.
    let device_timeout = ctx.config.attach_timeout() + rpc_timeout;
    let connected = connect_with_key(
        tunnel,
        "device client",
        &ctx.config.device_ssh_user,
        key,
        device_timeout,
    )
    .await;
    let device_handle = match connected {
        Ok(handle) => handle,
        // A tunnel that failed before pairing says why instead of a banner.
        Err(e) => return Err(prelude.notice().map(SshError::Relay).unwrap_or(e)),
    };

    let hops = Hops {
        jump: jump_handle,
        device: device_handle,
    };
    match open_shell(&hops.device).await {
        Ok(shell) => Ok((hops, shell)),
        Err(e) => {
            hops.disconnect().await;
            Err(e)
        }
    }
}

/// Print a red error line to the terminal and close the socket.
async fn fail<S>(ws: &mut WsByteStream<S>, message: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = ws.send_text(&format!("\x1b[31m{}\x1b[0m\r\n", message)).await;
    let _ = ws.close_with(CloseCode::Error, "").await;
}

/// Run a browser terminal for `identity` until either end goes away.
pub async fn serve_browser<S>(
    ctx: Arc<RelayContext>,
    jump: Arc<JumpServer>,
    ws: WebSocketStream<S>,
    identity: Identity,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let guard = ctx.registry.open_terminal(identity.clone());
    let cancel = guard.cancelled();
    let tag = identity.tag();
    let mut ws = WsByteStream::new(ws);

    let mut pending = PendingBuffer::new(ctx.config.max_buffer_size);
    let mut buf = vec![0u8; READ_CHUNK];

    let setup = connect_device_shell(&ctx, &jump, &identity);
    tokio::pin!(setup);

    let connected = loop {
        tokio::select! {
            res = &mut setup => break res,
            read = ws.read(&mut buf) => match read {
                Ok(0) | Err(_) => {
                    info!("{} browser left during setup", tag);
                    return;
                }
                Ok(n) => {
                    if let Err(overflow) = pending.push(Bytes::copy_from_slice(&buf[..n])) {
                        warn!("{} {}", tag, overflow);
                        fail(&mut ws, &overflow.to_string()).await;
                        return;
                    }
                }
            },
            _ = cancel.cancelled() => {
                fail(&mut ws, "Relay is shutting down").await;
                return;
            }
        }
    };

    let (hops, shell) = match connected {
        Ok(connected) => connected,
        Err(e) => {
            warn!("{} browser terminal setup failed: {}", tag, e);
            fail(&mut ws, &e.to_string()).await;
            return;
        }
    };
    info!("{} browser terminal {} connected", tag, guard.id());

    let ShellChannel {
        channel,
        early_output,
    } = shell;
    let mut shell_stream = channel.into_stream();

    let flushed = async {
        if !early_output.is_empty() {
            ws.write_all(&early_output).await?;
            ws.flush().await?;
        }
        for chunk in pending.drain() {
            shell_stream.write_all(&chunk).await?;
        }
        shell_stream.flush().await
    }
    .await;

    match flushed {
        Ok(()) => {
            let limits = ctx.config.flow_limits();
            tokio::select! {
                outcome = bridge(&mut ws, &mut shell_stream, &limits) => {
                    let side = match outcome.ended_by {
                        Side::Client => "browser",
                        Side::Device => "device",
                    };
                    match outcome.error {
                        Some(e) => debug!("{} terminal ended by {}: {}", tag, side, e),
                        None => debug!("{} terminal ended by {}", tag, side),
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("{} terminal cancelled", tag);
                }
            }
        }
        Err(e) => debug!("{} replaying buffered input failed: {}", tag, e),
    }

    let _ = tokio::time::timeout(CLOSE_GRACE, shell_stream.shutdown()).await;
    drop(shell_stream);
    let _ = tokio::time::timeout(CLOSE_GRACE, hops.disconnect()).await;
    let _ = tokio::time::timeout(CLOSE_GRACE, ws.close_with(CloseCode::Normal, "")).await;
    info!("{} browser terminal {} closed", tag, guard.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::athena::mock::MockDeviceRpc;
    use crate::athena::RpcError;
    use crate::config::generate_key;
    use crate::identity::parse_identity;
    use crate::identity::token::tests::{seal_for, test_decryptor};
    use futures_util::{SinkExt, StreamExt};
    use russh::keys::PublicKey;
    use russh::server::{self, Auth, Msg, Session};
    use russh::{Channel, ChannelId, CryptoVec};
    use tokio::io::{duplex, DuplexStream};
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::tungstenite::Message;

    const WAIT: Duration = Duration::from_secs(10);

    /// Stand-in for the device's sshd: echoes shell input after a prompt.
    struct FakeDevice;

    impl server::Handler for FakeDevice {
        type Error = russh::Error;

        async fn auth_publickey(&mut self, user: &str, _key: &PublicKey) -> Result<Auth, Self::Error> {
            if user == "comma" {
                Ok(Auth::Accept)
            } else {
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }

        async fn channel_open_session(
            &mut self,
            _channel: Channel<Msg>,
            _session: &mut Session,
        ) -> Result<bool, Self::Error> {
            Ok(true)
        }

        async fn pty_request(
            &mut self,
            channel: ChannelId,
            term: &str,
            col_width: u32,
            row_height: u32,
            _pix_width: u32,
            _pix_height: u32,
            _modes: &[(russh::Pty, u32)],
            session: &mut Session,
        ) -> Result<(), Self::Error> {
            assert_eq!((term, col_width, row_height), ("xterm-256color", 80, 24));
            let _ = session.channel_success(channel);
            Ok(())
        }

        async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
            let _ = session.channel_success(channel);
            let _ = session.data(channel, CryptoVec::from_slice(b"device$ "));
            Ok(())
        }

        async fn data(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
            let _ = session.data(channel, CryptoVec::from_slice(data));
            Ok(())
        }
    }

    struct Fixture {
        ctx: Arc<RelayContext>,
        rpc: Arc<MockDeviceRpc>,
        jump: Arc<JumpServer>,
    }

    fn fixture() -> Fixture {
        let rpc = Arc::new(MockDeviceRpc::with_keys(""));
        let ctx = RelayContext::for_tests(rpc.clone());
        let line = ctx.keys.client_key.public_key().to_openssh().unwrap();
        *rpc.keys.lock() = Ok(line);
        let jump = Arc::new(JumpServer::new(ctx.clone()));
        Fixture { ctx, rpc, jump }
    }

    /// Plays the device: waits for the dial-back request and attaches a
    /// fake sshd to the session.
    fn spawn_device(f: &Fixture) {
        let ctx = f.ctx.clone();
        let rpc = f.rpc.clone();
        tokio::spawn(async move {
            let calls = rpc.wait_for_proxy_calls(1).await;
            let id = calls[0].remote_ws_uri.rsplit('/').next().unwrap().to_string();
            let tunnel = ctx.registry.get(&id).unwrap();

            let (relay_end, sshd_end) = duplex(64 * 1024);
            tunnel.attach_device(Box::new(relay_end)).await.unwrap();

            let config = Arc::new(server::Config {
                keys: vec![generate_key().unwrap()],
                ..Default::default()
            });
            let session = server::run_stream(config, sshd_end, FakeDevice).await.unwrap();
            let _ = session.await;
        });
    }

    async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (server_io, client_io) = duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (server, client)
    }

    async fn read_until(browser: &mut WebSocketStream<DuplexStream>, needle: &str) -> String {
        let mut output = String::new();
        tokio::time::timeout(WAIT, async {
            while !output.contains(needle) {
                match browser.next().await {
                    Some(Ok(Message::Binary(data))) => output.push_str(&String::from_utf8_lossy(&data)),
                    Some(Ok(Message::Text(text))) => output.push_str(&text),
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => break,
                }
            }
        })
        .await
        .expect("terminal output timed out");
        output
    }

    #[tokio::test]
    async fn test_browser_reaches_device_shell() {
        let f = fixture();
        spawn_device(&f);

        let sealed = seal_for(&test_decryptor(), b"tok1");
        let identity = parse_identity(&format!("asius-abc123-enc.{}", sealed), f.ctx.decryptor()).unwrap();

        let (server_ws, mut browser) = ws_pair().await;
        let task = tokio::spawn(serve_browser(f.ctx.clone(), f.jump.clone(), server_ws, identity));

        // typed before the shell exists
        browser.send(Message::Text("ls\n".into())).await.unwrap();

        let output = read_until(&mut browser, "ls\n").await;
        assert!(output.starts_with("device$ "), "unexpected output: {:?}", output);
        assert_eq!(f.ctx.registry.terminal_count(), 1);

        // the jump hop logged in with the opened token
        assert_eq!(f.rpc.key_lookups(), vec!["asius-abc123-tok1".to_string()]);
        let calls = f.rpc.proxy_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].username, "asius-abc123-tok1");

        browser.close(None).await.unwrap();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(f.ctx.registry.terminal_count(), 0);
    }

    #[tokio::test]
    async fn test_offline_device_reported_in_red() {
        let f = fixture();
        f.rpc.fail_proxy(RpcError::DeviceOffline);
        let identity = Identity::new(crate::identity::Provider::Asius, "abc123", "tok1");

        let (server_ws, mut browser) = ws_pair().await;
        let task = tokio::spawn(serve_browser(f.ctx.clone(), f.jump.clone(), server_ws, identity));

        let output = read_until(&mut browser, "\x1b[0m\r\n").await;
        assert_eq!(output, "\x1b[31mDevice unreachable: device is offline\x1b[0m\r\n");

        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(f.ctx.registry.terminal_count(), 0);
        tokio::time::timeout(WAIT, async {
            while !f.ctx.registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unauthorized_relay_key_reported() {
        let f = fixture();
        *f.rpc.keys.lock() = Ok(String::new());
        let identity = Identity::new(crate::identity::Provider::Comma, "dongle1", "tok");

        let (server_ws, mut browser) = ws_pair().await;
        let task = tokio::spawn(serve_browser(f.ctx.clone(), f.jump.clone(), server_ws, identity));

        let output = read_until(&mut browser, "\x1b[0m\r\n").await;
        assert!(output.contains("Authentication failed"), "unexpected output: {:?}", output);
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert!(f.rpc.proxy_calls().is_empty());
    }
}
