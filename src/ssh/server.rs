//! Jump SSH server
//!
//! Terminates SSH from the user's own client (used as a `ProxyJump` host),
//! authenticates the offered key against the keys the target device trusts,
//! and turns every `direct-tcpip` channel into a relay session that waits
//! for the device to dial back.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PublicKey;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::SshError;
use crate::athena::{RpcError, DEVICE_SSH_PORT};
use crate::identity::{offered_key_matches, parse_identity, Identity};
use crate::relay::RelayContext;
use crate::session::{CloseHook, CloseReason, SessionHandle};

const AUTH_REJECTION_TIME: Duration = Duration::from_secs(1);
const LOOPBACK_BUFFER: usize = 64 * 1024;

/// Why a username cannot log in at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthDenied {
    /// Username is not a valid identity
    InvalidIdentity,
    /// The device's key list could not be fetched or is empty
    KeysUnavailable,
}

/// Identity and authorized keys resolved for the last username tried on
/// this connection. Clients try several keys in a row; the device is only
/// asked once.
struct AuthCache {
    username: String,
    outcome: Result<(Identity, Arc<str>), AuthDenied>,
}

pub struct JumpServer {
    config: Arc<server::Config>,
    ctx: Arc<RelayContext>,
}

impl JumpServer {
    pub fn new(ctx: Arc<RelayContext>) -> Self {
        let config = server::Config {
            keys: vec![ctx.keys.host_key.as_ref().clone()],
            methods: MethodSet::from([MethodKind::PublicKey].as_slice()),
            auth_rejection_time: AUTH_REJECTION_TIME,
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            ctx,
        }
    }

    /// Accept connections until `cancel` fires.
    pub async fn run(&self, listener: TcpListener, cancel: CancellationToken) -> Result<(), SshError> {
        info!("Jump SSH server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Jump SSH server stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        self.serve_stream(stream, Some(peer));
                    }
                    Err(e) => {
                        warn!("SSH accept failed: {}", e);
                    }
                }
            }
        }
    }

    /// Run one SSH connection over an arbitrary byte stream.
    pub fn serve_stream<S>(&self, stream: S, peer: Option<SocketAddr>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = JumpHandler::new(self.ctx.clone(), peer);
        let config = self.config.clone();

        tokio::spawn(async move {
            match server::run_stream(config, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        debug!("SSH session from {} ended: {}", describe_peer(peer), e);
                    }
                }
                Err(e) => {
                    warn!("SSH handshake from {} failed: {}", describe_peer(peer), e);
                }
            }
        });
    }

    /// Open an in-process connection to this server.
    pub fn connect_loopback(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(LOOPBACK_BUFFER);
        self.serve_stream(server, None);
        client
    }
}

fn describe_peer(peer: Option<SocketAddr>) -> String {
    peer.map(|p| p.to_string()).unwrap_or_else(|| "loopback".to_string())
}

pub struct JumpHandler {
    ctx: Arc<RelayContext>,
    peer: Option<SocketAddr>,
    /// Set once a key has been accepted
    identity: Option<Identity>,
    auth_cache: Option<AuthCache>,
}

impl JumpHandler {
    fn new(ctx: Arc<RelayContext>, peer: Option<SocketAddr>) -> Self {
        Self {
            ctx,
            peer,
            identity: None,
            auth_cache: None,
        }
    }

    async fn resolve(&self, user: &str) -> Result<(Identity, Arc<str>), AuthDenied> {
        let identity = match parse_identity(user, self.ctx.decryptor()) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Rejecting login from {}: {}", describe_peer(self.peer), e);
                return Err(AuthDenied::InvalidIdentity);
            }
        };

        let fetched = tokio::time::timeout(
            self.ctx.config.rpc_timeout(),
            self.ctx.rpc.get_ssh_authorized_keys(&identity),
        )
        .await;

        let keys = match fetched {
            Ok(Ok(keys)) => keys,
            Ok(Err(e)) => {
                warn!("{} could not fetch authorized keys: {}", identity.tag(), e);
                return Err(AuthDenied::KeysUnavailable);
            }
            Err(_) => {
                warn!("{} authorized keys request timed out", identity.tag());
                return Err(AuthDenied::KeysUnavailable);
            }
        };

        if keys.trim().is_empty() {
            warn!("{} device has no authorized keys", identity.tag());
            return Err(AuthDenied::KeysUnavailable);
        }

        Ok((identity, Arc::from(keys)))
    }

    /// Shared by the offer and the signed attempt.
    async fn check_key(&mut self, user: &str, key: &PublicKey) -> (Auth, Option<Identity>) {
        let cached = self
            .auth_cache
            .as_ref()
            .filter(|c| c.username == user)
            .map(|c| c.outcome.clone());

        let outcome = match cached {
            Some(outcome) => outcome,
            None => {
                let outcome = self.resolve(user).await;
                self.auth_cache = Some(AuthCache {
                    username: user.to_string(),
                    outcome: outcome.clone(),
                });
                outcome
            }
        };

        match outcome {
            Ok((identity, keys)) => {
                if offered_key_matches(key, &keys) {
                    (Auth::Accept, Some(identity))
                } else {
                    debug!("{} offered key is not authorized", identity.tag());
                    (reject_key(), None)
                }
            }
            Err(AuthDenied::InvalidIdentity) => (reject_user(), None),
            Err(AuthDenied::KeysUnavailable) => (reject_key(), None),
        }
    }
}

/// Another key may still work.
fn reject_key() -> Auth {
    Auth::Reject {
        proceed_with_methods: None,
        partial_success: false,
    }
}

/// Nothing will work for this username.
fn reject_user() -> Auth {
    let none: &[MethodKind] = &[];
    Auth::Reject {
        proceed_with_methods: Some(MethodSet::from(none)),
        partial_success: false,
    }
}

/// Text printed when someone opens a shell on the jump host itself.
pub fn usage_banner(identity: &Identity, jump_host: &str, port: u16, device_user: &str) -> String {
    let p = identity.provider;
    let d = &identity.dongle_id;
    format!(
        "SSH Proxy for {p}-{d}\r\n\
         \r\n\
         Use ProxyJump to connect:\r\n\
         \x20 ssh -J {p}-{d}@{jump_host}:{port} {device_user}@localhost\r\n\
         \r\n\
         Or add to ~/.ssh/config:\r\n\
         \x20 Host {d}\r\n\
         \x20   HostName localhost\r\n\
         \x20   User {device_user}\r\n\
         \x20   ProxyJump {p}-{d}@{jump_host}:{port}\r\n\
         \r\n"
    )
}

fn usage_line(identity: &Identity, jump_host: &str, port: u16, device_user: &str) -> String {
    format!(
        "Use: ssh -J {}-{}@{}:{} {}@localhost\r\n",
        identity.provider, identity.dongle_id, jump_host, port, device_user
    )
}

/// Ask the device to dial back; close the session if it cannot.
async fn request_dial_back(ctx: Arc<RelayContext>, tunnel: SessionHandle) {
    let identity = tunnel.identity().clone();
    let uri = ctx.config.device_ws_uri(tunnel.id());
    debug!("{} requesting dial-back to {}", identity.tag(), uri);

    let requested = tokio::time::timeout(
        ctx.config.rpc_timeout(),
        ctx.rpc.start_local_proxy(&identity, &uri, DEVICE_SSH_PORT),
    )
    .await;

    let failure = match requested {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(_) => RpcError::Timeout,
    };
    warn!("{} dial-back failed: {}", identity.tag(), failure);
    let reason = if failure.is_unreachable() {
        CloseReason::DeviceUnreachable(failure.to_string())
    } else {
        CloseReason::DeviceRejected(failure.to_string())
    };
    tunnel.close(reason).await;
}

impl server::Handler for JumpHandler {
    type Error = SshError;

    async fn auth_publickey_offered(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        let (auth, _) = self.check_key(user, public_key).await;
        Ok(auth)
    }

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        let (auth, identity) = self.check_key(user, public_key).await;
        if let Some(identity) = identity {
            info!("{} authenticated from {}", identity.tag(), describe_peer(self.peer));
            self.identity = Some(identity);
        }
        Ok(auth)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(identity) = self.identity.clone() else {
            return Ok(false);
        };

        // The destination is always the device's own sshd.
        debug!(
            "{} direct-tcpip to {}:{} from {}:{}",
            identity.tag(),
            host_to_connect,
            port_to_connect,
            originator_address,
            originator_port
        );

        let channel_id = channel.id();
        let ssh = session.handle();
        let hook: CloseHook = Box::new(move || {
            Box::pin(async move {
                let _ = ssh.close(channel_id).await;
            })
        });

        let options = self.ctx.session_options().with_close_hook(hook);
        let tunnel = self
            .ctx
            .registry
            .create_session(identity, Box::new(channel.into_stream()), options);

        tokio::spawn(request_dial_back(self.ctx.clone(), tunnel));
        Ok(true)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.identity.is_some())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        let Some(identity) = &self.identity else {
            let _ = session.channel_failure(channel);
            return Ok(());
        };
        let config = &self.ctx.config;
        let banner = usage_banner(identity, &config.jump_host, config.ssh_port, &config.device_ssh_user);

        let _ = session.channel_success(channel);
        let _ = session.data(channel, CryptoVec::from_slice(banner.as_bytes()));
        finish_channel(channel, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(identity) = &self.identity else {
            let _ = session.channel_failure(channel);
            return Ok(());
        };
        let config = &self.ctx.config;
        let line = usage_line(identity, &config.jump_host, config.ssh_port, &config.device_ssh_user);

        let _ = session.channel_success(channel);
        let _ = session.data(channel, CryptoVec::from_slice(line.as_bytes()));
        finish_channel(channel, session);
        Ok(())
    }
}

fn finish_channel(channel: ChannelId, session: &mut Session) {
    let _ = session.exit_status_request(channel, 0);
    let _ = session.eof(channel);
    let _ = session.close(channel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::athena::mock::MockDeviceRpc;
    use crate::config::generate_key;
    use crate::identity::Provider;
    use crate::session::SessionState;
    use crate::ssh::client::{connect_with_key, RelayClientHandler};
    use russh::client::Handle;
    use russh::keys::PrivateKey;
    use russh::ChannelMsg;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    const WAIT: Duration = Duration::from_secs(5);
    const USER: &str = "asius-abc123-tok1";

    struct Fixture {
        ctx: Arc<RelayContext>,
        rpc: Arc<MockDeviceRpc>,
        server: JumpServer,
        user_key: Arc<PrivateKey>,
    }

    fn fixture() -> Fixture {
        let user_key = Arc::new(generate_key().unwrap());
        let line = user_key.public_key().to_openssh().unwrap();
        let rpc = Arc::new(MockDeviceRpc::with_keys(format!("# device keys\n{} user@laptop\n", line)));
        let ctx = RelayContext::for_tests(rpc.clone());
        let server = JumpServer::new(ctx.clone());
        Fixture {
            ctx,
            rpc,
            server,
            user_key,
        }
    }

    async fn login(f: &Fixture, user: &str, key: Arc<PrivateKey>) -> Result<Handle<RelayClientHandler>, SshError> {
        connect_with_key(f.server.connect_loopback(), "test client", user, key, WAIT).await
    }

    /// `Handle` is not `Debug`, so failed logins are matched out by hand.
    async fn login_refused(f: &Fixture, user: &str, key: Arc<PrivateKey>) -> SshError {
        let Err(err) = login(f, user, key).await else {
            panic!("{} was let in", user);
        };
        err
    }

    fn session_id(uri: &str) -> &str {
        uri.rsplit('/').next().unwrap()
    }

    #[test]
    fn test_banner_text() {
        let identity = Identity::new(Provider::Asius, "abc123", "tok1");
        let banner = usage_banner(&identity, "ssh.asius.ai", 2222, "comma");
        assert!(banner.starts_with("SSH Proxy for asius-abc123\r\n"));
        assert!(banner.contains("  ssh -J asius-abc123@ssh.asius.ai:2222 comma@localhost\r\n"));
        assert!(banner.contains("  Host abc123\r\n"));
        assert!(banner.contains("    ProxyJump asius-abc123@ssh.asius.ai:2222\r\n"));
        assert!(!banner.contains("tok1"));
    }

    #[tokio::test]
    async fn test_tunnel_pairs_with_device() {
        let f = fixture();
        let handle = login(&f, USER, f.user_key.clone()).await.unwrap();

        let channel = handle
            .channel_open_direct_tcpip("localhost", 22, "127.0.0.1", 0)
            .await
            .unwrap();
        let mut client = channel.into_stream();
        client.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
        client.flush().await.unwrap();

        let calls = tokio::time::timeout(WAIT, f.rpc.wait_for_proxy_calls(1)).await.unwrap();
        assert_eq!(calls[0].username, USER);
        assert_eq!(calls[0].local_port, 22);
        assert!(calls[0].remote_ws_uri.starts_with("wss://"));

        let tunnel = f.ctx.registry.get(session_id(&calls[0].remote_ws_uri)).unwrap();
        assert_eq!(tunnel.identity().dongle_id, "abc123");

        let (device, mut device_peer) = duplex(64 * 1024);
        tunnel.attach_device(Box::new(device)).await.unwrap();

        let mut hello = [0u8; 21];
        tokio::time::timeout(WAIT, device_peer.read_exact(&mut hello))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&hello, b"SSH-2.0-OpenSSH_9.6\r\n");

        device_peer.write_all(b"SSH-2.0-dropbear\r\n").await.unwrap();
        let mut reply = [0u8; 18];
        tokio::time::timeout(WAIT, client.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply, b"SSH-2.0-dropbear\r\n");
        assert_eq!(tunnel.state(), SessionState::Paired);

        drop(device_peer);
        tokio::time::timeout(WAIT, tunnel.closed()).await.unwrap();
        assert!(f.ctx.registry.is_empty());
    }

    /// Open a tunnel whose dial-back fails and collect what the channel
    /// says before it closes.
    async fn failed_tunnel_output(f: &Fixture) -> String {
        let handle = login(f, USER, f.user_key.clone()).await.unwrap();
        let mut channel = handle
            .channel_open_direct_tcpip("localhost", 22, "127.0.0.1", 0)
            .await
            .unwrap();

        let mut received = Vec::new();
        let closed = tokio::time::timeout(WAIT, async {
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => received.extend_from_slice(&data),
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "channel was never closed");
        String::from_utf8(received).unwrap()
    }

    #[tokio::test]
    async fn test_offline_device_closes_channel() {
        let f = fixture();
        f.rpc.fail_proxy(RpcError::DeviceOffline);
        let received = failed_tunnel_output(&f).await;
        assert_eq!(received, "Device unreachable: device is offline\r\n");

        tokio::time::timeout(WAIT, async {
            while !f.ctx.registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(f.ctx.registry.removed_count(), 1);
    }

    #[tokio::test]
    async fn test_refused_dial_back_wording() {
        let f = fixture();
        f.rpc.fail_proxy(RpcError::Rejected("HTTP 500".into()));
        let received = failed_tunnel_output(&f).await;
        assert!(received.starts_with("Device rejected the connection: "), "{:?}", received);
        assert!(received.contains("HTTP 500"));
        assert!(!received.contains("unreachable"));
    }

    #[tokio::test]
    async fn test_unknown_key_rejected() {
        let f = fixture();
        let stranger = Arc::new(generate_key().unwrap());
        let err = login_refused(&f, USER, stranger).await;
        assert!(matches!(err, SshError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn test_invalid_username_rejected_without_rpc() {
        let f = fixture();
        let err = login_refused(&f, "nobody", f.user_key.clone()).await;
        assert!(matches!(err, SshError::AuthenticationFailed(_)));

        let err = login_refused(&f, "unknown-abc123-tok1", f.user_key.clone()).await;
        assert!(matches!(err, SshError::AuthenticationFailed(_)));
        assert_eq!(f.rpc.key_fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_key_list_rejected() {
        let f = fixture();
        *f.rpc.keys.lock() = Ok("\n# nothing here\n".to_string());
        let err = login_refused(&f, USER, f.user_key.clone()).await;
        assert!(matches!(err, SshError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn test_keys_fetched_once_per_connection() {
        let f = fixture();
        let handle = login(&f, USER, f.user_key.clone()).await.unwrap();
        // offered + signed attempt share one lookup
        assert_eq!(f.rpc.key_fetch_count(), 1);
        drop(handle);
    }

    #[tokio::test]
    async fn test_shell_prints_banner() {
        let f = fixture();
        let handle = login(&f, USER, f.user_key.clone()).await.unwrap();

        let mut channel = handle.channel_open_session().await.unwrap();
        channel.request_shell(true).await.unwrap();

        let mut output = Vec::new();
        let mut exit_status = None;
        tokio::time::timeout(WAIT, async {
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => output.extend_from_slice(&data),
                    ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }
        })
        .await
        .unwrap();

        let text = String::from_utf8(output).unwrap();
        assert!(text.starts_with("SSH Proxy for asius-abc123\r\n"));
        assert!(text.contains("comma@localhost"));
        assert_eq!(exit_status, Some(0));
        assert!(f.rpc.proxy_calls().is_empty());
    }

    #[tokio::test]
    async fn test_exec_prints_usage_line() {
        let f = fixture();
        let handle = login(&f, USER, f.user_key.clone()).await.unwrap();

        let mut channel = handle.channel_open_session().await.unwrap();
        channel.exec(true, "uptime").await.unwrap();

        let mut output = Vec::new();
        tokio::time::timeout(WAIT, async {
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => output.extend_from_slice(&data),
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(
            String::from_utf8(output).unwrap(),
            "Use: ssh -J asius-abc123@ssh.asius.ai:2222 comma@localhost\r\n"
        );
    }
}
