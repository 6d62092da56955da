//! Session Owner Task
//!
//! Every relay session is owned by exactly one task. The client stream,
//! the device stream and the pending buffer live inside that task; the
//! rest of the relay talks to it through a cloneable [`SessionHandle`]
//! that sends [`SessionCommand`]s over an mpsc channel.
//!
//! Attaching the device and closing the session are both commands, so
//! they are serialized by the mailbox: an attach can never interleave with
//! a concurrent close of the same session.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::registry::SessionRegistry;
use super::state::{CloseReason, SessionState};
use crate::bridge::{bridge, BoxedStream, FlowLimits, PendingBuffer, Side};
use crate::identity::Identity;

/// Read size while waiting for the device
const READ_CHUNK: usize = 16 * 1024;
/// Upper bound on each shutdown step during teardown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const COMMAND_CAPACITY: usize = 16;

/// Extra cleanup run once after both streams are shut down
pub type CloseHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

pub enum SessionCommand {
    /// Hand the device-side stream to the session
    AttachDevice {
        stream: BoxedStream,
        reply: oneshot::Sender<Result<(), AttachRejected>>,
    },
    Close { reason: CloseReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachError {
    /// A device is already attached to this session
    AlreadyAttached,
    /// The session is gone
    Closed,
}

/// A refused attach. The stream is handed back so the caller can close it.
pub struct AttachRejected {
    pub reason: AttachError,
    pub stream: Option<BoxedStream>,
}

impl std::fmt::Debug for AttachRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachRejected")
            .field("reason", &self.reason)
            .field("stream", &self.stream.is_some())
            .finish()
    }
}

pub struct SessionOptions {
    pub limits: FlowLimits,
    pub attach_timeout: Duration,
    pub close_hook: Option<CloseHook>,
}

impl SessionOptions {
    pub fn new(limits: FlowLimits, attach_timeout: Duration) -> Self {
        Self {
            limits,
            attach_timeout,
            close_hook: None,
        }
    }

    pub fn with_close_hook(mut self, hook: CloseHook) -> Self {
        self.close_hook = Some(hook);
        self
    }
}

/// Cloneable reference to a running session
#[derive(Clone)]
pub struct SessionHandle {
    id: Arc<str>,
    identity: Arc<Identity>,
    created_at: Instant,
    cmd_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// True once the owner task has stopped accepting commands.
    pub fn is_finished(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    /// Attach the device side. Fails if one is already attached or the
    /// session has closed.
    pub async fn attach_device(&self, stream: BoxedStream) -> Result<(), AttachRejected> {
        let (reply, reply_rx) = oneshot::channel();
        let cmd = SessionCommand::AttachDevice { stream, reply };
        if let Err(mpsc::error::SendError(cmd)) = self.cmd_tx.send(cmd).await {
            let stream = match cmd {
                SessionCommand::AttachDevice { stream, .. } => Some(stream),
                SessionCommand::Close { .. } => None,
            };
            return Err(AttachRejected {
                reason: AttachError::Closed,
                stream,
            });
        }
        reply_rx.await.unwrap_or(Err(AttachRejected {
            reason: AttachError::Closed,
            stream: None,
        }))
    }

    /// Ask the session to close. Closing an already closed session is a no-op.
    pub async fn close(&self, reason: CloseReason) {
        let _ = self.cmd_tx.send(SessionCommand::Close { reason }).await;
    }

    /// Non-blocking variant of [`close`](Self::close) for sweeps. A full
    /// mailbox hands the close to a background send.
    pub fn try_close(&self, reason: CloseReason) {
        match self.cmd_tx.try_send(SessionCommand::Close { reason }) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(cmd)) => {
                warn!("Session {} mailbox full, queueing close", self.id);
                let cmd_tx = self.cmd_tx.clone();
                tokio::spawn(async move {
                    let _ = cmd_tx.send(cmd).await;
                });
            }
        }
    }

    /// Wait until teardown has finished.
    pub async fn closed(&self) {
        let mut rx = self.state_rx.clone();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }
}

/// Build the handle, register it, then start the owner task.
pub(super) fn spawn_session(
    registry: Arc<SessionRegistry>,
    id: String,
    identity: Identity,
    client: BoxedStream,
    options: SessionOptions,
) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (state_tx, state_rx) = watch::channel(SessionState::AwaitingDevice);
    let identity = Arc::new(identity);

    let handle = SessionHandle {
        id: Arc::from(id.as_str()),
        identity: identity.clone(),
        created_at: Instant::now(),
        cmd_tx,
        state_rx,
    };
    registry.insert(handle.clone());

    let actor = SessionActor {
        tag: format!("{} session {}", identity.tag(), id),
        id,
        registry,
        limits: options.limits,
        attach_deadline: tokio::time::Instant::now() + options.attach_timeout,
        close_hook: options.close_hook,
        cmd_rx,
        state_tx,
    };
    tokio::spawn(actor.run(client));

    handle
}

enum AwaitOutcome {
    Attached(BoxedStream, PendingBuffer),
    Closed(CloseReason),
}

struct SessionActor {
    id: String,
    tag: String,
    registry: Arc<SessionRegistry>,
    limits: FlowLimits,
    attach_deadline: tokio::time::Instant,
    close_hook: Option<CloseHook>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionActor {
    async fn run(mut self, mut client: BoxedStream) {
        debug!("{} waiting for device", self.tag);

        let (reason, device) = match self.await_device(&mut client).await {
            AwaitOutcome::Attached(mut device, pending) => {
                info!("{} device connected", self.tag);
                let reason = self.run_paired(&mut client, &mut device, pending).await;
                (reason, Some(device))
            }
            AwaitOutcome::Closed(reason) => (reason, None),
        };

        self.teardown(client, device, reason).await;
    }

    async fn await_device(&mut self, client: &mut BoxedStream) -> AwaitOutcome {
        let mut pending = PendingBuffer::new(self.limits.max_pending);
        let mut buf = vec![0u8; READ_CHUNK];
        let deadline = tokio::time::sleep_until(self.attach_deadline);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(SessionCommand::AttachDevice { stream, reply }) => {
                        let _ = reply.send(Ok(()));
                        return AwaitOutcome::Attached(stream, pending);
                    }
                    Some(SessionCommand::Close { reason }) => return AwaitOutcome::Closed(reason),
                    None => return AwaitOutcome::Closed(CloseReason::Shutdown),
                },
                read = client.read(&mut buf) => match read {
                    Ok(0) => return AwaitOutcome::Closed(CloseReason::ClientClosed),
                    Ok(n) => {
                        if let Err(overflow) = pending.push(Bytes::copy_from_slice(&buf[..n])) {
                            warn!("{} {}", self.tag, overflow);
                            return AwaitOutcome::Closed(CloseReason::BufferOverflow {
                                attempted: overflow.attempted,
                                limit: overflow.limit,
                            });
                        }
                    }
                    Err(e) => return AwaitOutcome::Closed(CloseReason::TransportError(e.to_string())),
                },
                _ = &mut deadline => return AwaitOutcome::Closed(CloseReason::AttachTimeout),
            }
        }
    }

    async fn run_paired(
        &mut self,
        client: &mut BoxedStream,
        device: &mut BoxedStream,
        mut pending: PendingBuffer,
    ) -> CloseReason {
        let flushed = pending.len_bytes();
        for chunk in pending.drain() {
            if let Err(e) = device.write_all(&chunk).await {
                return CloseReason::TransportError(e.to_string());
            }
        }
        if let Err(e) = device.flush().await {
            return CloseReason::TransportError(e.to_string());
        }
        if flushed > 0 {
            debug!("{} flushed {} pending bytes", self.tag, flushed);
        }

        self.state_tx.send_replace(SessionState::Paired);

        let limits = self.limits;
        let bridged = bridge(client, device, &limits);
        tokio::pin!(bridged);

        loop {
            tokio::select! {
                outcome = &mut bridged => {
                    return match (outcome.error, outcome.ended_by) {
                        (Some(e), _) => CloseReason::TransportError(e.to_string()),
                        (None, Side::Client) => CloseReason::ClientClosed,
                        (None, Side::Device) => CloseReason::DeviceClosed,
                    };
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(SessionCommand::AttachDevice { stream, reply }) => {
                        warn!("{} second device attach rejected", self.tag);
                        let _ = reply.send(Err(AttachRejected {
                            reason: AttachError::AlreadyAttached,
                            stream: Some(stream),
                        }));
                    }
                    Some(SessionCommand::Close { reason }) => return reason,
                    None => return CloseReason::Shutdown,
                },
            }
        }
    }

    async fn teardown(mut self, mut client: BoxedStream, device: Option<BoxedStream>, reason: CloseReason) {
        self.state_tx.send_replace(SessionState::Closing);
        info!("{} closing: {}", self.tag, reason);

        if device.is_none() {
            if let Some(line) = reason.diagnostic() {
                let _ = tokio::time::timeout(SHUTDOWN_GRACE, client.write_all(line.as_bytes())).await;
            }
        }
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, client.shutdown()).await;
        drop(client);

        if let Some(mut device) = device {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, device.shutdown()).await;
        }

        if let Some(hook) = self.close_hook.take() {
            hook().await;
        }

        self.registry.remove(&self.id);

        // Refuse anything still queued so callers get their streams back.
        self.cmd_rx.close();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            if let SessionCommand::AttachDevice { stream, reply } = cmd {
                let _ = reply.send(Err(AttachRejected {
                    reason: AttachError::Closed,
                    stream: Some(stream),
                }));
            }
        }

        self.state_tx.send_replace(SessionState::Closed);
        debug!("{} closed", self.tag);
    }
}
