//! Global Session Registry
//!
//! Thread-safe session bookkeeping using DashMap for concurrent access.
//! The registry only stores handles; each session's streams and buffers
//! belong to its owner task, so unrelated sessions never contend on a lock.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::actor::{spawn_session, SessionHandle, SessionOptions};
use super::state::{CloseReason, SessionState};
use crate::bridge::BoxedStream;
use crate::identity::{Identity, Provider};

/// Registry snapshot of one tunnel session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub provider: Provider,
    pub dongle_id: String,
    pub state: SessionState,
    pub age: Duration,
}

impl fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}] session {} {} for {}s",
            self.provider,
            self.dongle_id,
            self.id,
            self.state,
            self.age.as_secs()
        )
    }
}

/// Browser terminal bookkeeping
struct TerminalEntry {
    identity: Identity,
    opened_at: Instant,
    cancel: CancellationToken,
}

pub struct SessionRegistry {
    /// Tunnel sessions by id
    sessions: DashMap<String, SessionHandle>,
    /// Browser terminals by id
    terminals: DashMap<String, TerminalEntry>,
    /// Number of sessions actually removed
    removed: AtomicUsize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            terminals: DashMap::new(),
            removed: AtomicUsize::new(0),
        }
    }

    /// Create a session for `client`, register it and start its owner task.
    pub fn create_session(
        self: &Arc<Self>,
        identity: Identity,
        client: BoxedStream,
        options: SessionOptions,
    ) -> SessionHandle {
        let id = uuid::Uuid::new_v4().to_string();
        let handle = spawn_session(self.clone(), id, identity, client, options);
        debug!("{} session {} registered", handle.identity().tag(), handle.id());
        handle
    }

    pub(super) fn insert(&self, handle: SessionHandle) {
        self.sessions.insert(handle.id().to_string(), handle);
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Remove a session. Only the first removal of an id counts.
    pub fn remove(&self, id: &str) -> Option<SessionHandle> {
        let removed = self.sessions.remove(id).map(|(_, handle)| handle);
        if removed.is_some() {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn removed_count(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| {
                let handle = entry.value();
                SessionInfo {
                    id: handle.id().to_string(),
                    provider: handle.identity().provider,
                    dongle_id: handle.identity().dongle_id.clone(),
                    state: handle.state(),
                    age: handle.age(),
                }
            })
            .collect()
    }

    /// Register a browser terminal. Dropping the guard unregisters it.
    pub fn open_terminal(self: &Arc<Self>, identity: Identity) -> TerminalGuard {
        let id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        self.terminals.insert(
            id.clone(),
            TerminalEntry {
                identity,
                opened_at: Instant::now(),
                cancel: cancel.clone(),
            },
        );
        TerminalGuard {
            registry: self.clone(),
            id,
            cancel,
        }
    }

    pub fn terminal_count(&self) -> usize {
        self.terminals.len()
    }

    /// One-line census for periodic and shutdown logs.
    pub fn summary(&self) -> String {
        let sessions = self.snapshot();
        let paired = sessions
            .iter()
            .filter(|info| info.state == SessionState::Paired)
            .count();
        format!(
            "tunnels: {} ({} paired), terminals: {}, closed: {}",
            sessions.len(),
            paired,
            self.terminal_count(),
            self.removed_count()
        )
    }

    /// Close sessions whose device never attached within `attach_window`
    /// and drop entries whose owner task has already exited.
    ///
    /// Returns how many sessions were acted on.
    pub fn reap(&self, attach_window: Duration) -> usize {
        let mut stale = Vec::new();
        let mut expired = Vec::new();

        for entry in self.sessions.iter() {
            let handle = entry.value();
            if handle.is_finished() {
                stale.push(handle.id().to_string());
            } else if handle.state() == SessionState::AwaitingDevice && handle.age() > attach_window {
                expired.push(handle.clone());
            }
        }

        for id in &stale {
            self.remove(id);
        }
        for handle in &expired {
            info!(
                "{} session {} never got a device, reaping",
                handle.identity().tag(),
                handle.id()
            );
            handle.try_close(CloseReason::AttachTimeout);
        }
        stale.len() + expired.len()
    }

    /// Periodically [`reap`](Self::reap) until `cancel` fires.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        attach_window: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = registry.reap(attach_window);
                        if reaped > 0 {
                            debug!("Reaper handled {} sessions", reaped);
                        }
                        if !registry.is_empty() || registry.terminal_count() > 0 {
                            debug!("Registry: {}", registry.summary());
                        }
                    }
                }
            }
        })
    }

    /// Close every session and terminal, waiting for tunnel teardown.
    pub async fn close_all(&self, reason: CloseReason) {
        for entry in self.terminals.iter() {
            debug!(
                "{} closing terminal open for {:?}",
                entry.value().identity.tag(),
                entry.value().opened_at.elapsed()
            );
            entry.value().cancel.cancel();
        }

        let handles: Vec<SessionHandle> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for handle in &handles {
            handle.close(reason.clone()).await;
        }
        for handle in &handles {
            handle.closed().await;
        }
    }
}

/// Keeps a browser terminal registered while alive
pub struct TerminalGuard {
    registry: Arc<SessionRegistry>,
    id: String,
    cancel: CancellationToken,
}

impl TerminalGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Fires when the relay wants this terminal closed.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        self.registry.terminals.remove(&self.id);
    }
}
