//! Device RPC
//!
//! The relay never talks to devices directly. It asks the device-messaging
//! service ("Athena") to make the device dial back, or to report the keys
//! it currently trusts.

mod client;

pub use client::AthenaClient;

use async_trait::async_trait;
use thiserror::Error;

use crate::identity::Identity;

/// Port of the device's own sshd
pub const DEVICE_SSH_PORT: u16 = 22;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("device is offline")]
    DeviceOffline,

    #[error("device did not answer in time")]
    Timeout,

    #[error("device rejected the request: {0}")]
    Rejected(String),

    #[error("RPC transport error: {0}")]
    Transport(String),

    #[error("invalid RPC response: {0}")]
    InvalidResponse(String),
}

impl RpcError {
    /// Offline and timed-out devices are reported as unreachable.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, RpcError::DeviceOffline | RpcError::Timeout)
    }
}

#[async_trait]
pub trait DeviceRpc: Send + Sync {
    /// Ask the device to open a WebSocket to `remote_ws_uri` and pipe
    /// `local_port` through it.
    async fn start_local_proxy(
        &self,
        identity: &Identity,
        remote_ws_uri: &str,
        local_port: u16,
    ) -> Result<(), RpcError>;

    /// Newline-joined OpenSSH public keys the device currently accepts.
    async fn get_ssh_authorized_keys(&self, identity: &Identity) -> Result<String, RpcError>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted in-memory [`DeviceRpc`]

    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ProxyCall {
        pub username: String,
        pub remote_ws_uri: String,
        pub local_port: u16,
    }

    pub struct MockDeviceRpc {
        pub keys: Mutex<Result<String, RpcError>>,
        pub proxy_result: Mutex<Result<(), RpcError>>,
        pub proxy_delay: Mutex<Option<Duration>>,
        /// Username of every identity whose keys were requested
        pub key_lookups: Mutex<Vec<String>>,
        pub proxy_calls: Mutex<Vec<ProxyCall>>,
        pub proxy_notify: tokio::sync::Notify,
    }

    impl MockDeviceRpc {
        pub fn with_keys(keys: impl Into<String>) -> Self {
            Self {
                keys: Mutex::new(Ok(keys.into())),
                proxy_result: Mutex::new(Ok(())),
                proxy_delay: Mutex::new(None),
                key_lookups: Mutex::new(Vec::new()),
                proxy_calls: Mutex::new(Vec::new()),
                proxy_notify: tokio::sync::Notify::new(),
            }
        }

        pub fn fail_proxy(&self, err: RpcError) {
            *self.proxy_result.lock() = Err(err);
        }

        pub fn key_fetch_count(&self) -> usize {
            self.key_lookups.lock().len()
        }

        pub fn key_lookups(&self) -> Vec<String> {
            self.key_lookups.lock().clone()
        }

        pub fn proxy_calls(&self) -> Vec<ProxyCall> {
            self.proxy_calls.lock().clone()
        }

        /// Wait until `start_local_proxy` has been called at least `n` times.
        pub async fn wait_for_proxy_calls(&self, n: usize) -> Vec<ProxyCall> {
            loop {
                let notified = self.proxy_notify.notified();
                let calls = self.proxy_calls();
                if calls.len() >= n {
                    return calls;
                }
                notified.await;
            }
        }
    }

    #[async_trait]
    impl DeviceRpc for MockDeviceRpc {
        async fn start_local_proxy(
            &self,
            identity: &Identity,
            remote_ws_uri: &str,
            local_port: u16,
        ) -> Result<(), RpcError> {
            self.proxy_calls.lock().push(ProxyCall {
                username: identity.username(),
                remote_ws_uri: remote_ws_uri.to_string(),
                local_port,
            });
            self.proxy_notify.notify_waiters();
            let delay = *self.proxy_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.proxy_result.lock().clone()
        }

        async fn get_ssh_authorized_keys(&self, identity: &Identity) -> Result<String, RpcError> {
            self.key_lookups.lock().push(identity.username());
            self.keys.lock().clone()
        }
    }
}
