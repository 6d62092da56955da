//! Relay wiring
//!
//! [`RelayContext`] holds everything shared by the jump server and the
//! WebSocket gateway. [`Relay`] binds both listeners, runs the reaper and
//! drains every session on shutdown.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::athena::{AthenaClient, DeviceRpc};
use crate::config::{load_relay_keys, RelayConfig, RelayKeys};
use crate::error::RelayError;
use crate::gateway::Gateway;
use crate::identity::{SealedTokenDecryptor, TokenDecryptor};
use crate::session::{CloseReason, SessionOptions, SessionRegistry};
use crate::ssh::JumpServer;

pub struct RelayContext {
    pub config: RelayConfig,
    pub registry: Arc<SessionRegistry>,
    pub rpc: Arc<dyn DeviceRpc>,
    pub decryptor: Option<Arc<dyn TokenDecryptor>>,
    pub keys: RelayKeys,
}

impl RelayContext {
    pub fn new(
        config: RelayConfig,
        rpc: Arc<dyn DeviceRpc>,
        decryptor: Option<Arc<dyn TokenDecryptor>>,
        keys: RelayKeys,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            rpc,
            decryptor,
            keys,
        })
    }

    /// Build the production context: Athena client, keys and token key.
    pub fn from_config(config: RelayConfig) -> Result<Arc<Self>, RelayError> {
        let keys = load_relay_keys(&config)?;
        let rpc = AthenaClient::new(config.athena.clone(), config.rpc_timeout())?;

        let decryptor: Option<Arc<dyn TokenDecryptor>> = match &config.token_private_key {
            Some(encoded) => Some(Arc::new(SealedTokenDecryptor::from_base64(encoded)?)),
            None => {
                warn!("TOKEN_PRIVATE_KEY not set, encrypted tokens will be rejected");
                None
            }
        };

        Ok(Self::new(config, Arc::new(rpc), decryptor, keys))
    }

    pub fn decryptor(&self) -> Option<&dyn TokenDecryptor> {
        self.decryptor.as_deref()
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions::new(self.config.flow_limits(), self.config.attach_timeout())
    }

    #[cfg(test)]
    pub(crate) fn for_tests(rpc: Arc<dyn DeviceRpc>) -> Arc<Self> {
        use crate::identity::token::tests::test_decryptor;

        let key = Arc::new(crate::config::generate_key().unwrap());
        let keys = RelayKeys {
            host_key: key.clone(),
            client_key: key,
        };
        Self::new(
            RelayConfig::default(),
            rpc,
            Some(Arc::new(test_decryptor())),
            keys,
        )
    }
}

pub struct Relay {
    ctx: Arc<RelayContext>,
    jump: Arc<JumpServer>,
}

impl Relay {
    pub fn new(ctx: Arc<RelayContext>) -> Self {
        let jump = Arc::new(JumpServer::new(ctx.clone()));
        Self { ctx, jump }
    }

    /// Bind the configured ports and serve until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), RelayError> {
        let config = &self.ctx.config;
        let ssh_listener = TcpListener::bind((config.bind_addr.as_str(), config.ssh_port)).await?;
        let ws_listener = TcpListener::bind((config.bind_addr.as_str(), config.ws_port)).await?;
        self.serve(ssh_listener, ws_listener, cancel).await
    }

    pub async fn serve(
        &self,
        ssh_listener: TcpListener,
        ws_listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), RelayError> {
        let registry = self.ctx.registry.clone();
        let reaper = registry.spawn_reaper(
            self.ctx.config.reaper_interval(),
            self.ctx.config.attach_timeout(),
            cancel.clone(),
        );

        let gateway = Gateway::new(self.ctx.clone(), self.jump.clone());
        let served = tokio::try_join!(
            async {
                self.jump
                    .run(ssh_listener, cancel.clone())
                    .await
                    .map_err(RelayError::from)
            },
            async {
                gateway
                    .run(ws_listener, cancel.clone())
                    .await
                    .map_err(RelayError::from)
            },
        );
        // A failed listener takes the whole relay down.
        cancel.cancel();

        info!("Shutting down, {}", registry.summary());
        for session in registry.snapshot() {
            debug!("Closing {}", session);
        }
        registry.close_all(CloseReason::Shutdown).await;
        let _ = reaper.await;

        served.map(|_| ())
    }
}
