//! Key material for the jump server and the browser relay's SSH clients

use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::Algorithm;
use russh::keys::PrivateKey;
use std::sync::Arc;
use tracing::{info, warn};

use super::{ConfigError, RelayConfig};

#[derive(Clone)]
pub struct RelayKeys {
    /// Host key presented by the jump server
    pub host_key: Arc<PrivateKey>,
    /// Key the relay authenticates with, both to itself and to devices
    pub client_key: Arc<PrivateKey>,
}

pub fn load_relay_keys(config: &RelayConfig) -> Result<RelayKeys, ConfigError> {
    let host_key = match &config.ssh_private_key {
        Some(text) => russh::keys::decode_secret_key(text, None)
            .map_err(|e| ConfigError::Key(format!("SSH_PRIVATE_KEY: {}", e)))?,
        None => {
            warn!("SSH_PRIVATE_KEY not set, generating an ephemeral Ed25519 host key");
            generate_key()?
        }
    };
    let host_key = Arc::new(host_key);

    let client_key = match &config.browser_ssh_key_path {
        Some(path) => {
            info!("Loading browser relay key from {}", path.display());
            let key = russh::keys::load_secret_key(path, None)
                .map_err(|e| ConfigError::Key(format!("{}: {}", path.display(), e)))?;
            Arc::new(key)
        }
        None => host_key.clone(),
    };

    Ok(RelayKeys {
        host_key,
        client_key,
    })
}

pub(crate) fn generate_key() -> Result<PrivateKey, ConfigError> {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(|e| ConfigError::Key(e.to_string()))
}
