//! Relay startup and runtime errors

use thiserror::Error;

use crate::athena::RpcError;
use crate::config::ConfigError;
use crate::identity::TokenError;
use crate::ssh::SshError;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("TOKEN_PRIVATE_KEY: {0}")]
    TokenKey(#[from] TokenError),

    #[error("Device RPC client: {0}")]
    Rpc(#[from] RpcError),

    #[error("SSH server: {0}")]
    Ssh(#[from] SshError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
