//! Relay Configuration
//!
//! Settings come from an optional JSON file (`RELAY_CONFIG`) with
//! environment variables layered on top. Every field has a default so an
//! empty environment yields a working development relay.

mod keys;
mod storage;

pub use keys::{load_relay_keys, RelayKeys};
#[cfg(test)]
pub(crate) use keys::generate_key;
pub use storage::{load_config_file, ConfigError};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::bridge::FlowLimits;
use crate::identity::Provider;

/// Device RPC endpoints, one per provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AthenaUrls {
    pub asius: String,
    pub comma: String,
    pub konik: String,
}

impl Default for AthenaUrls {
    fn default() -> Self {
        Self {
            asius: "https://api.asius.ai".to_string(),
            comma: "https://athena-comma-proxy.asius.ai".to_string(),
            konik: "https://api-konik-proxy.asius.ai/ws".to_string(),
        }
    }
}

impl AthenaUrls {
    pub fn for_provider(&self, provider: Provider) -> &str {
        match provider {
            Provider::Asius => &self.asius,
            Provider::Comma => &self.comma,
            Provider::Konik => &self.konik,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address both listeners bind to
    pub bind_addr: String,
    /// Jump SSH server port
    pub ssh_port: u16,
    /// WebSocket / HTTP port
    pub ws_port: u16,
    /// Public WebSocket origin devices dial back to
    pub ws_origin: String,
    /// Public host name shown in the usage banner
    pub jump_host: String,
    /// Account used on the device's own sshd by the browser relay
    pub device_ssh_user: String,
    /// Upper bound of bytes held while a session waits for its peer
    pub max_buffer_size: usize,
    /// Outbound buffered bytes above which a source is paused
    pub high_water_mark: usize,
    pub device_attach_timeout_secs: u64,
    pub rpc_timeout_secs: u64,
    pub reaper_interval_secs: u64,
    pub athena: AthenaUrls,
    /// Redirect target for `GET /`
    pub docs_url: String,
    /// OpenSSH private key text for the host key
    pub ssh_private_key: Option<String>,
    /// Client key used by the browser relay (defaults to the host key)
    pub browser_ssh_key_path: Option<PathBuf>,
    /// Base64 X25519 secret for `enc.` tokens
    pub token_private_key: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            ssh_port: 2222,
            ws_port: 8080,
            ws_origin: "wss://ssh.asius.ai".to_string(),
            jump_host: "ssh.asius.ai".to_string(),
            device_ssh_user: "comma".to_string(),
            max_buffer_size: 1024 * 1024,
            high_water_mark: 64 * 1024,
            device_attach_timeout_secs: 30,
            rpc_timeout_secs: 15,
            reaper_interval_secs: 30,
            athena: AthenaUrls::default(),
            docs_url: "https://asius.ai/docs/ssh".to_string(),
            ssh_private_key: None,
            browser_ssh_key_path: None,
            token_private_key: None,
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("bind_addr", &self.bind_addr)
            .field("ssh_port", &self.ssh_port)
            .field("ws_port", &self.ws_port)
            .field("ws_origin", &self.ws_origin)
            .field("jump_host", &self.jump_host)
            .field("device_ssh_user", &self.device_ssh_user)
            .field("max_buffer_size", &self.max_buffer_size)
            .field("high_water_mark", &self.high_water_mark)
            .field("device_attach_timeout_secs", &self.device_attach_timeout_secs)
            .field("rpc_timeout_secs", &self.rpc_timeout_secs)
            .field("athena", &self.athena)
            .field("ssh_private_key", &self.ssh_private_key.as_ref().map(|_| "<set>"))
            .field("browser_ssh_key_path", &self.browser_ssh_key_path)
            .field("token_private_key", &self.token_private_key.as_ref().map(|_| "<set>"))
            .finish_non_exhaustive()
    }
}

impl RelayConfig {
    /// Load from `RELAY_CONFIG` (if set) and the process environment.
    pub async fn from_env() -> Result<Self, ConfigError> {
        let base = match std::env::var("RELAY_CONFIG") {
            Ok(path) => load_config_file(Path::new(&path)).await?,
            Err(_) => Self::default(),
        };
        base.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply environment-style overrides through `lookup`, then validate.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = lookup("SSH_PORT") {
            self.ssh_port = parse_var("SSH_PORT", &v)?;
        }
        if let Some(v) = lookup("WS_PORT") {
            self.ws_port = parse_var("WS_PORT", &v)?;
        }
        if let Some(v) = lookup("WS_ORIGIN") {
            self.ws_origin = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = lookup("JUMP_HOST") {
            self.jump_host = v;
        }
        if let Some(v) = lookup("DEVICE_SSH_USER") {
            self.device_ssh_user = v;
        }
        if let Some(v) = lookup("MAX_BUFFER_SIZE") {
            self.max_buffer_size = parse_var("MAX_BUFFER_SIZE", &v)?;
        }
        if let Some(v) = lookup("HIGH_WATER_MARK") {
            self.high_water_mark = parse_var("HIGH_WATER_MARK", &v)?;
        }
        if let Some(v) = lookup("DEVICE_ATTACH_TIMEOUT_SECS") {
            self.device_attach_timeout_secs = parse_var("DEVICE_ATTACH_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("RPC_TIMEOUT_SECS") {
            self.rpc_timeout_secs = parse_var("RPC_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("REAPER_INTERVAL_SECS") {
            self.reaper_interval_secs = parse_var("REAPER_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("ATHENA_URL_ASIUS") {
            self.athena.asius = v;
        }
        if let Some(v) = lookup("ATHENA_URL_COMMA") {
            self.athena.comma = v;
        }
        if let Some(v) = lookup("ATHENA_URL_KONIK") {
            self.athena.konik = v;
        }
        if let Some(v) = lookup("DOCS_URL") {
            self.docs_url = v;
        }
        if let Some(v) = lookup("SSH_PRIVATE_KEY") {
            // Keys passed through env files usually carry escaped newlines
            self.ssh_private_key = Some(v.replace("\\n", "\n"));
        }
        if let Some(v) = lookup("BROWSER_SSH_KEY_PATH") {
            self.browser_ssh_key_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("TOKEN_PRIVATE_KEY") {
            self.token_private_key = Some(v);
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.high_water_mark == 0 {
            return Err(ConfigError::Invalid("high_water_mark must be non-zero".into()));
        }
        if self.max_buffer_size == 0 {
            return Err(ConfigError::Invalid("max_buffer_size must be non-zero".into()));
        }
        if self.device_attach_timeout_secs == 0 || self.rpc_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    pub fn flow_limits(&self) -> FlowLimits {
        FlowLimits::new(self.high_water_mark, self.max_buffer_size)
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_secs(self.device_attach_timeout_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    /// URL a device must dial back to for `session_id`.
    pub fn device_ws_uri(&self, session_id: &str) -> String {
        format!("{}/ssh/{}", self.ws_origin.trim_end_matches('/'), session_id)
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
